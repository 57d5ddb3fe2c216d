//! Top-level orchestration.
//!
//! A [`Kernel`] binds one mesh to one distributed parameter set and owns
//! the DOF managers created for it. Ownership is decided once at
//! construction: the kernel owns mesh, parameters and managers outright,
//! and managers borrow the mesh per call.

use ferrox_comm::Communicator;
use log::info;

use crate::dof::DofManager;
use crate::mesh::Mesh;
use crate::params::KernelParameters;
use crate::weakform::{create_module, PhysicsModule, PhysicsTag, WeakFormModule};
use crate::Real;

pub struct Kernel<T: Real> {
    mesh: Mesh<T>,
    params: KernelParameters,
    managers: Vec<DofManager<T>>,
}

impl<T: Real> Kernel<T> {
    /// Binds `mesh` and distributed `params`.
    ///
    /// The parameter distribution step has already validated the rank
    /// selection; an empty selection here means the value was constructed
    /// outside that step, which is a contract violation.
    pub fn new(mesh: Mesh<T>, params: KernelParameters) -> Self {
        assert!(
            !params.selected_ranks().is_empty(),
            "kernel constructed from parameters without a rank selection"
        );
        Self {
            mesh,
            params,
            managers: Vec::new(),
        }
    }

    /// Instantiates the module for `tag` and wraps it in a new DOF manager
    /// bound to this kernel's selections. Returns the manager's handle.
    pub fn create_field(&mut self, tag: PhysicsTag) -> eyre::Result<usize> {
        self.add_equation(create_module(tag))
    }

    /// Wraps an existing module in a new DOF manager.
    pub fn add_equation(&mut self, module: PhysicsModule<T>) -> eyre::Result<usize> {
        info!("adding equation '{}'", module.name());
        let manager = DofManager::new(module, &self.params)?;
        self.managers.push(manager);
        Ok(self.managers.len() - 1)
    }

    /// Master status relative to this kernel's *selected* rank subset: the
    /// lowest selected rank is the kernel master, which need not be global
    /// rank 0.
    pub fn is_master<C: Communicator>(&self, comm: &C) -> bool {
        self.params.selected_ranks().iter().min() == Some(&comm.rank())
    }

    /// Whether the calling rank participates in this kernel at all.
    pub fn is_selected<C: Communicator>(&self, comm: &C) -> bool {
        self.params.selected_ranks().contains(&comm.rank())
    }

    pub fn params(&self) -> &KernelParameters {
        &self.params
    }

    pub fn mesh(&self) -> &Mesh<T> {
        &self.mesh
    }

    pub fn mesh_mut(&mut self) -> &mut Mesh<T> {
        &mut self.mesh
    }

    pub fn num_equations(&self) -> usize {
        self.managers.len()
    }

    pub fn manager(&self, index: usize) -> &DofManager<T> {
        &self.managers[index]
    }

    pub fn manager_mut(&mut self, index: usize) -> &mut DofManager<T> {
        &mut self.managers[index]
    }

    /// Splits the borrow so a manager and the mesh can be handed to the
    /// transient adapter together.
    pub fn problem_parts(&mut self, index: usize) -> (&mut DofManager<T>, &mut Mesh<T>) {
        let Self { mesh, managers, .. } = self;
        (&mut managers[index], mesh)
    }
}
