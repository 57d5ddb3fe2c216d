//! Weak-form modules: pluggable per-element physics.
//!
//! A module computes one element's discretized Jacobian and right-hand side
//! for a given formulation. Modules are created once per physics
//! configuration by the closed [`create_module`] factory and reused for the
//! whole run, linked to exactly one block at a time.

use nalgebra::{DMatrixViewMut, DVectorViewMut, Point2};

use crate::dof::BlockHandle;
use crate::mesh::Mesh;
use crate::nonlinear::NonlinearAlgorithm;
use crate::quadrature::QuadratureRule;
use crate::Real;

pub mod heat;
pub mod magnetodynamics;

pub use heat::HeatConduction;
pub use magnetodynamics::MagnetodynamicsAz;

/// Physics/discretization tag resolved by the factory.
///
/// Deliberately a closed enumeration: dispatch into the numeric kernels is
/// a compile-time `match`, not an open plugin registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PhysicsTag {
    /// Transient magnetic diffusion, out-of-plane vector potential.
    MagnetodynamicsAz,
    /// Transient heat conduction.
    HeatConduction,
}

/// Physics domain tag carried by block and side set handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DomainType {
    Air,
    Ferromagnetic,
    Superconducting,
    Conductor,
    /// Dirichlet constraint on the magnetic potential.
    FixedPotential,
    /// Dirichlet constraint on temperature.
    FixedTemperature,
}

impl DomainType {
    /// Stable wire encoding used when parameter selections are broadcast.
    pub fn to_wire(self) -> u64 {
        match self {
            DomainType::Air => 0,
            DomainType::Ferromagnetic => 1,
            DomainType::Superconducting => 2,
            DomainType::Conductor => 3,
            DomainType::FixedPotential => 4,
            DomainType::FixedTemperature => 5,
        }
    }

    pub fn from_wire(value: u64) -> eyre::Result<Self> {
        Ok(match value {
            0 => DomainType::Air,
            1 => DomainType::Ferromagnetic,
            2 => DomainType::Superconducting,
            3 => DomainType::Conductor,
            4 => DomainType::FixedPotential,
            5 => DomainType::FixedTemperature,
            _ => eyre::bail!("invalid domain type encoding {}", value),
        })
    }
}

/// One unknown field carried by a module, with its per-node component count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub label: &'static str,
    pub components: usize,
}

impl FieldSpec {
    /// Label of the previous-time-step companion array.
    pub fn history_label(&self) -> String {
        format!("{}_prev", self.label)
    }
}

/// A Dirichlet constraint on one DOF, stated in mesh entity terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodalConstraint<T> {
    pub node_id: u64,
    pub component: usize,
    pub value: T,
}

/// Per-element geometry and state handed to a module.
///
/// `u_iter` holds the previous nonlinear iterate and `u_step` the previous
/// time step, both node-major over the module's field components.
#[derive(Debug)]
pub struct ElementContext<'a, T: Real> {
    pub element_id: u64,
    pub vertices: [Point2<T>; 3],
    pub u_iter: &'a [T],
    pub u_step: &'a [T],
    pub quadrature: &'a QuadratureRule<T>,
}

/// The capability set of a per-physics element formulation.
///
/// Contract: with a fixed algorithm and unchanged element state, repeated
/// calls to [`WeakFormModule::compute_jacobian_and_rhs`] produce
/// bit-identical output. The same state may legitimately produce a
/// *different* Jacobian under Picard than under Newton-Raphson.
pub trait WeakFormModule<T: Real> {
    fn name(&self) -> &'static str;

    /// The unknown fields this module solves for.
    fn fields(&self) -> &[FieldSpec];

    /// Registers the blocks this module integrates over.
    fn set_blocks(&mut self, ids: &[u64], domain_types: &[DomainType]) -> eyre::Result<()>;

    /// Registers the side sets carrying this module's boundary conditions.
    fn set_sidesets(&mut self, ids: &[u64], domain_types: &[DomainType]) -> eyre::Result<()>;

    /// Binds the module to one block, resolving the material regime for the
    /// lifetime of the link. Must be called before element computations.
    fn link_to_block(&mut self, handle: &BlockHandle) -> eyre::Result<()>;

    fn set_timestep(&mut self, dt: T);

    fn timestep(&self) -> T;

    /// Sets the implicit/explicit blend parameter of the time integration
    /// (1 = backward Euler, 0 = forward Euler).
    fn set_euler_method(&mut self, theta: T);

    /// Advances the time-history buffers after a converged step.
    fn shift_fields(&mut self, mesh: &mut Mesh<T>) -> eyre::Result<()>;

    /// Evaluates the boundary constraints at `time` over the registered
    /// side sets.
    fn compute_boundary_conditions(
        &self,
        time: T,
        mesh: &Mesh<T>,
    ) -> eyre::Result<Vec<NodalConstraint<T>>>;

    /// Adds one element's dense Jacobian and right-hand side contribution
    /// into the provided (zeroed) output views.
    fn compute_jacobian_and_rhs(
        &self,
        context: &ElementContext<'_, T>,
        jacobian: DMatrixViewMut<'_, T>,
        rhs: DVectorViewMut<'_, T>,
        algorithm: NonlinearAlgorithm,
    ) -> eyre::Result<()>;
}

/// The closed set of concrete modules.
///
/// A tagged union rather than a trait object so the factory stays a total
/// compile-time switch and per-element calls remain inlineable.
#[derive(Debug)]
pub enum PhysicsModule<T: Real> {
    Magnetodynamics(MagnetodynamicsAz<T>),
    Heat(HeatConduction<T>),
}

/// Resolves a physics tag to a concrete module with default materials.
pub fn create_module<T: Real>(tag: PhysicsTag) -> PhysicsModule<T> {
    match tag {
        PhysicsTag::MagnetodynamicsAz => {
            PhysicsModule::Magnetodynamics(MagnetodynamicsAz::new())
        }
        PhysicsTag::HeatConduction => PhysicsModule::Heat(HeatConduction::new()),
    }
}

macro_rules! delegate {
    ($self:ident, $module:ident => $body:expr) => {
        match $self {
            PhysicsModule::Magnetodynamics($module) => $body,
            PhysicsModule::Heat($module) => $body,
        }
    };
}

impl<T: Real> WeakFormModule<T> for PhysicsModule<T> {
    fn name(&self) -> &'static str {
        delegate!(self, module => module.name())
    }

    fn fields(&self) -> &[FieldSpec] {
        delegate!(self, module => module.fields())
    }

    fn set_blocks(&mut self, ids: &[u64], domain_types: &[DomainType]) -> eyre::Result<()> {
        delegate!(self, module => module.set_blocks(ids, domain_types))
    }

    fn set_sidesets(&mut self, ids: &[u64], domain_types: &[DomainType]) -> eyre::Result<()> {
        delegate!(self, module => module.set_sidesets(ids, domain_types))
    }

    fn link_to_block(&mut self, handle: &BlockHandle) -> eyre::Result<()> {
        delegate!(self, module => module.link_to_block(handle))
    }

    fn set_timestep(&mut self, dt: T) {
        delegate!(self, module => module.set_timestep(dt))
    }

    fn timestep(&self) -> T {
        delegate!(self, module => module.timestep())
    }

    fn set_euler_method(&mut self, theta: T) {
        delegate!(self, module => module.set_euler_method(theta))
    }

    fn shift_fields(&mut self, mesh: &mut Mesh<T>) -> eyre::Result<()> {
        delegate!(self, module => module.shift_fields(mesh))
    }

    fn compute_boundary_conditions(
        &self,
        time: T,
        mesh: &Mesh<T>,
    ) -> eyre::Result<Vec<NodalConstraint<T>>> {
        delegate!(self, module => module.compute_boundary_conditions(time, mesh))
    }

    fn compute_jacobian_and_rhs(
        &self,
        context: &ElementContext<'_, T>,
        jacobian: DMatrixViewMut<'_, T>,
        rhs: DVectorViewMut<'_, T>,
        algorithm: NonlinearAlgorithm,
    ) -> eyre::Result<()> {
        delegate!(self, module => module.compute_jacobian_and_rhs(context, jacobian, rhs, algorithm))
    }
}
