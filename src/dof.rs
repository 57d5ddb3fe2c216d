//! Degree-of-freedom management and the global assembly loop.
//!
//! A [`DofManager`] turns one weak-form module plus a mesh partition into a
//! global sparse system: it owns the deterministic DOF numbering, the
//! per-block handles and scratch workspace, the fixed block-then-element
//! assembly traversal, and the handoff to the sparse solver layer. Every
//! rank assembles contributions from its owned elements only; the partial
//! systems share one sparsity pattern and are reduced by summation on the
//! master before a solve.

use core::fmt;
use std::collections::BTreeSet;
use std::error::Error;

use ferrox_comm::{CommScalar, Communicator};
use ferrox_sparse::distribute::solve_distributed_cg;
use ferrox_sparse::{CgParameters, SolverError, SparseSolver, SymmetryMode};
use log::debug;
use nalgebra::{DMatrix, DMatrixViewMut, DVector, DVectorViewMut};
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::CsrMatrix;
use rustc_hash::FxHashMap;

use crate::mesh::Mesh;
use crate::nonlinear::{NonlinearAlgorithm, NonlinearProblem};
use crate::params::{BlockSelection, KernelParameters, SideSetSelection};
use crate::quadrature::QuadratureRule;
use crate::weakform::{DomainType, ElementContext, PhysicsModule, WeakFormModule};
use crate::Real;

/// The global ID of one scalar unknown.
///
/// A pure function of (owning entity ID, component index), so every rank
/// computes the identical ID without negotiation. Injective for all
/// `component < components`.
pub fn global_dof_id(entity_id: u64, component: usize, components: usize) -> u64 {
    assert!(
        component < components,
        "component {} out of range for {} components",
        component,
        components
    );
    entity_id * components as u64 + component as u64
}

#[derive(Debug)]
pub enum DofError {
    /// The calling rank does not hold this block; partitions may be uneven.
    UnknownBlock { id: u64 },
    UnknownSideSet { id: u64 },
    Solver(SolverError),
}

impl fmt::Display for DofError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DofError::UnknownBlock { id } => {
                write!(f, "block {} not present on this rank", id)
            }
            DofError::UnknownSideSet { id } => {
                write!(f, "side set {} not present on this rank", id)
            }
            DofError::Solver(err) => write!(f, "{}", err),
        }
    }
}

impl Error for DofError {}

impl From<SolverError> for DofError {
    fn from(err: SolverError) -> Self {
        DofError::Solver(err)
    }
}

/// Manager-local view of one mesh block.
///
/// Carries the mutable physics domain tag and the optional material slot a
/// weak-form module resolves at link time; lives as long as the manager.
#[derive(Debug, Clone)]
pub struct BlockHandle {
    pub block_id: u64,
    pub block_index: usize,
    pub domain_type: DomainType,
    /// Slot into the module's material table; `None` selects the regime
    /// default.
    pub material: Option<usize>,
    pub integration_order: usize,
}

#[derive(Debug, Clone)]
pub struct SideSetHandle {
    pub sideset_id: u64,
    pub sideset_index: usize,
    pub domain_type: DomainType,
    pub integration_order: usize,
}

/// Per-group scratch buffers, lazily sized when the module links to a
/// block and reused across its elements.
#[derive(Debug, Clone)]
struct AssemblyScratch<T: Real> {
    element_matrix: DMatrix<T>,
    element_rhs: DVector<T>,
    element_rows: Vec<usize>,
    connectivity_permutation: Vec<usize>,
    u_iter: Vec<T>,
    u_step: Vec<T>,
}

impl<T: Real> Default for AssemblyScratch<T> {
    fn default() -> Self {
        Self {
            element_matrix: DMatrix::zeros(0, 0),
            element_rhs: DVector::zeros(0),
            element_rows: Vec::new(),
            connectivity_permutation: Vec::new(),
            u_iter: Vec::new(),
            u_step: Vec::new(),
        }
    }
}

impl<T: Real> AssemblyScratch<T> {
    fn bind(&mut self, nodes_per_element: usize, components: usize) {
        let dim = nodes_per_element * components;
        self.element_matrix.resize_mut(dim, dim, T::zero());
        self.element_rhs.resize_vertically_mut(dim, T::zero());
        self.element_rows.resize(dim, 0);
        self.u_iter.resize(dim, T::zero());
        self.u_step.resize(dim, T::zero());
    }
}

/// How [`DofManager::solve`] reaches a linear solver.
pub enum LinearSolveStrategy<'a, T: Real> {
    /// Invoke a serial backend on the reduced system (on the master when
    /// more than one rank is present; the solution is broadcast).
    Backend(&'a mut dyn SparseSolver<T>),
    /// Redistribute row blocks across all ranks and run the distributed
    /// Krylov path.
    DistributedKrylov(CgParameters<T>),
}

pub struct DofManager<T: Real> {
    module: PhysicsModule<T>,
    block_selections: Vec<(BlockSelection, usize)>,
    sideset_selections: Vec<SideSetSelection>,
    components: usize,
    symmetry: SymmetryMode,

    blocks: Vec<BlockHandle>,
    sidesets: Vec<SideSetHandle>,

    global_dof_ids: Vec<u64>,
    row_of_dof: FxHashMap<u64, usize>,
    matrix: Option<CsrMatrix<T>>,
    rhs: DVector<T>,
    solution: DVector<T>,
    previous_solution: DVector<T>,
    constraints: Vec<(usize, T)>,
    scratch: AssemblyScratch<T>,
    initialized: bool,
}

impl<T: Real> DofManager<T> {
    /// Binds a module to the block/side set selections of `params`.
    pub fn new(mut module: PhysicsModule<T>, params: &KernelParameters) -> eyre::Result<Self> {
        let components: usize = module.fields().iter().map(|f| f.components).sum();
        eyre::ensure!(
            components > 0,
            "module '{}' declares no unknown fields",
            module.name()
        );

        for selection in params.blocks() {
            eyre::ensure!(
                selection.dofs_per_node == components,
                "block {} selected with {} DOFs per node, but module '{}' carries {}",
                selection.block_id,
                selection.dofs_per_node,
                module.name(),
                components
            );
            eyre::ensure!(
                selection.dofs_per_edge == 0,
                "block {}: module '{}' has no edge DOFs",
                selection.block_id,
                module.name()
            );
        }

        let block_ids: Vec<u64> = params.blocks().iter().map(|b| b.block_id).collect();
        let block_domains: Vec<DomainType> =
            params.blocks().iter().map(|b| b.domain_type).collect();
        module.set_blocks(&block_ids, &block_domains)?;

        let sideset_ids: Vec<u64> = params.sidesets().iter().map(|s| s.sideset_id).collect();
        let sideset_domains: Vec<DomainType> =
            params.sidesets().iter().map(|s| s.domain_type).collect();
        module.set_sidesets(&sideset_ids, &sideset_domains)?;

        let block_selections = params
            .blocks()
            .iter()
            .map(|selection| (*selection, params.effective_integration_order(selection)))
            .collect();

        Ok(Self {
            module,
            block_selections,
            sideset_selections: params.sidesets().to_vec(),
            components,
            symmetry: SymmetryMode::PositiveDefinite,
            blocks: Vec::new(),
            sidesets: Vec::new(),
            global_dof_ids: Vec::new(),
            row_of_dof: FxHashMap::default(),
            matrix: None,
            rhs: DVector::zeros(0),
            solution: DVector::zeros(0),
            previous_solution: DVector::zeros(0),
            constraints: Vec::new(),
            scratch: AssemblyScratch::default(),
            initialized: false,
        })
    }

    pub fn module(&self) -> &PhysicsModule<T> {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut PhysicsModule<T> {
        &mut self.module
    }

    pub fn set_symmetry_mode(&mut self, symmetry: SymmetryMode) {
        self.symmetry = symmetry;
    }

    /// Scalar DOF components per node.
    pub fn components(&self) -> usize {
        self.components
    }

    pub fn num_global_dofs(&self) -> usize {
        self.global_dof_ids.len()
    }

    /// The global row index of a DOF, identical on every rank.
    pub fn row_of(&self, entity_id: u64, component: usize) -> Option<usize> {
        self.row_of_dof
            .get(&global_dof_id(entity_id, component, self.components))
            .copied()
    }

    pub fn has_block(&self, id: u64) -> bool {
        self.blocks.iter().any(|b| b.block_id == id)
    }

    pub fn block(&self, id: u64) -> Result<&BlockHandle, DofError> {
        self.blocks
            .iter()
            .find(|b| b.block_id == id)
            .ok_or(DofError::UnknownBlock { id })
    }

    pub fn block_mut(&mut self, id: u64) -> Result<&mut BlockHandle, DofError> {
        self.blocks
            .iter_mut()
            .find(|b| b.block_id == id)
            .ok_or(DofError::UnknownBlock { id })
    }

    pub fn has_sideset(&self, id: u64) -> bool {
        self.sidesets.iter().any(|s| s.sideset_id == id)
    }

    pub fn sideset(&self, id: u64) -> Result<&SideSetHandle, DofError> {
        self.sidesets
            .iter()
            .find(|s| s.sideset_id == id)
            .ok_or(DofError::UnknownSideSet { id })
    }

    pub fn matrix(&self) -> Option<&CsrMatrix<T>> {
        self.matrix.as_ref()
    }

    pub fn rhs(&self) -> &DVector<T> {
        &self.rhs
    }

    pub fn solution(&self) -> &DVector<T> {
        &self.solution
    }

    /// Allocates field storage, assigns DOF IDs, builds the local/global
    /// map and derives the shared sparsity pattern. Collective.
    pub fn initialize<C>(&mut self, mesh: &mut Mesh<T>, comm: &C) -> eyre::Result<()>
    where
        C: Communicator,
        T: CommScalar,
    {
        let rank = comm.rank();

        self.blocks = self
            .block_selections
            .iter()
            .filter_map(|(selection, order)| {
                mesh.block_index(selection.block_id).map(|block_index| BlockHandle {
                    block_id: selection.block_id,
                    block_index,
                    domain_type: selection.domain_type,
                    material: None,
                    integration_order: *order,
                })
            })
            .collect();
        self.sidesets = self
            .sideset_selections
            .iter()
            .filter_map(|selection| {
                mesh.sideset_index(selection.sideset_id).map(|sideset_index| SideSetHandle {
                    sideset_id: selection.sideset_id,
                    sideset_index,
                    domain_type: selection.domain_type,
                    integration_order: selection.integration_order,
                })
            })
            .collect();

        for field in self.module.fields() {
            mesh.ensure_field(field.label, field.components);
            mesh.ensure_field(&field.history_label(), field.components);
        }

        // Deterministic DOF IDs for every node touched by owned elements.
        let mut local_dofs = BTreeSet::new();
        let mut local_pairs = BTreeSet::new();
        for handle in &self.blocks {
            for &element in &mesh.block(handle.block_index).elements {
                if mesh.partition().element_owner(element) != rank {
                    continue;
                }
                let connectivity = mesh.element_connectivity(element);
                for &node in &connectivity {
                    for component in 0..self.components {
                        local_dofs.insert(global_dof_id(
                            mesh.node_id(node),
                            component,
                            self.components,
                        ));
                    }
                }
            }
        }
        self.global_dof_ids = collective_sorted_union(comm, local_dofs.into_iter().collect());
        self.row_of_dof = self
            .global_dof_ids
            .iter()
            .enumerate()
            .map(|(row, &id)| (id, row))
            .collect();
        debug!(
            "rank {}: {} global DOFs numbered",
            rank,
            self.global_dof_ids.len()
        );

        // Element/DOF incidence as (row, column) pairs, unioned across
        // ranks so every rank holds the same pattern.
        for handle in &self.blocks {
            for &element in &mesh.block(handle.block_index).elements {
                if mesh.partition().element_owner(element) != rank {
                    continue;
                }
                let rows = self.element_rows(mesh, element);
                for &row_i in &rows {
                    for &row_j in &rows {
                        local_pairs.insert((row_i as u64, row_j as u64));
                    }
                }
            }
        }
        let mut flattened = Vec::with_capacity(2 * local_pairs.len());
        for (i, j) in local_pairs {
            flattened.extend([i, j]);
        }
        let flattened = collective_pair_union(comm, flattened);

        let n = self.global_dof_ids.len();
        let mut offsets = Vec::with_capacity(n + 1);
        let mut indices = Vec::with_capacity(flattened.len() / 2);
        offsets.push(0);
        let mut current_row = 0;
        for pair in flattened.chunks_exact(2) {
            let (i, j) = (pair[0] as usize, pair[1] as usize);
            while current_row < i {
                offsets.push(indices.len());
                current_row += 1;
            }
            indices.push(j);
        }
        while offsets.len() < n + 1 {
            offsets.push(indices.len());
        }
        let pattern = SparsityPattern::try_from_offsets_and_indices(n, n, offsets, indices)
            .map_err(|err| eyre::eyre!("derived sparsity pattern is invalid: {:?}", err))?;
        let nnz = pattern.nnz();
        self.matrix = Some(
            CsrMatrix::try_from_pattern_and_values(pattern, vec![T::zero(); nnz])
                .expect("pattern and value array sized together"),
        );
        self.rhs = DVector::zeros(n);
        self.solution = DVector::zeros(n);
        self.previous_solution = DVector::zeros(n);
        self.initialized = true;
        Ok(())
    }

    fn element_rows(&self, mesh: &Mesh<T>, element: usize) -> Vec<usize> {
        let connectivity = mesh.element_connectivity(element);
        let mut rows = Vec::with_capacity(3 * self.components);
        for &node in &connectivity {
            for component in 0..self.components {
                let id = global_dof_id(mesh.node_id(node), component, self.components);
                rows.push(
                    *self
                        .row_of_dof
                        .get(&id)
                        .unwrap_or_else(|| panic!("DOF {} missing from global numbering", id)),
                );
            }
        }
        rows
    }

    /// Maps module constraints onto global rows for the next assembly.
    pub fn compute_boundary_conditions(&mut self, time: T, mesh: &Mesh<T>) -> eyre::Result<()> {
        let nodal = self.module.compute_boundary_conditions(time, mesh)?;
        let mut constraints = Vec::with_capacity(nodal.len());
        for constraint in nodal {
            let id = global_dof_id(constraint.node_id, constraint.component, self.components);
            let row = self.row_of_dof.get(&id).copied().ok_or_else(|| {
                eyre::eyre!(
                    "boundary condition on node {} component {} outside the DOF numbering",
                    constraint.node_id,
                    constraint.component
                )
            })?;
            constraints.push((row, constraint.value));
        }
        constraints.sort_by_key(|&(row, _)| row);
        constraints.dedup_by_key(|&mut (row, _)| row);
        self.constraints = constraints;
        Ok(())
    }

    /// Assembles this rank's owned elements into the global system,
    /// overwriting the previous one.
    ///
    /// Traversal is fixed and repeatable: blocks in selection order,
    /// elements in block order. The module is linked to each block once;
    /// regime dispatch happens there, not per element.
    pub fn compute_jacobian_and_rhs(
        &mut self,
        mesh: &Mesh<T>,
        rank: usize,
        algorithm: NonlinearAlgorithm,
    ) -> eyre::Result<()> {
        assert!(
            self.initialized,
            "compute_jacobian_and_rhs called before initialize"
        );
        let matrix = self.matrix.as_mut().expect("system allocated at initialize");
        matrix.values_mut().fill(T::zero());
        self.rhs.fill(T::zero());

        let fields: Vec<_> = self.module.fields().to_vec();
        for block_position in 0..self.blocks.len() {
            let handle = self.blocks[block_position].clone();
            self.module.link_to_block(&handle)?;
            let quadrature = QuadratureRule::triangle(handle.integration_order)?;
            self.scratch.bind(3, self.components);

            for &element in &mesh.block(handle.block_index).elements {
                if mesh.partition().element_owner(element) != rank {
                    continue;
                }
                let connectivity = mesh.element_connectivity(element);
                let vertices = [
                    *mesh.node_position(connectivity[0]),
                    *mesh.node_position(connectivity[1]),
                    *mesh.node_position(connectivity[2]),
                ];

                let scratch = &mut self.scratch;
                for (local, &node) in connectivity.iter().enumerate() {
                    let mut offset = 0;
                    for field in &fields {
                        let history = field.history_label();
                        for component in 0..field.components {
                            let slot = local * self.components + offset + component;
                            scratch.u_iter[slot] =
                                mesh.field_value(field.label, node, component);
                            scratch.u_step[slot] = mesh.field_value(&history, node, component);
                            let id = global_dof_id(
                                mesh.node_id(node),
                                offset + component,
                                self.components,
                            );
                            scratch.element_rows[slot] = *self
                                .row_of_dof
                                .get(&id)
                                .unwrap_or_else(|| panic!("DOF {} missing from numbering", id));
                        }
                        offset += field.components;
                    }
                }

                scratch.element_matrix.fill(T::zero());
                scratch.element_rhs.fill(T::zero());
                let context = ElementContext {
                    element_id: mesh.element_id(element),
                    vertices,
                    u_iter: &scratch.u_iter,
                    u_step: &scratch.u_step,
                    quadrature: &quadrature,
                };
                self.module.compute_jacobian_and_rhs(
                    &context,
                    DMatrixViewMut::from(&mut scratch.element_matrix),
                    DVectorViewMut::from(&mut scratch.element_rhs),
                    algorithm,
                )?;

                scatter_add(
                    matrix,
                    &mut self.rhs,
                    &scratch.element_matrix,
                    &scratch.element_rhs,
                    &scratch.element_rows,
                    &mut scratch.connectivity_permutation,
                );
            }
        }
        Ok(())
    }

    /// Reduces the partial systems, solves, and writes the solution back
    /// into DOF values and mesh field storage. Collective.
    pub fn solve<C>(
        &mut self,
        mesh: &mut Mesh<T>,
        comm: &C,
        strategy: LinearSolveStrategy<'_, T>,
    ) -> Result<(), DofError>
    where
        C: Communicator,
        T: CommScalar,
    {
        assert!(self.initialized, "solve called before initialize");
        let n = self.global_dof_ids.len();

        let (master_matrix, master_rhs) = self.reduce_system(comm);

        self.previous_solution = self.solution.clone();
        let mut lhs = self.solution.clone();
        match strategy {
            LinearSolveStrategy::Backend(backend) => {
                if comm.is_master() {
                    let matrix = master_matrix.as_ref().expect("reduced system on master");
                    let rhs = master_rhs.as_ref().expect("reduced system on master");
                    backend.initialize(matrix, self.symmetry, 1)?;
                    backend.solve(matrix, &mut lhs, rhs)?;
                }
                if comm.size() > 1 {
                    let data = comm.is_master().then(|| lhs.as_slice().to_vec());
                    lhs = DVector::from_vec(comm.broadcast_vec(data, 0));
                }
            }
            LinearSolveStrategy::DistributedKrylov(parameters) => {
                solve_distributed_cg(
                    comm,
                    0,
                    master_matrix.as_ref(),
                    master_rhs.as_ref(),
                    &mut lhs,
                    &parameters,
                )?;
            }
        }
        assert_eq!(lhs.len(), n, "solver returned a solution of wrong length");
        self.solution = lhs;
        self.write_back(mesh);
        Ok(())
    }

    /// Sums the per-rank matrix values, right-hand sides and constraints on
    /// the master and applies the Dirichlet constraints there.
    fn reduce_system<C>(&self, comm: &C) -> (Option<CsrMatrix<T>>, Option<DVector<T>>)
    where
        C: Communicator,
        T: CommScalar,
    {
        let matrix = self.matrix.as_ref().expect("system allocated at initialize");

        let value_chunks = comm.gather(matrix.values(), 0);
        let rhs_chunks = comm.gather(self.rhs.as_slice(), 0);
        let constraint_rows: Vec<u64> = self.constraints.iter().map(|&(r, _)| r as u64).collect();
        let constraint_values: Vec<T> = self.constraints.iter().map(|&(_, v)| v).collect();
        let row_chunks = comm.gather(&constraint_rows, 0);
        let value_chunks_bc = comm.gather(&constraint_values, 0);

        if !comm.is_master() {
            return (None, None);
        }

        let mut reduced = matrix.clone();
        {
            let values = reduced.values_mut();
            for chunk in value_chunks.expect("gather returns chunks on the master").iter().skip(1) {
                assert_eq!(
                    chunk.len(),
                    values.len(),
                    "partial systems disagree on the sparsity pattern"
                );
                for (value, contribution) in values.iter_mut().zip(chunk) {
                    *value += *contribution;
                }
            }
        }
        let mut rhs = self.rhs.clone();
        for chunk in rhs_chunks.expect("gather returns chunks on the master").iter().skip(1) {
            for (value, contribution) in rhs.iter_mut().zip(chunk) {
                *value += *contribution;
            }
        }

        // Constraints may originate on any rank that holds the side set;
        // duplicates across ranks prescribe the same value.
        let mut constraints: Vec<(usize, T)> = Vec::new();
        let row_chunks = row_chunks.expect("gather returns chunks on the master");
        let value_chunks_bc = value_chunks_bc.expect("gather returns chunks on the master");
        for (rows, values) in row_chunks.iter().zip(&value_chunks_bc) {
            for (&row, &value) in rows.iter().zip(values) {
                constraints.push((row as usize, value));
            }
        }
        constraints.sort_by_key(|&(row, _)| row);
        constraints.dedup_by_key(|&mut (row, _)| row);
        apply_dirichlet(&mut reduced, &mut rhs, &constraints);

        (Some(reduced), Some(rhs))
    }

    /// Writes the solution vector into the module's mesh fields.
    fn write_back(&self, mesh: &mut Mesh<T>) {
        let mut offset = 0;
        for field in self.module.fields() {
            for node in 0..mesh.num_nodes() {
                let node_id = mesh.node_id(node);
                for component in 0..field.components {
                    let id =
                        global_dof_id(node_id, offset + component, self.components);
                    if let Some(&row) = self.row_of_dof.get(&id) {
                        mesh.set_field_value(field.label, node, component, self.solution[row]);
                    }
                }
            }
            offset += field.components;
        }
    }

    /// Blends the new iterate with the previous one and refreshes the mesh
    /// fields accordingly.
    pub fn relax(&mut self, relaxation: T, mesh: &mut Mesh<T>) {
        assert!(
            relaxation > T::zero() && relaxation <= T::one(),
            "relaxation factor must lie in (0, 1]"
        );
        if relaxation < T::one() {
            let one_minus = T::one() - relaxation;
            for i in 0..self.solution.len() {
                self.solution[i] =
                    one_minus * self.previous_solution[i] + relaxation * self.solution[i];
            }
            self.write_back(mesh);
        }
    }

    /// The convergence metric: relative change of successive iterates,
    /// `||u_k - u_{k-1}|| / max(||u_k||, eps)`.
    ///
    /// One fixed definition for every physics module, monotone comparable
    /// across iterations of one run.
    pub fn residual(&self, iteration: usize) -> T {
        let change = (&self.solution - &self.previous_solution).norm();
        let scale = self.solution.norm().max(T::default_epsilon());
        let residual = change / scale;
        debug!("iteration {}: residual {:?}", iteration, residual);
        residual
    }

    /// Gathers owned nodal values of the labeled fields to the master.
    pub fn collect_fields<C>(
        &self,
        labels: &[&str],
        mesh: &mut Mesh<T>,
        comm: &C,
    ) -> eyre::Result<()>
    where
        C: Communicator,
        T: CommScalar,
    {
        for &label in labels {
            let components = self.field_components(mesh, label)?;
            let rank = comm.rank();
            let mut ids = Vec::new();
            let mut values = Vec::new();
            for node in 0..mesh.num_nodes() {
                if mesh.partition().node_owner(node) != rank {
                    continue;
                }
                ids.push(mesh.node_id(node));
                for component in 0..components {
                    values.push(mesh.field_value(label, node, component));
                }
            }
            let id_chunks = comm.gather(&ids, 0);
            let value_chunks = comm.gather(&values, 0);
            if let (Some(id_chunks), Some(value_chunks)) = (id_chunks, value_chunks) {
                for (ids, values) in id_chunks.iter().zip(&value_chunks) {
                    for (k, &id) in ids.iter().enumerate() {
                        let Some(node) = mesh.node_index(id) else {
                            continue;
                        };
                        for component in 0..components {
                            mesh.set_field_value(
                                label,
                                node,
                                component,
                                values[k * components + component],
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Pushes the master's view of the labeled fields back to every rank.
    pub fn distribute_fields<C>(
        &self,
        labels: &[&str],
        mesh: &mut Mesh<T>,
        comm: &C,
    ) -> eyre::Result<()>
    where
        C: Communicator,
        T: CommScalar,
    {
        for &label in labels {
            let components = self.field_components(mesh, label)?;
            let (ids, values) = if comm.is_master() {
                let mut ids = Vec::with_capacity(mesh.num_nodes());
                let mut values = Vec::with_capacity(mesh.num_nodes() * components);
                for node in 0..mesh.num_nodes() {
                    ids.push(mesh.node_id(node));
                    for component in 0..components {
                        values.push(mesh.field_value(label, node, component));
                    }
                }
                (Some(ids), Some(values))
            } else {
                (None, None)
            };
            let ids = comm.broadcast_vec(ids, 0);
            let values = comm.broadcast_vec(values, 0);
            for (k, &id) in ids.iter().enumerate() {
                let Some(node) = mesh.node_index(id) else {
                    continue;
                };
                for component in 0..components {
                    mesh.set_field_value(label, node, component, values[k * components + component]);
                }
            }
        }
        Ok(())
    }

    /// Reconciles duplicated shared/ghost-node values: the owning rank's
    /// value wins everywhere.
    pub fn synchronize_fields<C>(
        &self,
        labels: &[&str],
        mesh: &mut Mesh<T>,
        comm: &C,
    ) -> eyre::Result<()>
    where
        C: Communicator,
        T: CommScalar,
    {
        self.collect_fields(labels, mesh, comm)?;
        self.distribute_fields(labels, mesh, comm)
    }

    fn field_components(&self, mesh: &Mesh<T>, label: &str) -> eyre::Result<usize> {
        mesh.field(label)
            .map(|field| field.components)
            .ok_or_else(|| eyre::eyre!("unknown field '{}'", label))
    }
}

/// Scatter-adds one dense element contribution into the CSR rows at the
/// DOF-mapped positions.
fn scatter_add<T: Real>(
    matrix: &mut CsrMatrix<T>,
    rhs: &mut DVector<T>,
    element_matrix: &DMatrix<T>,
    element_rhs: &DVector<T>,
    element_rows: &[usize],
    permutation: &mut Vec<usize>,
) {
    let dim = element_rows.len();
    permutation.clear();
    permutation.extend(0..dim);
    permutation.sort_unstable_by_key(|&k| element_rows[k]);

    for (local_row, &global_row) in element_rows.iter().enumerate() {
        rhs[global_row] += element_rhs[local_row];

        let mut csr_row = matrix.row_mut(global_row);
        let (columns, values) = csr_row.cols_and_values_mut();
        let mut column_iter = columns.iter().copied().enumerate();
        for &local_col in permutation.iter() {
            let global_col = element_rows[local_col];
            let (position, _) = column_iter
                .find(|&(_, column)| column == global_col)
                .expect("element column missing from sparsity pattern");
            values[position] += element_matrix[(local_row, local_col)];
        }
    }
}

/// Symmetric Dirichlet elimination with diagonal scaling.
///
/// Zeroes constrained rows and columns, moves the column contribution to
/// the right-hand side, and places a representative diagonal scale so the
/// conditioning of the remaining system is preserved.
fn apply_dirichlet<T: Real>(
    matrix: &mut CsrMatrix<T>,
    rhs: &mut DVector<T>,
    constraints: &[(usize, T)],
) {
    if constraints.is_empty() {
        return;
    }

    let mut scale = T::one();
    for i in 0..matrix.nrows() {
        let row = matrix.row(i);
        if let Some(k) = row.col_indices().iter().position(|&j| j == i) {
            let value = row.values()[k];
            if value != T::zero() {
                scale = value.abs();
                break;
            }
        }
    }

    let mut constrained = vec![false; matrix.nrows()];
    let mut prescribed = vec![T::zero(); matrix.nrows()];
    for &(row, value) in constraints {
        constrained[row] = true;
        prescribed[row] = value;
    }

    for i in 0..matrix.nrows() {
        if constrained[i] {
            continue;
        }
        let mut row = matrix.row_mut(i);
        let (columns, values) = row.cols_and_values_mut();
        for (k, &column) in columns.iter().enumerate() {
            if constrained[column] {
                rhs[i] -= values[k] * prescribed[column];
                values[k] = T::zero();
            }
        }
    }
    for &(row_index, value) in constraints {
        let mut row = matrix.row_mut(row_index);
        let (columns, values) = row.cols_and_values_mut();
        for (k, &column) in columns.iter().enumerate() {
            values[k] = if column == row_index { scale } else { T::zero() };
        }
        rhs[row_index] = scale * value;
    }
}

fn collective_sorted_union<C: Communicator>(comm: &C, local: Vec<u64>) -> Vec<u64> {
    let merged = comm.gather(&local, 0).map(|chunks| {
        let set: BTreeSet<u64> = chunks.into_iter().flatten().collect();
        set.into_iter().collect::<Vec<_>>()
    });
    comm.broadcast_vec(merged, 0)
}

/// Union of (row, column) pairs flattened two entries per pair; the result
/// is sorted lexicographically.
fn collective_pair_union<C: Communicator>(comm: &C, local_flattened: Vec<u64>) -> Vec<u64> {
    let merged = comm.gather(&local_flattened, 0).map(|chunks| {
        let mut set = BTreeSet::new();
        for chunk in chunks {
            for pair in chunk.chunks_exact(2) {
                set.insert((pair[0], pair[1]));
            }
        }
        let mut flattened = Vec::with_capacity(2 * set.len());
        for (i, j) in set {
            flattened.extend([i, j]);
        }
        flattened
    });
    comm.broadcast_vec(merged, 0)
}

/// How a [`TransientProblem`] reaches its linear solver each iteration.
pub enum TransientStrategy<T: Real> {
    Backend(Box<dyn SparseSolver<T>>),
    DistributedKrylov(CgParameters<T>),
}

/// Adapter binding a manager, its mesh and a communicator to the
/// nonlinear controller's phase operations.
pub struct TransientProblem<'a, T: Real, C: Communicator> {
    pub dofs: &'a mut DofManager<T>,
    pub mesh: &'a mut Mesh<T>,
    pub comm: &'a C,
    pub strategy: TransientStrategy<T>,
}

impl<'a, T, C> NonlinearProblem<T> for TransientProblem<'a, T, C>
where
    T: Real + CommScalar,
    C: Communicator,
{
    fn advance_time(&mut self, time: T) -> eyre::Result<T> {
        self.dofs.module_mut().shift_fields(self.mesh)?;
        Ok(time + self.dofs.module().timestep())
    }

    fn compute_boundary_conditions(&mut self, time: T) -> eyre::Result<()> {
        self.dofs.compute_boundary_conditions(time, self.mesh)
    }

    fn assemble(&mut self, algorithm: NonlinearAlgorithm) -> eyre::Result<()> {
        self.dofs
            .compute_jacobian_and_rhs(self.mesh, self.comm.rank(), algorithm)
    }

    fn solve_linear(&mut self) -> Result<(), SolverError> {
        let strategy = match &mut self.strategy {
            TransientStrategy::Backend(backend) => LinearSolveStrategy::Backend(&mut **backend),
            TransientStrategy::DistributedKrylov(parameters) => {
                LinearSolveStrategy::DistributedKrylov(*parameters)
            }
        };
        self.dofs
            .solve(self.mesh, self.comm, strategy)
            .map_err(|err| match err {
                DofError::Solver(err) => err,
                other => SolverError::Backend {
                    backend: "dof-manager",
                    status: -1,
                    message: other.to_string(),
                },
            })
    }

    fn relax(&mut self, relaxation: T) {
        self.dofs.relax(relaxation, self.mesh);
    }

    fn residual(&mut self, iteration: usize) -> T {
        self.dofs.residual(iteration)
    }
}
