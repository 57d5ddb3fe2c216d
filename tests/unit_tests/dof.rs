use ferrox::dof::{global_dof_id, DofError, DofManager};
use ferrox::mesh::Mesh;
use ferrox::params::{BlockSelection, KernelParameters, KernelParametersDraft};
use ferrox::weakform::{create_module, DomainType, PhysicsTag};
use ferrox_comm::SerialComm;
use nalgebra::Point2;
use proptest::prelude::*;

use super::{three_block_mesh, three_block_params};

#[test]
fn dof_ids_are_deterministic() {
    assert_eq!(global_dof_id(0, 0, 1), 0);
    assert_eq!(global_dof_id(7, 0, 1), 7);
    assert_eq!(global_dof_id(7, 0, 3), 21);
    assert_eq!(global_dof_id(7, 2, 3), 23);
}

#[test]
#[should_panic(expected = "out of range")]
fn component_outside_range_is_a_contract_violation() {
    global_dof_id(1, 2, 2);
}

proptest! {
    /// The (entity, component) pair is recoverable from the ID, so the
    /// mapping is injective over all valid pairs.
    #[test]
    fn dof_id_computation_is_injective(
        entity in 0u64..1_000_000_000,
        components in 1usize..8,
        component_index in 0usize..8,
    ) {
        let component = component_index % components;
        let id = global_dof_id(entity, component, components);
        prop_assert_eq!(id / components as u64, entity);
        prop_assert_eq!((id % components as u64) as usize, component);
    }
}

fn two_triangle_mesh() -> Mesh<f64> {
    // Two triangles sharing the edge (20, 30); deliberately non-contiguous
    // node IDs.
    let mut mesh = Mesh::new();
    mesh.add_block(1, "domain");
    mesh.add_node(10, Point2::new(0.0, 0.0));
    mesh.add_node(20, Point2::new(1.0, 0.0));
    mesh.add_node(30, Point2::new(0.0, 1.0));
    mesh.add_node(40, Point2::new(1.0, 1.0));
    mesh.add_element(1, 1, [10, 20, 30]);
    mesh.add_element(2, 1, [20, 40, 30]);
    mesh
}

fn single_block_params(dofs_per_node: usize) -> KernelParameters {
    let mut draft = KernelParametersDraft::new();
    draft.select_ranks(&[0]).select_block(BlockSelection {
        block_id: 1,
        domain_type: DomainType::Air,
        dofs_per_node,
        dofs_per_edge: 0,
        integration_order: 2,
    });
    KernelParameters::distribute(Some(draft), &SerialComm::new()).unwrap()
}

#[test]
fn initialize_numbers_dofs_in_sorted_id_order() {
    let mut mesh = two_triangle_mesh();
    let mut manager =
        DofManager::new(create_module(PhysicsTag::MagnetodynamicsAz), &single_block_params(1))
            .unwrap();
    manager.initialize(&mut mesh, &SerialComm::new()).unwrap();

    assert_eq!(manager.num_global_dofs(), 4);
    assert_eq!(manager.row_of(10, 0), Some(0));
    assert_eq!(manager.row_of(20, 0), Some(1));
    assert_eq!(manager.row_of(30, 0), Some(2));
    assert_eq!(manager.row_of(40, 0), Some(3));
    assert_eq!(manager.row_of(50, 0), None);

    // Field storage (plus history) allocated for the module's unknowns.
    assert!(mesh.has_field("az"));
    assert!(mesh.has_field("az_prev"));
}

#[test]
fn sparsity_pattern_follows_element_incidence() {
    let mut mesh = two_triangle_mesh();
    let mut manager =
        DofManager::new(create_module(PhysicsTag::MagnetodynamicsAz), &single_block_params(1))
            .unwrap();
    manager.initialize(&mut mesh, &SerialComm::new()).unwrap();

    let matrix = manager.matrix().unwrap();
    assert_eq!(matrix.nrows(), 4);
    assert_eq!(matrix.ncols(), 4);
    // Two overlapping dense 3x3 element blocks: all pairs except the
    // (10, 40) couple, which never share an element.
    assert_eq!(matrix.nnz(), 14);
    let row0 = matrix.row(0);
    assert_eq!(row0.col_indices(), &[0, 1, 2]);
}

#[test]
fn block_lookup_fails_with_not_found_for_absent_ids() {
    let mut mesh = three_block_mesh();
    let mut manager =
        DofManager::new(create_module(PhysicsTag::MagnetodynamicsAz), &three_block_params())
            .unwrap();
    manager.initialize(&mut mesh, &SerialComm::new()).unwrap();

    assert!(manager.has_block(1));
    assert!(manager.block(2).is_ok());
    assert!(!manager.has_block(99));
    assert!(matches!(
        manager.block(99),
        Err(DofError::UnknownBlock { id: 99 })
    ));
    assert!(matches!(
        manager.sideset(5),
        Err(DofError::UnknownSideSet { id: 5 })
    ));
}

#[test]
fn dof_count_mismatch_against_module_fields_is_fatal() {
    let result = DofManager::<f64>::new(
        create_module(PhysicsTag::MagnetodynamicsAz),
        &single_block_params(2),
    );
    let message = format!("{:#}", result.err().unwrap());
    assert!(message.contains("2 DOFs per node"), "message: {}", message);
}

#[test]
fn domain_tag_on_block_handles_is_mutable() {
    let mut mesh = three_block_mesh();
    let mut manager =
        DofManager::new(create_module(PhysicsTag::MagnetodynamicsAz), &three_block_params())
            .unwrap();
    manager.initialize(&mut mesh, &SerialComm::new()).unwrap();

    assert_eq!(manager.block(3).unwrap().domain_type, DomainType::Air);
    manager.block_mut(3).unwrap().domain_type = DomainType::Ferromagnetic;
    assert_eq!(manager.block(3).unwrap().domain_type, DomainType::Ferromagnetic);
}
