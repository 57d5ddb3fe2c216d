use ferrox::mesh::procedural::unit_square;
use ferrox::mesh::Mesh;
use nalgebra::Point2;

use super::three_block_mesh;

#[test]
fn unit_square_has_expected_entity_counts() {
    let mesh: Mesh<f64> = unit_square(2, 2, 1);
    assert_eq!(mesh.num_nodes(), 9);
    assert_eq!(mesh.num_elements(), 8);
    assert_eq!(mesh.block(0).elements.len(), 8);
    assert!(mesh.has_block(1));
    assert!(!mesh.has_block(2));
}

#[test]
fn node_lookup_is_by_stable_id() {
    let mesh = three_block_mesh();
    assert_eq!(mesh.node_index(1), Some(0));
    assert_eq!(mesh.node_index(9), Some(8));
    assert_eq!(mesh.node_index(42), None);
    assert_eq!(mesh.node_id(0), 1);
    assert_eq!(*mesh.node_position(1), Point2::new(1.0, 0.0));
}

#[test]
fn sideset_nodes_are_deduplicated_and_sorted() {
    let mut mesh = three_block_mesh();
    mesh.add_sideset(7, "boundary", &[[1, 2], [2, 3], [3, 1]]);
    let index = mesh.sideset_index(7).unwrap();
    assert_eq!(mesh.sideset(index).nodes(), vec![0, 1, 2]);
}

#[test]
#[should_panic(expected = "duplicate node id")]
fn duplicate_node_id_is_a_contract_violation() {
    let mut mesh: Mesh<f64> = Mesh::new();
    mesh.add_node(1, Point2::new(0.0, 0.0));
    mesh.add_node(1, Point2::new(1.0, 0.0));
}

#[test]
fn uniform_partition_covers_all_elements() {
    let mut mesh: Mesh<f64> = unit_square(2, 2, 1);
    mesh.partition_uniform(3);
    let counts: Vec<usize> = (0..3).map(|rank| mesh.owned_elements(rank).count()).collect();
    assert_eq!(counts.iter().sum::<usize>(), mesh.num_elements());
    for count in counts {
        assert!(count > 0);
    }
}

#[test]
fn node_ownership_is_minimum_adjacent_element_owner() {
    let mut mesh = three_block_mesh();
    // 3 elements, 3 ranks: element k owned by rank k.
    mesh.partition_uniform(3);
    for rank in 0..3 {
        assert_eq!(mesh.owned_elements(rank).count(), 1);
    }
    // Disjoint node sets: every node owned by its element's rank.
    for node in 0..mesh.num_nodes() {
        assert_eq!(mesh.partition().node_owner(node), node / 3);
    }
}

#[test]
fn ghost_nodes_are_shared_but_owned_elsewhere() {
    let mut mesh: Mesh<f64> = unit_square(1, 2, 1);
    // 4 elements in two rows; two ranks split them, sharing the middle
    // nodes.
    mesh.partition_uniform(2);
    let shared: Vec<usize> = (0..mesh.num_nodes())
        .filter(|&node| mesh.is_ghost_node(node, 1))
        .collect();
    assert!(!shared.is_empty());
    for &node in &shared {
        assert_eq!(mesh.partition().node_owner(node), 0);
    }
    // Rank 0 owns its touched nodes, so it sees no ghosts.
    assert!((0..mesh.num_nodes()).all(|node| !mesh.is_ghost_node(node, 0)));
}

#[test]
fn field_storage_roundtrip() {
    let mut mesh = three_block_mesh();
    mesh.ensure_field("az", 1);
    mesh.set_field_value("az", 4, 0, 2.5);
    assert_eq!(mesh.field_value("az", 4, 0), 2.5);
    assert_eq!(mesh.field_value("az", 0, 0), 0.0);

    mesh.ensure_field("az_prev", 1);
    mesh.copy_field("az", "az_prev").unwrap();
    assert_eq!(mesh.field_value("az_prev", 4, 0), 2.5);

    assert!(mesh.copy_field("az", "missing").is_err());
}
