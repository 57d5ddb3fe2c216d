mod dof;
mod mesh;
mod params;
mod solve;
mod weakform;

use ferrox::mesh::Mesh;
use ferrox::params::{BlockSelection, IntegrationScheme, KernelParameters, KernelParametersDraft};
use ferrox::weakform::DomainType;
use ferrox_comm::SerialComm;
use nalgebra::Point2;

/// One unit right triangle per block, three blocks, disjoint node sets.
///
/// Node IDs are 1..=9 in block order, so the sorted global DOF numbering
/// lines up block by block.
pub fn three_block_mesh() -> Mesh<f64> {
    let mut mesh = Mesh::new();
    for (block_id, name) in [(1, "superconductor"), (2, "ferromagnet"), (3, "air")] {
        mesh.add_block(block_id, name);
    }
    for block_id in 1..=3u64 {
        let base = (block_id - 1) * 3 + 1;
        mesh.add_node(base, Point2::new(0.0, 0.0));
        mesh.add_node(base + 1, Point2::new(1.0, 0.0));
        mesh.add_node(base + 2, Point2::new(0.0, 1.0));
        mesh.add_element(block_id, block_id, [base, base + 1, base + 2]);
    }
    mesh
}

/// The matching selections for [`three_block_mesh`], distributed serially.
pub fn three_block_params() -> KernelParameters {
    let mut draft = KernelParametersDraft::new();
    draft
        .select_ranks(&[0])
        .set_integration_scheme(IntegrationScheme::Full);
    for (block_id, domain) in [
        (1, DomainType::Superconducting),
        (2, DomainType::Ferromagnetic),
        (3, DomainType::Air),
    ] {
        draft.select_block(BlockSelection {
            block_id,
            domain_type: domain,
            dofs_per_node: 1,
            dofs_per_edge: 0,
            integration_order: 2,
        });
    }
    KernelParameters::distribute(Some(draft), &SerialComm::new()).unwrap()
}

/// Runs `f` once per rank of an in-process group, returning the per-rank
/// results in rank order.
pub fn spmd<R, F>(size: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(&ferrox_comm::ThreadComm) -> R + Sync,
{
    let comms = ferrox_comm::ThreadComm::create(size);
    let f = &f;
    std::thread::scope(|scope| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                scope.spawn(move || {
                    let result = f(&comm);
                    // Keep the endpoint alive until every rank is joined so
                    // late senders never observe a disconnected peer.
                    (result, comm)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap().0).collect()
    })
}

/// All boundary edges of the procedural unit square as (node id, node id)
/// facets.
pub fn unit_square_boundary_facets(nx: usize, ny: usize) -> Vec<[u64; 2]> {
    let node_id = |i: usize, j: usize| (j * (nx + 1) + i + 1) as u64;
    let mut facets = Vec::new();
    for i in 0..nx {
        facets.push([node_id(i, 0), node_id(i + 1, 0)]);
        facets.push([node_id(i, ny), node_id(i + 1, ny)]);
    }
    for j in 0..ny {
        facets.push([node_id(0, j), node_id(0, j + 1)]);
        facets.push([node_id(nx, j), node_id(nx, j + 1)]);
    }
    facets
}
