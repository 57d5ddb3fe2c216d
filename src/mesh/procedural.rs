//! Procedural meshes for tests and demos.

use nalgebra::Point2;

use crate::mesh::Mesh;
use crate::Real;

/// A uniform triangulation of the unit square with `nx` by `ny` cells,
/// each cell split into two triangles, all in one block.
///
/// Node IDs are assigned row-major starting from 1; element IDs likewise.
pub fn unit_square<T: Real>(nx: usize, ny: usize, block_id: u64) -> Mesh<T> {
    assert!(nx > 0 && ny > 0, "unit square needs at least one cell per axis");
    let mut mesh = Mesh::new();
    mesh.add_block(block_id, "unit_square");

    let node_id = |i: usize, j: usize| (j * (nx + 1) + i + 1) as u64;
    for j in 0..=ny {
        for i in 0..=nx {
            let x = T::from_usize(i).unwrap() / T::from_usize(nx).unwrap();
            let y = T::from_usize(j).unwrap() / T::from_usize(ny).unwrap();
            mesh.add_node(node_id(i, j), Point2::new(x, y));
        }
    }

    let mut element_id = 1;
    for j in 0..ny {
        for i in 0..nx {
            let (sw, se) = (node_id(i, j), node_id(i + 1, j));
            let (nw, ne) = (node_id(i, j + 1), node_id(i + 1, j + 1));
            mesh.add_element(element_id, block_id, [sw, se, ne]);
            mesh.add_element(element_id + 1, block_id, [sw, ne, nw]);
            element_id += 2;
        }
    }
    mesh
}
