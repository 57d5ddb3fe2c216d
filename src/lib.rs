pub mod dof;
pub mod element;
pub mod kernel;
pub mod mesh;
pub mod nonlinear;
pub mod params;
pub mod quadrature;
pub mod weakform;

pub mod comm {
    pub use ferrox_comm::*;
}

pub mod sparse {
    pub use ferrox_sparse::*;
}

pub extern crate nalgebra;
pub extern crate nalgebra_sparse;

/// Scalar bound shared by all `ferrox` numerics.
pub use ferrox_sparse::Real;
