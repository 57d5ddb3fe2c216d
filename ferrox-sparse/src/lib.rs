//! Sparse linear solver abstraction for `ferrox`.
//!
//! Interchangeable backends share one `initialize`/`solve`/`free` contract;
//! a nonzero backend status is fatal and surfaces the backend's own
//! diagnostic, never a silent retry. The [`distribute`] module redistributes
//! an assembled system across ranks and gathers the solution back.

use core::fmt;
use std::error::Error;

use log::debug;
use nalgebra::{DMatrix, DVector, RealField};
use nalgebra_sparse::CsrMatrix;

pub mod cg;
pub mod distribute;

pub use cg::{CgParameters, CgSolver, CgWorkspace, JacobiPreconditioner, LinearOperator};

/// Scalar bound shared by all `ferrox` numerics.
pub trait Real: RealField + Copy {}

impl<T: RealField + Copy> Real for T {}

/// Structural symmetry declared to a backend at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymmetryMode {
    General,
    Symmetric,
    PositiveDefinite,
}

/// A failed or rejected backend invocation.
#[derive(Debug)]
pub enum SolverError {
    /// The backend reported a nonzero status; `message` is its diagnostic.
    Backend {
        backend: &'static str,
        status: i32,
        message: String,
    },
    /// The backend cannot handle the requested configuration.
    Unsupported {
        backend: &'static str,
        reason: String,
    },
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverError::Backend {
                backend,
                status,
                message,
            } => {
                write!(f, "backend '{}' failed with status {}: {}", backend, status, message)
            }
            SolverError::Unsupported { backend, reason } => {
                write!(f, "backend '{}' does not support this system: {}", backend, reason)
            }
        }
    }
}

impl Error for SolverError {}

/// Uniform contract over interchangeable direct and Krylov backends.
///
/// `initialize` binds the backend to one system shape and symmetry mode,
/// `solve` may be invoked repeatedly against matrices of that shape, and
/// `free` releases backend resources. Calling `solve` before `initialize`
/// is a contract violation.
pub trait SparseSolver<T: Real> {
    fn name(&self) -> &'static str;

    fn initialize(
        &mut self,
        matrix: &CsrMatrix<T>,
        symmetry: SymmetryMode,
        rhs_columns: usize,
    ) -> Result<(), SolverError>;

    fn solve(
        &mut self,
        matrix: &CsrMatrix<T>,
        lhs: &mut DVector<T>,
        rhs: &DVector<T>,
    ) -> Result<(), SolverError>;

    fn free(&mut self);
}

/// Ensures `lhs` is a usable initial guess for `rhs`.
///
/// Returns `false` (and resizes `lhs` to a zero guess) when the lengths do
/// not match, signalling "no initial guess" to the backend.
pub fn prepare_initial_guess<T: Real>(lhs: &mut DVector<T>, rhs: &DVector<T>) -> bool {
    if lhs.len() == rhs.len() {
        true
    } else {
        debug!(
            "no usable initial guess (lhs len {}, rhs len {}); starting from zero",
            lhs.len(),
            rhs.len()
        );
        *lhs = DVector::zeros(rhs.len());
        false
    }
}

/// Direct backend: densifies the system and factorizes with LU.
///
/// Stands in for an external direct factorization; only suitable for the
/// moderate system sizes of a single rank.
#[derive(Debug, Default)]
pub struct DenseLuSolver {
    dims: Option<(usize, usize)>,
}

impl DenseLuSolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T: Real> SparseSolver<T> for DenseLuSolver {
    fn name(&self) -> &'static str {
        "dense-lu"
    }

    fn initialize(
        &mut self,
        matrix: &CsrMatrix<T>,
        _symmetry: SymmetryMode,
        rhs_columns: usize,
    ) -> Result<(), SolverError> {
        if rhs_columns != 1 {
            return Err(SolverError::Unsupported {
                backend: "dense-lu",
                reason: format!("expected a single right-hand side, got {}", rhs_columns),
            });
        }
        if matrix.nrows() != matrix.ncols() {
            return Err(SolverError::Unsupported {
                backend: "dense-lu",
                reason: format!("matrix is {}x{}, not square", matrix.nrows(), matrix.ncols()),
            });
        }
        self.dims = Some((matrix.nrows(), matrix.ncols()));
        Ok(())
    }

    fn solve(
        &mut self,
        matrix: &CsrMatrix<T>,
        lhs: &mut DVector<T>,
        rhs: &DVector<T>,
    ) -> Result<(), SolverError> {
        let dims = self.dims.unwrap_or_else(|| {
            panic!("dense-lu backend used before initialize");
        });
        assert_eq!(
            (matrix.nrows(), matrix.ncols()),
            dims,
            "matrix shape changed since initialize"
        );
        let _ = prepare_initial_guess(lhs, rhs);

        let mut dense = DMatrix::zeros(matrix.nrows(), matrix.ncols());
        for (i, j, v) in matrix.triplet_iter() {
            dense[(i, j)] = *v;
        }
        match dense.lu().solve(rhs) {
            Some(solution) => {
                lhs.copy_from(&solution);
                Ok(())
            }
            None => Err(SolverError::Backend {
                backend: "dense-lu",
                status: 1,
                message: "matrix is singular to working precision".to_string(),
            }),
        }
    }

    fn free(&mut self) {
        self.dims = None;
    }
}
