//! Preconditioned conjugate gradients.

use log::debug;
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;

use crate::{prepare_initial_guess, Real, SolverError, SparseSolver, SymmetryMode};

/// Anything that can act as `y = Ax` on dense vectors.
pub trait LinearOperator<T: Real> {
    fn apply(&self, y: &mut DVector<T>, x: &DVector<T>);
}

impl<T: Real> LinearOperator<T> for CsrMatrix<T> {
    fn apply(&self, y: &mut DVector<T>, x: &DVector<T>) {
        assert_eq!(self.ncols(), x.len(), "operator/vector dimension mismatch");
        assert_eq!(self.nrows(), y.len(), "operator/output dimension mismatch");
        for (i, row) in self.row_iter().enumerate() {
            let mut sum = T::zero();
            for (&j, &v) in row.col_indices().iter().zip(row.values()) {
                sum += v * x[j];
            }
            y[i] = sum;
        }
    }
}

/// Diagonal (Jacobi) preconditioner `z = D^{-1} r`.
#[derive(Debug, Clone)]
pub struct JacobiPreconditioner<T> {
    inv_diag: DVector<T>,
}

impl<T: Real> JacobiPreconditioner<T> {
    /// Extracts the inverse diagonal of `matrix`.
    ///
    /// Fails when a diagonal entry is absent or zero, which CG cannot
    /// meaningfully recover from.
    pub fn from_csr(matrix: &CsrMatrix<T>) -> Result<Self, SolverError> {
        Self::try_invert_diagonal(
            (0..matrix.nrows())
                .map(|i| {
                    let row = matrix.row(i);
                    row.col_indices()
                        .iter()
                        .position(|&j| j == i)
                        .map(|k| row.values()[k])
                        .unwrap_or_else(T::zero)
                })
                .collect(),
        )
    }

    pub fn from_diagonal(diag: DVector<T>) -> Result<Self, SolverError> {
        Self::try_invert_diagonal(diag.iter().copied().collect())
    }

    fn try_invert_diagonal(diag: Vec<T>) -> Result<Self, SolverError> {
        let mut inv_diag = DVector::zeros(diag.len());
        for (i, d) in diag.into_iter().enumerate() {
            if d == T::zero() {
                return Err(SolverError::Backend {
                    backend: "pcg",
                    status: 3,
                    message: format!("zero diagonal entry at row {}", i),
                });
            }
            inv_diag[i] = T::one() / d;
        }
        Ok(Self { inv_diag })
    }
}

impl<T: Real> LinearOperator<T> for JacobiPreconditioner<T> {
    fn apply(&self, y: &mut DVector<T>, x: &DVector<T>) {
        assert_eq!(self.inv_diag.len(), x.len());
        for i in 0..x.len() {
            y[i] = self.inv_diag[i] * x[i];
        }
    }
}

/// Reusable iteration buffers so repeated solves do not reallocate.
#[derive(Debug, Clone)]
pub struct CgWorkspace<T: Real> {
    r: DVector<T>,
    z: DVector<T>,
    p: DVector<T>,
    ap: DVector<T>,
}

impl<T: Real> Default for CgWorkspace<T> {
    fn default() -> Self {
        Self {
            r: DVector::zeros(0),
            z: DVector::zeros(0),
            p: DVector::zeros(0),
            ap: DVector::zeros(0),
        }
    }
}

impl<T: Real> CgWorkspace<T> {
    fn resize(&mut self, dim: usize) {
        self.r.resize_vertically_mut(dim, T::zero());
        self.z.resize_vertically_mut(dim, T::zero());
        self.p.resize_vertically_mut(dim, T::zero());
        self.ap.resize_vertically_mut(dim, T::zero());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CgParameters<T> {
    /// Convergence is declared when `||r|| <= rel_tolerance * ||b||`.
    pub rel_tolerance: T,
    pub max_iterations: usize,
}

impl Default for CgParameters<f64> {
    fn default() -> Self {
        Self {
            rel_tolerance: 1e-10,
            max_iterations: 10_000,
        }
    }
}

pub(crate) enum CgFailure<T> {
    Indefinite { iteration: usize },
    MaxIterationsReached { max_iterations: usize, residual: T },
}

impl<T: Real> CgFailure<T> {
    pub(crate) fn into_solver_error(self, backend: &'static str) -> SolverError {
        match self {
            CgFailure::Indefinite { iteration } => SolverError::Backend {
                backend,
                status: 2,
                message: format!("operator appears indefinite at iteration {}", iteration),
            },
            CgFailure::MaxIterationsReached {
                max_iterations,
                residual,
            } => SolverError::Backend {
                backend,
                status: 1,
                message: format!(
                    "no convergence within {} iterations, relative residual {:?}",
                    max_iterations, residual
                ),
            },
        }
    }
}

/// Preconditioned CG on `A x = b` with the initial guess in `x`.
///
/// Returns the iteration count on convergence.
pub(crate) fn pcg<T, A, P>(
    operator: &A,
    preconditioner: &P,
    b: &DVector<T>,
    x: &mut DVector<T>,
    parameters: &CgParameters<T>,
    workspace: &mut CgWorkspace<T>,
) -> Result<usize, CgFailure<T>>
where
    T: Real,
    A: LinearOperator<T>,
    P: LinearOperator<T>,
{
    let n = b.len();
    assert_eq!(x.len(), n, "initial guess must match right-hand side");
    workspace.resize(n);
    let CgWorkspace { r, z, p, ap } = workspace;

    let b_norm = b.norm();
    if b_norm == T::zero() {
        x.fill(T::zero());
        return Ok(0);
    }
    let abs_tolerance = parameters.rel_tolerance * b_norm;

    // r = b - Ax
    operator.apply(r, x);
    r.neg_mut();
    *r += b;

    if r.norm() <= abs_tolerance {
        return Ok(0);
    }

    preconditioner.apply(z, r);
    p.copy_from(z);
    let mut rz = r.dot(z);

    for iteration in 0..parameters.max_iterations {
        operator.apply(ap, p);
        let pap = p.dot(ap);
        if pap <= T::zero() {
            return Err(CgFailure::Indefinite { iteration });
        }
        let alpha = rz / pap;
        x.axpy(alpha, p, T::one());
        r.axpy(-alpha, ap, T::one());

        let r_norm = r.norm();
        if r_norm <= abs_tolerance {
            debug!("pcg converged after {} iterations, residual {:?}", iteration + 1, r_norm);
            return Ok(iteration + 1);
        }

        preconditioner.apply(z, r);
        let rz_next = r.dot(z);
        let beta = rz_next / rz;
        rz = rz_next;
        // p = z + beta p
        p.axpy(T::one(), z, beta);
    }

    Err(CgFailure::MaxIterationsReached {
        max_iterations: parameters.max_iterations,
        residual: r.norm() / b_norm,
    })
}

/// Krylov backend: Jacobi-preconditioned conjugate gradients.
#[derive(Debug)]
pub struct CgSolver<T: Real> {
    parameters: CgParameters<T>,
    workspace: CgWorkspace<T>,
    preconditioner: Option<JacobiPreconditioner<T>>,
}

impl<T: Real> CgSolver<T> {
    pub fn new(parameters: CgParameters<T>) -> Self {
        Self {
            parameters,
            workspace: CgWorkspace::default(),
            preconditioner: None,
        }
    }
}

impl Default for CgSolver<f64> {
    fn default() -> Self {
        Self::new(CgParameters::default())
    }
}

impl<T: Real> SparseSolver<T> for CgSolver<T> {
    fn name(&self) -> &'static str {
        "pcg"
    }

    fn initialize(
        &mut self,
        matrix: &CsrMatrix<T>,
        symmetry: SymmetryMode,
        rhs_columns: usize,
    ) -> Result<(), SolverError> {
        if symmetry == SymmetryMode::General {
            return Err(SolverError::Unsupported {
                backend: "pcg",
                reason: "conjugate gradients requires a symmetric system".to_string(),
            });
        }
        if rhs_columns != 1 {
            return Err(SolverError::Unsupported {
                backend: "pcg",
                reason: format!("expected a single right-hand side, got {}", rhs_columns),
            });
        }
        self.preconditioner = Some(JacobiPreconditioner::from_csr(matrix)?);
        Ok(())
    }

    fn solve(
        &mut self,
        matrix: &CsrMatrix<T>,
        lhs: &mut DVector<T>,
        rhs: &DVector<T>,
    ) -> Result<(), SolverError> {
        let preconditioner = self
            .preconditioner
            .as_ref()
            .unwrap_or_else(|| panic!("pcg backend used before initialize"));
        let _ = prepare_initial_guess(lhs, rhs);
        pcg(
            matrix,
            preconditioner,
            rhs,
            lhs,
            &self.parameters,
            &mut self.workspace,
        )
        .map(|_| ())
        .map_err(|failure| failure.into_solver_error("pcg"))
    }

    fn free(&mut self) {
        self.preconditioner = None;
        self.workspace = CgWorkspace::default();
    }
}
