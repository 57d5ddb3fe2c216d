//! Cross-rank redistribution of assembled systems.
//!
//! The master holds the fully reduced matrix and right-hand side. The
//! [`Distributor`] scatters contiguous row blocks to every rank, the
//! distributed CG driver performs the row-partitioned matrix-vector
//! products, and the solution is gathered back to every rank. All control
//! flow (convergence tests, iteration counts) is computed redundantly from
//! replicated full vectors, so every rank takes identical branches.

use std::ops::Range;

use ferrox_comm::{CommScalar, Communicator};
use log::debug;
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;

use crate::cg::{CgFailure, CgParameters, JacobiPreconditioner, LinearOperator};
use crate::{prepare_initial_guess, Real, SolverError};

/// Row-block redistribution of a master-held system.
pub struct Distributor<'a, C: Communicator> {
    comm: &'a C,
    root: usize,
}

impl<'a, C: Communicator> Distributor<'a, C> {
    pub fn new(comm: &'a C, root: usize) -> Self {
        assert!(root < comm.size(), "root rank {} outside group", root);
        Self { comm, root }
    }

    pub fn root(&self) -> usize {
        self.root
    }

    /// Near-equal contiguous row ranges, one per rank, in rank order.
    pub fn row_ranges(&self, num_rows: usize) -> Vec<Range<usize>> {
        let size = self.comm.size();
        let base = num_rows / size;
        let remainder = num_rows % size;
        let mut ranges = Vec::with_capacity(size);
        let mut start = 0;
        for rank in 0..size {
            let len = base + usize::from(rank < remainder);
            ranges.push(start..start + len);
            start += len;
        }
        ranges
    }

    /// Scatters the root's matrix as per-rank row blocks.
    ///
    /// Every rank returns its own block as a CSR matrix of shape
    /// `(local rows) x (global columns)`; row indices are rebased so local
    /// row 0 is the first row of the rank's range.
    pub fn scatter_csr<T>(&self, matrix: Option<&CsrMatrix<T>>) -> CsrMatrix<T>
    where
        T: Real + CommScalar,
    {
        let comm = self.comm;
        let mut dims = [0u64; 2];
        if comm.rank() == self.root {
            let matrix = matrix.expect("scatter_csr root called without a matrix");
            dims = [matrix.nrows() as u64, matrix.ncols() as u64];
        }
        comm.broadcast(&mut dims, self.root);
        let (num_rows, num_cols) = (dims[0] as usize, dims[1] as usize);
        let ranges = self.row_ranges(num_rows);

        let (offsets, indices, values) = if comm.rank() == self.root {
            let matrix = matrix.expect("scatter_csr root called without a matrix");
            let row_offsets = matrix.row_offsets();
            let mut own = None;
            for (rank, range) in ranges.iter().enumerate() {
                let nnz_start = row_offsets[range.start];
                let nnz_end = row_offsets[range.end];
                let offsets: Vec<u64> = row_offsets[range.start..=range.end]
                    .iter()
                    .map(|&o| (o - nnz_start) as u64)
                    .collect();
                let indices: Vec<u64> = matrix.col_indices()[nnz_start..nnz_end]
                    .iter()
                    .map(|&j| j as u64)
                    .collect();
                let values = matrix.values()[nnz_start..nnz_end].to_vec();
                if rank == self.root {
                    own = Some((offsets, indices, values));
                } else {
                    comm.send(&offsets, rank);
                    comm.send(&indices, rank);
                    comm.send(&values, rank);
                }
            }
            own.expect("root range missing from partition")
        } else {
            let offsets = comm.recv_vec::<u64>(self.root);
            let indices = comm.recv_vec::<u64>(self.root);
            let values = comm.recv_vec::<T>(self.root);
            (offsets, indices, values)
        };

        let local_rows = ranges[comm.rank()].len();
        debug!(
            "rank {}: received row block of {} rows, {} nonzeros",
            comm.rank(),
            local_rows,
            values.len()
        );
        CsrMatrix::try_from_csr_data(
            local_rows,
            num_cols,
            offsets.iter().map(|&o| o as usize).collect(),
            indices.iter().map(|&j| j as usize).collect(),
            values,
        )
        .expect("scattered row block is valid CSR by construction")
    }

    /// Broadcasts a master-held vector to every rank.
    pub fn broadcast_vector<T>(&self, vector: Option<&DVector<T>>) -> DVector<T>
    where
        T: Real + CommScalar,
    {
        let data = if self.comm.rank() == self.root {
            Some(vector.expect("broadcast_vector root called without data").as_slice().to_vec())
        } else {
            None
        };
        DVector::from_vec(self.comm.broadcast_vec(data, self.root))
    }

    /// Gathers per-rank chunks into the full vector on every rank.
    pub fn allgather_chunks<T>(&self, local: &[T], ranges: &[Range<usize>]) -> DVector<T>
    where
        T: Real + CommScalar,
    {
        let comm = self.comm;
        assert_eq!(
            local.len(),
            ranges[comm.rank()].len(),
            "rank {}: chunk length does not match row range",
            comm.rank()
        );
        let full = if let Some(chunks) = comm.gather(local, self.root) {
            let mut full = Vec::with_capacity(ranges.last().map_or(0, |r| r.end));
            for chunk in &chunks {
                full.extend_from_slice(chunk);
            }
            Some(full)
        } else {
            None
        };
        DVector::from_vec(comm.broadcast_vec(full, self.root))
    }
}

/// The distributed matvec: local row-block product, then allgather.
struct RowBlockOperator<'a, T: Real, C: Communicator> {
    local: &'a CsrMatrix<T>,
    distributor: &'a Distributor<'a, C>,
    ranges: &'a [Range<usize>],
}

impl<'a, T, C> LinearOperator<T> for RowBlockOperator<'a, T, C>
where
    T: Real + CommScalar,
    C: Communicator,
{
    fn apply(&self, y: &mut DVector<T>, x: &DVector<T>) {
        let mut chunk = vec![T::zero(); self.local.nrows()];
        for (i, row) in self.local.row_iter().enumerate() {
            let mut sum = T::zero();
            for (&j, &v) in row.col_indices().iter().zip(row.values()) {
                sum += v * x[j];
            }
            chunk[i] = sum;
        }
        y.copy_from(&self.distributor.allgather_chunks(&chunk, self.ranges));
    }
}

/// Solves the master-held system with row-partitioned preconditioned CG.
///
/// Collective: every rank of `comm` must call this with the same
/// parameters; non-root ranks pass `None` for the system. On return every
/// rank holds the full solution in `lhs`. Iteration control is replicated,
/// so a convergence failure is observed identically by the whole group.
pub fn solve_distributed_cg<T, C>(
    comm: &C,
    root: usize,
    matrix: Option<&CsrMatrix<T>>,
    rhs: Option<&DVector<T>>,
    lhs: &mut DVector<T>,
    parameters: &CgParameters<T>,
) -> Result<usize, SolverError>
where
    T: Real + CommScalar,
    C: Communicator,
{
    let distributor = Distributor::new(comm, root);
    let local = distributor.scatter_csr(matrix);
    let b = distributor.broadcast_vector(rhs);
    let num_rows = b.len();
    let ranges = distributor.row_ranges(num_rows);

    // The guess decision is taken on the root and broadcast so that every
    // rank starts the iteration from bit-identical state.
    if comm.rank() == root {
        let _ = prepare_initial_guess(lhs, &b);
    }
    let guess = distributor.broadcast_vector(if comm.rank() == root { Some(&*lhs) } else { None });
    *lhs = guess;

    let local_diag: Vec<T> = {
        let range = &ranges[comm.rank()];
        (0..local.nrows())
            .map(|i| {
                let global_row = range.start + i;
                let row = local.row(i);
                row.col_indices()
                    .iter()
                    .position(|&j| j == global_row)
                    .map(|k| row.values()[k])
                    .unwrap_or_else(T::zero)
            })
            .collect()
    };
    let diag = distributor.allgather_chunks(&local_diag, &ranges);
    let preconditioner = JacobiPreconditioner::from_diagonal(diag)?;

    let operator = RowBlockOperator {
        local: &local,
        distributor: &distributor,
        ranges: &ranges,
    };
    let mut workspace = crate::cg::CgWorkspace::default();
    crate::cg::pcg(&operator, &preconditioner, &b, lhs, parameters, &mut workspace)
        .map_err(|failure: CgFailure<T>| failure.into_solver_error("distributed-pcg"))
}
