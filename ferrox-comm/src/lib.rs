//! SPMD process context for `ferrox`.
//!
//! Every process (rank) runs the same sequential program and coordinates
//! exclusively through the blocking operations of [`Communicator`]. There is
//! no overlap of communication and computation, no timeout and no
//! partial-failure recovery: a transport failure aborts the whole process
//! group. Payloads are flat scalar slices; structured data is flattened by
//! the caller beforehand.
//!
//! Two backends are provided: [`SerialComm`] for single-rank runs and
//! [`ThreadComm`], which hosts every rank as a thread of one process and is
//! the transport used by the multi-rank tests.

use std::fmt::Debug;

mod thread_comm;

pub use thread_comm::ThreadComm;

/// Scalar types that may travel through a [`Communicator`].
pub trait CommScalar: Copy + Send + PartialEq + Debug + 'static {}

impl CommScalar for u8 {}
impl CommScalar for u32 {}
impl CommScalar for u64 {}
impl CommScalar for usize {}
impl CommScalar for i32 {}
impl CommScalar for i64 {}
impl CommScalar for f32 {}
impl CommScalar for f64 {}

/// Blocking point-to-point and collective communication between ranks.
///
/// All collective operations must be entered by every rank of the group in
/// the same relative order; a rank that skips a collective leaves its peers
/// blocked forever. Point-to-point messages are matched by source rank and
/// delivered in send order for each (source, destination) pair.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Whether this rank is the globally authoritative (rank 0) process.
    fn is_master(&self) -> bool {
        self.rank() == 0
    }

    /// Blocks until every rank of the group has arrived.
    fn barrier(&self);

    /// Blocking send of a flat scalar buffer to `dest`.
    fn send<T: CommScalar>(&self, buf: &[T], dest: usize);

    /// Blocking receive of a whole message from `source`.
    fn recv_vec<T: CommScalar>(&self, source: usize) -> Vec<T>;

    /// Blocking receive into a preallocated buffer; the incoming message
    /// must have exactly `buf.len()` entries.
    fn recv_into<T: CommScalar>(&self, buf: &mut [T], source: usize) {
        let msg = self.recv_vec::<T>(source);
        assert_eq!(
            msg.len(),
            buf.len(),
            "rank {}: message from rank {} has {} entries, expected {}",
            self.rank(),
            source,
            msg.len(),
            buf.len()
        );
        buf.copy_from_slice(&msg);
    }

    /// Sends the same payload to every rank in `dests` (self excluded).
    fn send_same<T: CommScalar>(&self, buf: &[T], dests: &[usize]) {
        for &dest in dests {
            if dest != self.rank() {
                self.send(buf, dest);
            }
        }
    }

    /// One-to-all broadcast of a fixed-size buffer rooted at `root`.
    fn broadcast<T: CommScalar>(&self, buf: &mut [T], root: usize) {
        if self.rank() == root {
            for dest in 0..self.size() {
                if dest != root {
                    self.send(buf, dest);
                }
            }
        } else {
            self.recv_into(buf, root);
        }
    }

    /// One-to-all broadcast where only the root knows the payload length.
    ///
    /// The root passes `Some(data)`, every other rank passes `None`;
    /// all ranks return the root's data.
    fn broadcast_vec<T: CommScalar>(&self, data: Option<Vec<T>>, root: usize) -> Vec<T> {
        if self.rank() == root {
            let data = data.unwrap_or_else(|| {
                panic!("rank {}: broadcast_vec root called without data", root)
            });
            for dest in 0..self.size() {
                if dest != root {
                    self.send(&data, dest);
                }
            }
            data
        } else {
            assert!(
                data.is_none(),
                "rank {}: broadcast_vec payload supplied on non-root rank",
                self.rank()
            );
            self.recv_vec(root)
        }
    }

    /// Master packs once, workers unpack: the root scatters consecutive
    /// chunks of `data` according to `counts` (one entry per rank, known on
    /// every rank) and each rank returns its own chunk.
    fn distribute<T: CommScalar>(&self, data: Option<&[T]>, counts: &[usize], root: usize) -> Vec<T> {
        assert_eq!(
            counts.len(),
            self.size(),
            "rank {}: distribute needs one count per rank",
            self.rank()
        );
        if self.rank() == root {
            let data = data.unwrap_or_else(|| {
                panic!("rank {}: distribute root called without data", root)
            });
            let total: usize = counts.iter().sum();
            assert_eq!(
                data.len(),
                total,
                "rank {}: distribute payload has {} entries, counts sum to {}",
                root,
                data.len(),
                total
            );
            let mut offset = 0;
            let mut own = Vec::new();
            for (dest, &count) in counts.iter().enumerate() {
                let chunk = &data[offset..offset + count];
                if dest == root {
                    own = chunk.to_vec();
                } else {
                    self.send(chunk, dest);
                }
                offset += count;
            }
            own
        } else {
            let chunk = self.recv_vec::<T>(root);
            assert_eq!(
                chunk.len(),
                counts[self.rank()],
                "rank {}: distribute chunk has {} entries, expected {}",
                self.rank(),
                chunk.len(),
                counts[self.rank()]
            );
            chunk
        }
    }

    /// Inverse of [`Communicator::distribute`]: the root returns every
    /// rank's chunk concatenated in rank order, other ranks return `None`.
    fn gather<T: CommScalar>(&self, local: &[T], root: usize) -> Option<Vec<Vec<T>>> {
        if self.rank() == root {
            let mut chunks = Vec::with_capacity(self.size());
            for source in 0..self.size() {
                if source == root {
                    chunks.push(local.to_vec());
                } else {
                    chunks.push(self.recv_vec(source));
                }
            }
            Some(chunks)
        } else {
            self.send(local, root);
            None
        }
    }
}

/// The trivial single-rank context.
///
/// Point-to-point operations have no legal peer and abort; all collectives
/// degenerate to local copies.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialComm;

impl SerialComm {
    pub fn new() -> Self {
        SerialComm
    }
}

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn send<T: CommScalar>(&self, _buf: &[T], dest: usize) {
        panic!("serial context has no peer rank {} to send to", dest);
    }

    fn recv_vec<T: CommScalar>(&self, source: usize) -> Vec<T> {
        panic!("serial context has no peer rank {} to receive from", source);
    }
}
