//! In-process multi-rank transport.
//!
//! Each rank owns one [`ThreadComm`] endpoint and is expected to run on its
//! own thread. Endpoints are connected by a full mesh of crossbeam channels;
//! a shared [`std::sync::Barrier`] backs the collective barrier. Messages
//! are tagged with their source rank and buffered per source, so a matched
//! send/receive pair completes regardless of how traffic from other ranks
//! interleaves.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, Barrier};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

use crate::{CommScalar, Communicator};

struct Envelope {
    source: usize,
    payload: Box<dyn Any + Send>,
}

pub struct ThreadComm {
    rank: usize,
    size: usize,
    senders: Vec<Sender<Envelope>>,
    receiver: Receiver<Envelope>,
    barrier: Arc<Barrier>,
    // Messages that arrived out of source order, queued per source rank.
    pending: RefCell<Vec<VecDeque<Box<dyn Any + Send>>>>,
}

impl ThreadComm {
    /// Creates a fully connected group of `size` endpoints, one per rank.
    pub fn create(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "communicator group must have at least one rank");
        let mut senders = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = unbounded();
            senders.push(tx);
            receivers.push(rx);
        }
        let barrier = Arc::new(Barrier::new(size));
        debug!("created in-process rank group of size {}", size);
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| ThreadComm {
                rank,
                size,
                senders: senders.clone(),
                receiver,
                barrier: Arc::clone(&barrier),
                pending: RefCell::new((0..size).map(|_| VecDeque::new()).collect()),
            })
            .collect()
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.barrier.wait();
    }

    fn send<T: CommScalar>(&self, buf: &[T], dest: usize) {
        assert!(
            dest < self.size,
            "rank {}: send to rank {} outside group of {}",
            self.rank,
            dest,
            self.size
        );
        assert_ne!(self.rank, dest, "rank {}: send to self", self.rank);
        let envelope = Envelope {
            source: self.rank,
            payload: Box::new(buf.to_vec()),
        };
        if self.senders[dest].send(envelope).is_err() {
            panic!(
                "rank {}: peer rank {} disconnected before receiving",
                self.rank, dest
            );
        }
    }

    fn recv_vec<T: CommScalar>(&self, source: usize) -> Vec<T> {
        assert!(
            source < self.size,
            "rank {}: receive from rank {} outside group of {}",
            self.rank,
            source,
            self.size
        );
        assert_ne!(self.rank, source, "rank {}: receive from self", self.rank);

        let mut pending = self.pending.borrow_mut();
        let payload = if let Some(queued) = pending[source].pop_front() {
            queued
        } else {
            loop {
                let envelope = self.receiver.recv().unwrap_or_else(|_| {
                    panic!(
                        "rank {}: all peers disconnected while waiting on rank {}",
                        self.rank, source
                    )
                });
                if envelope.source == source {
                    break envelope.payload;
                }
                pending[envelope.source].push_back(envelope.payload);
            }
        };

        *payload.downcast::<Vec<T>>().unwrap_or_else(|_| {
            panic!(
                "rank {}: message from rank {} has unexpected payload type (expected {})",
                self.rank,
                source,
                std::any::type_name::<T>()
            )
        })
    }
}
