//! Process groups and collective communication.
//!
//! Every cross-process operation in the crate is expressed as a collective
//! [`Communicator::allgather`]: each rank contributes one [`Envelope`] and
//! receives the contributions of all ranks, in rank order. Broadcasts and
//! index-based scatters are built on top of it.
//!
//! Envelopes carry a `tag` identifying the operation (for transfers, the plan
//! identity). All ranks of a group must issue the same sequence of tags; a
//! rank that disagrees is reported as [`CommError::CollectiveMismatch`]
//! instead of silently mixing data from two different operations. A rank that
//! skips a call entirely blocks the group, exactly like any synchronous
//! collective.
//!
//! Two communicators are provided:
//!
//! - [`SerialComm`]: a group of one, used for single-process execution.
//! - [`ThreadComm`]: an in-process group of N ranks, one thread per rank,
//!   used to run distributed scenarios without an external message layer.
//!
//! # Example
//!
//! ```
//! use tessera::comm::{Communicator, Payload, ThreadComm};
//!
//! let results = ThreadComm::run(3, |comm| {
//!     let root_value = if comm.rank() == 0 { Payload::Reals(vec![4.0]) } else { Payload::Empty };
//!     comm.broadcast(7, 0, root_value).unwrap()
//! });
//!
//! for payload in results {
//!     assert_eq!(payload, Payload::Reals(vec![4.0]));
//! }
//! ```

use std::fmt;
use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

use crate::jacobian::SubjacKey;
use crate::vector::DiscreteVars;

/// Errors raised by collective operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommError {
    /// A peer issued a different collective call than this rank.
    #[error(
        "collective mismatch on rank {rank}: expected operation {expected:#018x} but rank {peer} issued {found:#018x}"
    )]
    CollectiveMismatch { rank: usize, peer: usize, expected: u64, found: u64 },
    /// A peer left no contribution in the exchange slots.
    #[error("rank {peer} did not contribute to the collective call")]
    MissingContribution { peer: usize },
    /// The root rank failed while running a root-only user function.
    #[error("root rank failed while running '{path}': {message}")]
    RootFailed { path: String, message: String },
    /// A peer failed locally while taking part in a collective call.
    #[error("rank {peer} failed during '{path}': {message}")]
    PeerFailed { peer: usize, path: String, message: String },
    /// The payload received does not have the expected variant.
    #[error("unexpected payload in collective call, expected {expected}")]
    UnexpectedPayload { expected: &'static str },
    /// Broadcast root outside of the group.
    #[error("broadcast root {root} is out of range for a group of size {size}")]
    InvalidRoot { root: usize, size: usize },
}

/// Data exchanged in one collective call.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    /// Nothing to contribute (non-root ranks of a broadcast, empty plans).
    #[default]
    Empty,
    /// A flat real array.
    Reals(Vec<f64>),
    /// Sparse `(global index, value)` contributions.
    Pairs(Vec<(usize, f64)>),
    /// Global indices requested from their owners.
    Indices(Vec<usize>),
    /// Result of a root-only `compute`: output values and discrete outputs.
    Outputs { values: Vec<f64>, imag: Option<Vec<f64>>, discrete: DiscreteVars },
    /// Result of a root-only `compute_partials`.
    Partials(Vec<(SubjacKey, Vec<f64>)>),
    /// The sender failed; receivers must fail too instead of using its data.
    Failed { path: String, message: String },
}

/// One rank's contribution to a collective call.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Identity of the collective operation.
    pub tag: u64,
    /// Contributed data.
    pub payload: Payload,
}

impl Envelope {
    /// Creates a new envelope.
    pub fn new(tag: u64, payload: Payload) -> Self {
        Envelope { tag, payload }
    }
}

/// A static group of cooperating processes.
///
/// Implementations only provide [`allgather`](Communicator::allgather); the
/// tag-checked exchange and the broadcast are derived from it.
pub trait Communicator: Send + Sync + fmt::Debug {
    /// Rank of the calling process inside the group.
    fn rank(&self) -> usize;

    /// Number of processes in the group.
    fn size(&self) -> usize;

    /// Exchanges one envelope per rank. Returns all envelopes in rank order.
    fn allgather(&self, envelope: Envelope) -> Result<Vec<Envelope>, CommError>;

    /// Exchanges payloads and verifies that every rank issued the same operation.
    fn exchange(&self, tag: u64, payload: Payload) -> Result<Vec<Payload>, CommError> {
        let gathered = self.allgather(Envelope::new(tag, payload))?;
        if let Some((peer, env)) = gathered.iter().enumerate().find(|(_, env)| env.tag != tag) {
            return Err(CommError::CollectiveMismatch {
                rank: self.rank(),
                peer,
                expected: tag,
                found: env.tag,
            });
        }
        Ok(gathered.into_iter().map(|env| env.payload).collect())
    }

    /// Broadcasts `payload` from `root`. Non-root contributions are ignored.
    fn broadcast(&self, tag: u64, root: usize, payload: Payload) -> Result<Payload, CommError> {
        let size = self.size();
        if root >= size {
            return Err(CommError::InvalidRoot { root, size });
        }
        let contribution = if self.rank() == root { payload } else { Payload::Empty };
        let mut all = self.exchange(tag, contribution)?;
        Ok(all.swap_remove(root))
    }
}

/// Communicator for single-process execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn allgather(&self, envelope: Envelope) -> Result<Vec<Envelope>, CommError> {
        Ok(vec![envelope])
    }
}

#[derive(Debug)]
struct Shared {
    slots: Mutex<Vec<Option<Envelope>>>,
    barrier: Barrier,
}

/// In-process group of ranks, one thread per rank.
///
/// Each collective writes the caller's envelope into a shared slot, waits for
/// all ranks, reads every slot and waits again before the slots may be reused.
#[derive(Debug, Clone)]
pub struct ThreadComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadComm {
    /// Creates the communicators of a group of `size` ranks.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let size = size.max(1);
        let shared =
            Arc::new(Shared { slots: Mutex::new(vec![None; size]), barrier: Barrier::new(size) });
        (0..size).map(|rank| ThreadComm { rank, shared: Arc::clone(&shared) }).collect()
    }

    /// Runs `f` on every rank of a fresh group and returns the results in rank order.
    ///
    /// A panic on any rank is resumed on the calling thread.
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(ThreadComm) -> T + Sync,
        T: Send,
    {
        let comms = Self::group(size);
        std::thread::scope(|scope| {
            let f = &f;
            let handles: Vec<_> =
                comms.into_iter().map(|comm| scope.spawn(move || f(comm))).collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.slots.lock().len()
    }

    fn allgather(&self, envelope: Envelope) -> Result<Vec<Envelope>, CommError> {
        self.shared.slots.lock()[self.rank] = Some(envelope);
        self.shared.barrier.wait();

        let gathered = {
            let slots = self.shared.slots.lock();
            slots
                .iter()
                .enumerate()
                .map(|(peer, slot)| slot.clone().ok_or(CommError::MissingContribution { peer }))
                .collect::<Result<Vec<_>, _>>()
        };

        // Nobody reads the slots again until every rank has written its next contribution.
        self.shared.barrier.wait();
        self.shared.slots.lock()[self.rank] = None;

        gathered
    }
}
