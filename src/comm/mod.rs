//! Message-passing layer the SUMMA engine is written against.
//!
//! The [`Communicator`] trait describes a group of ranks that can exchange
//! typed buffers with blocking point-to-point calls and a handful of
//! collectives built on top of them. Sub-groups are derived collectively with
//! [`Communicator::split`], mirroring the split-by-color model of MPI.
//!
//! # Semantics
//!
//! - **Blocking**: [`Communicator::recv`] returns only once the matching
//!   message has arrived. Sends are buffered and return once the payload is
//!   queued for the destination.
//! - **Matching**: a receive matches on (source rank, tag, communicator).
//!   Messages between the same pair with the same tag never overtake each
//!   other.
//! - **Failure**: every transport failure is fatal and surfaces as a
//!   transport-class [`SummaError`](crate::error::SummaError). There is no
//!   retry.
//!
//! # Available transports
//!
//! - [`local::LocalCluster`]: one OS thread per rank, channel-backed.
//! - `mpi::MpiComm` (feature `mpi`): one process per rank under `mpirun`.

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;

use std::time::Duration;

use crate::error::{transport_error, Result};

pub use local::{ClusterOptions, LocalCluster, LocalComm};
#[cfg(feature = "mpi")]
pub use self::mpi::MpiComm;

/// Tags at or above this value are reserved for collectives.
///
/// Kept below 32767, the smallest tag bound an MPI library may advertise.
pub const RESERVED_TAG_BASE: u32 = 1 << 14;

/// Element type that can travel in a message.
#[cfg(not(feature = "mpi"))]
pub trait Payload: Clone + Send + 'static {}

#[cfg(not(feature = "mpi"))]
impl<T: Clone + Send + 'static> Payload for T {}

/// Element type that can travel in a message.
#[cfg(feature = "mpi")]
pub trait Payload: Clone + Send + 'static + ::mpi::datatype::Equivalence {}

#[cfg(feature = "mpi")]
impl<T: Clone + Send + 'static + ::mpi::datatype::Equivalence> Payload for T {}

const TAG_BROADCAST: u32 = RESERVED_TAG_BASE;
const TAG_BARRIER_ARRIVE: u32 = RESERVED_TAG_BASE + 1;
const TAG_BARRIER_RELEASE: u32 = RESERVED_TAG_BASE + 2;

/// Per-rank communication counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CommStats {
    /// Messages sent by this rank.
    pub messages_sent: u64,
    /// Payload bytes sent by this rank.
    pub bytes_sent: u64,
    /// Wall time spent inside communication calls.
    pub comm_time: Duration,
}

impl CommStats {
    /// Difference between two snapshots of the same rank's counters.
    pub fn since(&self, earlier: &CommStats) -> CommStats {
        CommStats {
            messages_sent: self.messages_sent - earlier.messages_sent,
            bytes_sent: self.bytes_sent - earlier.bytes_sent,
            comm_time: self.comm_time.saturating_sub(earlier.comm_time),
        }
    }
}

/// A group of ranks exchanging typed buffers.
///
/// Ranks are numbered `0..size()` relative to this communicator. A rank's
/// relative numbering in a sub-group produced by [`split`](Self::split) is
/// determined by the `key` it passed.
pub trait Communicator: Sized {
    /// This rank's index within the communicator.
    fn rank(&self) -> usize;

    /// Number of ranks in the communicator.
    fn size(&self) -> usize;

    /// World rank of the member at relative rank `rank`.
    fn world_rank_of(&self, rank: usize) -> usize;

    /// Sends a copy of `data` to relative rank `dest`.
    fn send<T: Payload>(&self, dest: usize, tag: u32, data: &[T]) -> Result<()>;

    /// Blocks until a message from relative rank `source` with `tag` arrives.
    fn recv<T: Payload>(&self, source: usize, tag: u32) -> Result<Vec<T>>;

    /// Collectively partitions the communicator.
    ///
    /// Every member must call `split`. Members passing the same `color` end up
    /// in the same sub-group, ordered by ascending `key` (ties broken by the
    /// parent rank).
    fn split(&self, color: usize, key: usize) -> Result<Self>;

    /// Snapshot of this rank's communication counters.
    fn stats(&self) -> CommStats;

    /// Receives into a caller-owned buffer whose length must match the message.
    fn recv_into<T: Payload>(
        &self,
        source: usize,
        tag: u32,
        buf: &mut [T],
    ) -> Result<()> {
        let data = self.recv::<T>(source, tag)?;
        if data.len() != buf.len() {
            return Err(transport_error(
                self.world_rank_of(self.rank()),
                format!(
                    "message from rank {} carries {} elements, receive buffer holds {}",
                    source,
                    data.len(),
                    buf.len()
                ),
            ));
        }
        buf.clone_from_slice(&data);
        Ok(())
    }

    /// Broadcasts `buf` from `root` to every member, replacing each member's contents.
    fn broadcast_vec<T: Payload>(&self, root: usize, buf: &mut Vec<T>) -> Result<()> {
        if self.rank() == root {
            for dest in (0..self.size()).filter(|&r| r != root) {
                self.send(dest, TAG_BROADCAST, buf)?;
            }
        } else {
            *buf = self.recv::<T>(root, TAG_BROADCAST)?;
        }
        Ok(())
    }

    /// Broadcasts a fixed-length buffer from `root`; lengths must agree on every member.
    fn broadcast_into<T: Payload>(&self, root: usize, buf: &mut [T]) -> Result<()> {
        if self.rank() == root {
            for dest in (0..self.size()).filter(|&r| r != root) {
                self.send(dest, TAG_BROADCAST, buf)?;
            }
            Ok(())
        } else {
            self.recv_into(root, TAG_BROADCAST, buf)
        }
    }

    /// Blocks until every member has entered the barrier.
    fn barrier(&self) -> Result<()> {
        let empty: [u8; 0] = [];
        if self.rank() == 0 {
            for source in 1..self.size() {
                self.recv::<u8>(source, TAG_BARRIER_ARRIVE)?;
            }
            for dest in 1..self.size() {
                self.send(dest, TAG_BARRIER_RELEASE, &empty)?;
            }
        } else {
            self.send(0, TAG_BARRIER_ARRIVE, &empty)?;
            self.recv::<u8>(0, TAG_BARRIER_RELEASE)?;
        }
        Ok(())
    }
}
