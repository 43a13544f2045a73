//! MPI transport: one OS process per rank, launched by `mpirun`.
//!
//! Point-to-point calls map onto tagged sends and receives of the underlying
//! `SimpleCommunicator`; broadcast, barrier and split use the native MPI
//! collectives. MPI's default error handler aborts the whole job on a
//! transport failure, so there is no timeout here.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use ::mpi::topology::{Color, SimpleCommunicator};
use ::mpi::traits::*;

use super::{CommStats, Communicator, Payload};
use crate::error::{transport_error, Result};

/// A communicator backed by an MPI communicator.
pub struct MpiComm {
    comm: SimpleCommunicator,
    world_rank: usize,
    members: Rc<[usize]>,
    stats: Rc<Cell<CommStats>>,
}

impl MpiComm {
    /// Wraps the world communicator of an initialised MPI universe.
    pub fn world(world: SimpleCommunicator) -> Self {
        let world_rank = world.rank() as usize;
        let members = (0..world.size() as usize).collect();
        MpiComm {
            comm: world,
            world_rank,
            members,
            stats: Rc::new(Cell::new(CommStats::default())),
        }
    }

    /// Terminates every process of the job with `code`.
    pub fn abort(&self, code: i32) -> ! {
        self.comm.abort(code)
    }

    fn tag(&self, tag: u32) -> Result<i32> {
        i32::try_from(tag).map_err(|_| transport_error(self.world_rank, format!("tag {tag} exceeds the MPI tag range")))
    }

    fn record(&self, started: Instant, messages: u64, bytes: u64) {
        let mut stats = self.stats.get();
        stats.messages_sent += messages;
        stats.bytes_sent += bytes;
        stats.comm_time += started.elapsed();
        self.stats.set(stats);
    }

    fn check_peer(&self, peer: usize) -> Result<i32> {
        if peer >= self.members.len() {
            return Err(transport_error(
                self.world_rank,
                format!("rank {} out of range for group of {}", peer, self.members.len()),
            ));
        }
        Ok(peer as i32)
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn world_rank_of(&self, rank: usize) -> usize {
        self.members[rank]
    }

    fn send<T: Payload>(&self, dest: usize, tag: u32, data: &[T]) -> Result<()> {
        let dest = self.check_peer(dest)?;
        let tag = self.tag(tag)?;
        let started = Instant::now();
        self.comm.process_at_rank(dest).send_with_tag(data, tag);
        self.record(started, 1, std::mem::size_of_val(data) as u64);
        Ok(())
    }

    fn recv<T: Payload>(&self, source: usize, tag: u32) -> Result<Vec<T>> {
        let source = self.check_peer(source)?;
        let tag = self.tag(tag)?;
        let started = Instant::now();
        let (data, _status) = self.comm.process_at_rank(source).receive_vec_with_tag::<T>(tag);
        self.record(started, 0, 0);
        Ok(data)
    }

    fn split(&self, color: usize, key: usize) -> Result<Self> {
        let started = Instant::now();
        let color = i32::try_from(color).map_err(|_| transport_error(self.world_rank, "split color exceeds i32"))?;
        let key = i32::try_from(key).map_err(|_| transport_error(self.world_rank, "split key exceeds i32"))?;
        let comm = self
            .comm
            .split_by_color_with_key(Color::with_value(color), key)
            .ok_or_else(|| transport_error(self.world_rank, "split produced no communicator"))?;

        let mut world_ranks = vec![0i32; comm.size() as usize];
        comm.all_gather_into(&(self.world_rank as i32), &mut world_ranks[..]);
        self.record(started, 0, 0);

        Ok(MpiComm {
            comm,
            world_rank: self.world_rank,
            members: world_ranks.into_iter().map(|r| r as usize).collect(),
            stats: Rc::clone(&self.stats),
        })
    }

    fn stats(&self) -> CommStats {
        self.stats.get()
    }

    fn broadcast_into<T: Payload>(&self, root: usize, buf: &mut [T]) -> Result<()> {
        let root_rank = self.check_peer(root)?;
        let started = Instant::now();
        self.comm.process_at_rank(root_rank).broadcast_into(buf);
        let sent = if self.rank() == root { 1 } else { 0 };
        self.record(started, sent, sent * std::mem::size_of_val(buf) as u64);
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        let started = Instant::now();
        self.comm.barrier();
        self.record(started, 0, 0);
        Ok(())
    }
}
