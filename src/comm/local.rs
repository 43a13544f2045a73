//! In-process cluster transport.
//!
//! [`LocalCluster::run`] starts one scoped OS thread per rank and hands each
//! thread a world [`LocalComm`]. Every rank owns an unbounded inbox; a send
//! pushes an envelope into the destination inbox, a receive drains its own
//! inbox until the matching envelope shows up, parking non-matching ones in a
//! pending queue.
//!
//! # Failure handling
//!
//! - A rank whose job function returns `Err` (or panics) raises the cluster
//!   abort flag. Peers blocked in a receive observe it on their next poll and
//!   fail with [`SummaError::Aborted`].
//! - An optional job-wide deadline ([`ClusterOptions::timeout`]) is fixed when
//!   the cluster starts. A receive still waiting past it fails with
//!   [`SummaError::Timeout`]. Without a deadline a receive waits until the
//!   message arrives or the job aborts.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::{CommStats, Communicator, Payload, RESERVED_TAG_BASE};
use crate::error::{configuration_error, transport_error, Result, SummaError};

/// Interval at which a blocked receive re-checks the abort flag and deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

const TAG_SPLIT_GATHER: u32 = RESERVED_TAG_BASE + 16;
const TAG_SPLIT_TABLE: u32 = RESERVED_TAG_BASE + 17;

/// Options fixed for the lifetime of one cluster run.
#[derive(Debug, Clone, Default)]
pub struct ClusterOptions {
    /// Shared wall-clock budget for the whole run; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

/// Entry point for running a closure on every rank of an in-process cluster.
pub struct LocalCluster;

impl LocalCluster {
    /// Runs `job` on `size` ranks and returns each rank's result, indexed by world rank.
    ///
    /// Returns a configuration error if `size` is zero.
    pub fn run<R, F>(size: usize, options: ClusterOptions, job: F) -> Result<Vec<Result<R>>>
    where
        R: Send,
        F: Fn(LocalComm) -> Result<R> + Sync,
    {
        if size == 0 {
            return Err(configuration_error("cluster needs at least one rank"));
        }

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| mpsc::channel()).unzip();
        let fabric = Arc::new(Fabric {
            inboxes: senders,
            aborted: AtomicBool::new(false),
            deadline: options.timeout.map(|t| Instant::now() + t),
            started: Instant::now(),
        });

        let job = &job;
        let results = thread::scope(|scope| {
            let handles: Vec<_> = receivers
                .into_iter()
                .enumerate()
                .map(|(rank, inbox)| {
                    let fabric = Arc::clone(&fabric);
                    scope.spawn(move || {
                        let comm = LocalComm::world(rank, Arc::clone(&fabric), inbox);
                        let outcome = catch_unwind(AssertUnwindSafe(|| job(comm)))
                            .unwrap_or_else(|_| Err(transport_error(rank, "rank panicked")));
                        if let Err(err) = &outcome {
                            debug!("rank {rank} failed: {err}");
                            fabric.abort();
                        }
                        outcome
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(rank, handle)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(transport_error(rank, "rank thread panicked")))
                })
                .collect::<Vec<_>>()
        });

        Ok(results)
    }
}

struct Envelope {
    source: usize,
    context: Arc<[u32]>,
    tag: u32,
    payload: Box<dyn Any + Send>,
}

/// State shared by every rank of one cluster run.
struct Fabric {
    inboxes: Vec<Sender<Envelope>>,
    aborted: AtomicBool,
    deadline: Option<Instant>,
    started: Instant,
}

impl Fabric {
    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Per-rank side of the fabric, shared by all communicators of that rank.
struct Endpoint {
    world_rank: usize,
    fabric: Arc<Fabric>,
    inbox: Receiver<Envelope>,
    pending: RefCell<VecDeque<Envelope>>,
    stats: Cell<CommStats>,
}

impl Endpoint {
    fn record(&self, started: Instant, messages: u64, bytes: u64) {
        let mut stats = self.stats.get();
        stats.messages_sent += messages;
        stats.bytes_sent += bytes;
        stats.comm_time += started.elapsed();
        self.stats.set(stats);
    }

    fn take_pending(&self, source: usize, context: &[u32], tag: u32) -> Option<Envelope> {
        let mut pending = self.pending.borrow_mut();
        let pos = pending
            .iter()
            .position(|env| env.source == source && env.tag == tag && *env.context == *context)?;
        pending.remove(pos)
    }

    fn wait_for(&self, source: usize, context: &[u32], tag: u32) -> Result<Envelope> {
        if let Some(env) = self.take_pending(source, context, tag) {
            return Ok(env);
        }
        loop {
            match self.inbox.recv_timeout(POLL_INTERVAL) {
                Ok(env) => {
                    if env.source == source && env.tag == tag && *env.context == *context {
                        return Ok(env);
                    }
                    self.pending.borrow_mut().push_back(env);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.fabric.is_aborted() {
                        return Err(SummaError::Aborted {
                            rank: self.world_rank,
                        });
                    }
                    if let Some(deadline) = self.fabric.deadline {
                        if Instant::now() >= deadline {
                            warn!(
                                "rank {} timed out waiting for rank {} (tag {})",
                                self.world_rank, source, tag
                            );
                            self.fabric.abort();
                            return Err(SummaError::Timeout {
                                rank: self.world_rank,
                                peer: source,
                                waited: self.fabric.started.elapsed(),
                            });
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(transport_error(self.world_rank, "inbox disconnected"));
                }
            }
        }
    }
}

/// A communicator over a subset of the ranks of a [`LocalCluster`].
///
/// Not `Send`: a communicator lives on the thread of the rank it belongs to.
pub struct LocalComm {
    endpoint: Rc<Endpoint>,
    members: Rc<[usize]>,
    rank: usize,
    context: Arc<[u32]>,
    splits: Cell<u32>,
}

impl LocalComm {
    fn world(rank: usize, fabric: Arc<Fabric>, inbox: Receiver<Envelope>) -> Self {
        let size = fabric.inboxes.len();
        LocalComm {
            endpoint: Rc::new(Endpoint {
                world_rank: rank,
                fabric,
                inbox,
                pending: RefCell::new(VecDeque::new()),
                stats: Cell::new(CommStats::default()),
            }),
            members: (0..size).collect(),
            rank,
            context: Arc::from(Vec::new()),
            splits: Cell::new(0),
        }
    }

    fn check_peer(&self, peer: usize) -> Result<()> {
        if peer >= self.members.len() {
            return Err(transport_error(
                self.endpoint.world_rank,
                format!("rank {} out of range for group of {}", peer, self.members.len()),
            ));
        }
        Ok(())
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn world_rank_of(&self, rank: usize) -> usize {
        self.members[rank]
    }

    fn send<T: Payload>(&self, dest: usize, tag: u32, data: &[T]) -> Result<()> {
        self.check_peer(dest)?;
        let started = Instant::now();
        let world_dest = self.members[dest];
        let envelope = Envelope {
            source: self.endpoint.world_rank,
            context: Arc::clone(&self.context),
            tag,
            payload: Box::new(data.to_vec()),
        };
        self.endpoint.fabric.inboxes[world_dest]
            .send(envelope)
            .map_err(|_| {
                transport_error(
                    self.endpoint.world_rank,
                    format!("rank {world_dest} is no longer receiving"),
                )
            })?;
        self.endpoint
            .record(started, 1, std::mem::size_of_val(data) as u64);
        Ok(())
    }

    fn recv<T: Payload>(&self, source: usize, tag: u32) -> Result<Vec<T>> {
        self.check_peer(source)?;
        let started = Instant::now();
        let world_source = self.members[source];
        let envelope = self.endpoint.wait_for(world_source, &self.context, tag)?;
        self.endpoint.record(started, 0, 0);
        envelope.payload.downcast::<Vec<T>>().map(|data| *data).map_err(|_| {
            transport_error(
                self.endpoint.world_rank,
                format!("message from rank {world_source} (tag {tag}) has an unexpected element type"),
            )
        })
    }

    fn split(&self, color: usize, key: usize) -> Result<Self> {
        let seq = self.splits.get();
        self.splits.set(seq + 1);

        // Rank 0 collects (color, key) pairs from everyone and hands back the flat table.
        let mut table = vec![color, key];
        if self.rank == 0 {
            for source in 1..self.size() {
                let entry = self.recv::<usize>(source, TAG_SPLIT_GATHER)?;
                table.extend(entry);
            }
            for dest in 1..self.size() {
                self.send(dest, TAG_SPLIT_TABLE, &table)?;
            }
        } else {
            self.send(0, TAG_SPLIT_GATHER, &table)?;
            table = self.recv::<usize>(0, TAG_SPLIT_TABLE)?;
        }
        if table.len() != 2 * self.size() {
            return Err(transport_error(self.endpoint.world_rank, "split table has the wrong length"));
        }

        let mut group: Vec<(usize, usize)> = table
            .chunks_exact(2)
            .enumerate()
            .filter(|(_, entry)| entry[0] == color)
            .map(|(parent_rank, entry)| (entry[1], parent_rank))
            .collect();
        group.sort_unstable();

        let members: Rc<[usize]> = group
            .iter()
            .map(|&(_, parent_rank)| self.members[parent_rank])
            .collect();
        let rank = group
            .iter()
            .position(|&(_, parent_rank)| parent_rank == self.rank)
            .ok_or_else(|| transport_error(self.endpoint.world_rank, "split lost this rank"))?;

        let mut context = self.context.to_vec();
        context.push(seq);
        context.push(color as u32);

        Ok(LocalComm {
            endpoint: Rc::clone(&self.endpoint),
            members,
            rank,
            context: Arc::from(context),
            splits: Cell::new(0),
        })
    }

    fn stats(&self) -> CommStats {
        self.endpoint.stats.get()
    }
}
