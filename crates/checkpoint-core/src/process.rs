//! Process identity and cross-process commit barriers
//!
//! Handlers consult a [`RankProvider`] to decide whether their physical
//! writes take effect, and checkpointers synchronize the phases of a save
//! through a [`CommitBarrier`]. Both are injected explicitly so that a group
//! of cooperating processes can be simulated inside a single test binary.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::types::{BarrierId, BarrierState, ProcessIndex};
use crate::{Error, ProcessConfig, Result};

/// Read-only view of this process's place in the group
pub trait RankProvider: Send + Sync {
    /// Zero-based index of this process
    fn process_index(&self) -> ProcessIndex;

    /// Number of cooperating processes
    fn process_count(&self) -> usize;

    /// Index of the process whose writes take effect
    fn primary_process(&self) -> ProcessIndex {
        0
    }

    /// True on the process permitted to write
    fn is_primary(&self) -> bool {
        self.process_index() == self.primary_process()
    }
}

/// Named synchronization point shared by every process in the group
#[async_trait]
pub trait CommitBarrier: Send + Sync {
    /// Block until all processes have reached `name`
    async fn sync(&self, name: &str) -> Result<()>;
}

impl RankProvider for ProcessConfig {
    fn process_index(&self) -> ProcessIndex {
        self.process_index
    }

    fn process_count(&self) -> usize {
        self.process_count
    }

    fn primary_process(&self) -> ProcessIndex {
        self.primary_process
    }
}

/// The only process in a group of one
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl RankProvider for SingleProcess {
    fn process_index(&self) -> ProcessIndex {
        0
    }

    fn process_count(&self) -> usize {
        1
    }
}

#[async_trait]
impl CommitBarrier for SingleProcess {
    async fn sync(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Barrier with its waiting participants
struct LocalBarrier {
    state: BarrierState,
    waiters: Vec<oneshot::Sender<()>>,
}

/// Barrier table shared by the members of a [`LocalProcessGroup`]
struct BarrierTable {
    barriers: DashMap<BarrierId, Arc<Mutex<LocalBarrier>>>,
    process_count: usize,
    timeout: Option<Duration>,
}

/// A group of simulated processes living in one address space
///
/// Each member shares the same barrier table, so `sync` on one member blocks
/// until every member has called `sync` with the same name.
pub struct LocalProcessGroup {
    table: Arc<BarrierTable>,
    primary_process: ProcessIndex,
}

impl LocalProcessGroup {
    /// Create a group of `process_count` processes with process 0 as primary
    pub fn new(process_count: usize) -> Result<Self> {
        Self::with_options(process_count, 0, None)
    }

    /// Create a group with a custom primary and optional barrier timeout
    ///
    /// Fails if the group is empty or `primary_process` is not a member, since
    /// such a group would commit without anyone writing.
    pub fn with_options(
        process_count: usize,
        primary_process: ProcessIndex,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        ProcessConfig {
            process_index: 0,
            process_count,
            primary_process,
        }
        .validate()?;

        Ok(Self {
            table: Arc::new(BarrierTable {
                barriers: DashMap::new(),
                process_count,
                timeout,
            }),
            primary_process,
        })
    }

    /// Number of members
    pub fn process_count(&self) -> usize {
        self.table.process_count
    }

    /// Handle for the member with the given index
    pub fn process(&self, process_index: ProcessIndex) -> Result<LocalProcess> {
        let config = ProcessConfig {
            process_index,
            process_count: self.table.process_count,
            primary_process: self.primary_process,
        };
        config.validate()?;
        Ok(LocalProcess {
            config,
            table: Arc::clone(&self.table),
        })
    }

    /// Handles for every member, ordered by index
    pub fn processes(&self) -> Vec<LocalProcess> {
        (0..self.table.process_count)
            .filter_map(|index| self.process(index).ok())
            .collect()
    }
}

/// One member of a [`LocalProcessGroup`]
#[derive(Clone)]
pub struct LocalProcess {
    config: ProcessConfig,
    table: Arc<BarrierTable>,
}

impl fmt::Debug for LocalProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalProcess")
            .field("process_index", &self.config.process_index)
            .field("process_count", &self.config.process_count)
            .finish()
    }
}

impl RankProvider for LocalProcess {
    fn process_index(&self) -> ProcessIndex {
        self.config.process_index
    }

    fn process_count(&self) -> usize {
        self.config.process_count
    }

    fn primary_process(&self) -> ProcessIndex {
        self.config.primary_process
    }
}

#[async_trait]
impl CommitBarrier for LocalProcess {
    async fn sync(&self, name: &str) -> Result<()> {
        let waiting = loop {
            let barrier = self
                .table
                .barriers
                .entry(name.to_string())
                .or_insert_with(|| {
                    debug!(barrier_id = %name, expected = self.table.process_count, "Creating new barrier");
                    Arc::new(Mutex::new(LocalBarrier {
                        state: BarrierState::new(name.to_string(), self.table.process_count),
                        waiters: Vec::new(),
                    }))
                })
                .clone();

            let mut guard = barrier.lock();
            if guard.state.released {
                // Released between lookup and lock; the next lookup creates a fresh one
                drop(guard);
                self.table
                    .barriers
                    .remove_if(name, |_, current| Arc::ptr_eq(current, &barrier));
                continue;
            }

            if guard.state.arrive(self.config.process_index) {
                let waiters: Vec<_> = guard.waiters.drain(..).collect();
                drop(guard);
                self.table
                    .barriers
                    .remove_if(name, |_, current| Arc::ptr_eq(current, &barrier));
                for waiter in waiters {
                    let _ = waiter.send(());
                }
                info!(
                    barrier_id = %name,
                    participants = self.table.process_count,
                    "Barrier released"
                );
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            guard.waiters.push(tx);
            debug!(
                barrier_id = %name,
                process_index = self.config.process_index,
                arrival_order = ?guard.state.arrival_order(self.config.process_index),
                "Process waiting at barrier"
            );
            drop(guard);
            break (barrier, rx);
        };
        let (barrier, mut rx) = waiting;
        let _arrival = Arrival {
            table: &self.table,
            barrier: &barrier,
            name,
            process_index: self.config.process_index,
        };

        let received = match self.table.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut rx).await {
                Ok(received) => received,
                // Released while the timer fired; peers have moved on
                Err(_) if barrier.lock().state.released => return Ok(()),
                Err(_) => {
                    warn!(barrier_id = %name, process_index = self.config.process_index, "Barrier timed out");
                    return Err(Error::BarrierTimeout {
                        barrier_id: name.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };

        received.map_err(|_| Error::ChannelClosed {
            channel: format!("barrier {}", name),
        })
    }
}

/// A recorded arrival, withdrawn if the waiter leaves before release
///
/// Covers both the group's own timeout and callers that drop `sync` early.
struct Arrival<'a> {
    table: &'a BarrierTable,
    barrier: &'a Arc<Mutex<LocalBarrier>>,
    name: &'a str,
    process_index: ProcessIndex,
}

impl Drop for Arrival<'_> {
    fn drop(&mut self) {
        let mut guard = self.barrier.lock();
        if guard.state.released {
            return;
        }
        guard.state.depart(self.process_index);
        let abandoned = guard.state.arrived.is_empty();
        drop(guard);
        if abandoned {
            self.table
                .barriers
                .remove_if(self.name, |_, current| Arc::ptr_eq(current, self.barrier));
        }
        debug!(barrier_id = %self.name, process_index = self.process_index, "Arrival withdrawn");
    }
}

/// Process identity and barrier bundled for injection into checkpointers
#[derive(Clone)]
pub struct ProcessContext {
    /// Rank of this process
    pub rank: Arc<dyn RankProvider>,

    /// Barrier shared with the rest of the group
    pub barrier: Arc<dyn CommitBarrier>,
}

impl ProcessContext {
    /// Context for a standalone process
    pub fn single() -> Self {
        Self {
            rank: Arc::new(SingleProcess),
            barrier: Arc::new(SingleProcess),
        }
    }

    /// Context for one member of a local group
    pub fn local(process: LocalProcess) -> Self {
        let process = Arc::new(process);
        Self {
            rank: process.clone(),
            barrier: process,
        }
    }

    /// Convenience accessor for the rank gate
    pub fn is_primary(&self) -> bool {
        self.rank.is_primary()
    }
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::single()
    }
}

impl fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessContext")
            .field("process_index", &self.rank.process_index())
            .field("process_count", &self.rank.process_count())
            .field("is_primary", &self.rank.is_primary())
            .finish()
    }
}
