//! Core type definitions for the checkpoint layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier types
pub type BarrierId = String;
pub type ProcessIndex = usize;

/// Name of the commit marker written into every complete checkpoint
pub const COMMIT_MARKER_FILE: &str = "_CHECKPOINT_METADATA";

/// Contents of the commit marker file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitMarker {
    /// Handler that wrote the checkpoint
    pub handler: String,

    /// Time the checkpoint was finalized
    pub committed_at: DateTime<Utc>,

    /// Nanosecond timestamp of the commit
    pub commit_timestamp_nsecs: i64,

    /// Number of processes that took part in the save
    pub process_count: usize,
}

impl CommitMarker {
    /// Create a marker stamped with the current time
    pub fn new(handler: impl Into<String>, process_count: usize) -> Self {
        let now = Utc::now();
        Self {
            handler: handler.into(),
            committed_at: now,
            commit_timestamp_nsecs: now.timestamp_nanos_opt().unwrap_or_default(),
            process_count,
        }
    }
}

/// Arrival bookkeeping for one named barrier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierState {
    /// Barrier identifier
    pub id: BarrierId,

    /// Expected number of participants
    pub expected_participants: usize,

    /// Processes that have arrived
    pub arrived: Vec<ProcessIndex>,

    /// Whether barrier has been released
    pub released: bool,

    /// Timestamp when barrier was created
    pub created_at: DateTime<Utc>,

    /// Timestamp when barrier was released
    pub released_at: Option<DateTime<Utc>>,
}

impl BarrierState {
    /// Create a new barrier
    pub fn new(id: BarrierId, expected_participants: usize) -> Self {
        Self {
            id,
            expected_participants,
            arrived: Vec::new(),
            released: false,
            created_at: Utc::now(),
            released_at: None,
        }
    }

    /// Record a process arrival, returns true if barrier should be released
    pub fn arrive(&mut self, process: ProcessIndex) -> bool {
        if !self.arrived.contains(&process) {
            self.arrived.push(process);
        }

        if self.arrived.len() >= self.expected_participants && !self.released {
            self.released = true;
            self.released_at = Some(Utc::now());
            return true;
        }

        false
    }

    /// Withdraw a process that gave up waiting; released barriers are unaffected
    pub fn depart(&mut self, process: ProcessIndex) {
        if !self.released {
            self.arrived.retain(|p| *p != process);
        }
    }

    /// Get arrival order for a process (1-indexed)
    pub fn arrival_order(&self, process: ProcessIndex) -> Option<usize> {
        self.arrived
            .iter()
            .position(|p| *p == process)
            .map(|pos| pos + 1)
    }
}

/// Install a `tracing` subscriber filtered by `RUST_LOG`, falling back to `default_filter`
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
