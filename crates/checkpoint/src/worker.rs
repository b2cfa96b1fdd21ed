//! Single-slot background executor owned by an async handler

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use checkpoint_core::{Error, Result};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::future::CommitFuture;

/// Deferred write submitted to a [`CommitWorker`]
pub type CommitTask = BoxFuture<'static, Result<()>>;

/// Request to run one deferred write
struct CommitJob {
    label: String,
    task: CommitTask,
    done: oneshot::Sender<Result<()>>,
}

enum WorkerState {
    /// No task spawned yet
    Idle,
    Running {
        tx: mpsc::Sender<CommitJob>,
        handle: JoinHandle<()>,
    },
    Closed,
}

/// Background execution context with room for exactly one in-flight write
///
/// The worker task is spawned on first use, so a handler can be built outside
/// a Tokio runtime. [`close`](Self::close) must be awaited before shutdown.
pub struct CommitWorker {
    /// Owner name used in logs and errors
    name: String,
    state: Mutex<WorkerState>,
    in_flight: Arc<AtomicBool>,
}

impl CommitWorker {
    /// Create an idle worker
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(WorkerState::Idle),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True while a submitted write has not finished
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// True once [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), WorkerState::Closed)
    }

    /// Queue `task` and return a future for its completion
    ///
    /// Fails with `WriteInProgress` if the previous write is still running,
    /// and with `HandlerClosed` after `close`.
    pub fn submit(&self, label: impl Into<String>, task: CommitTask) -> Result<CommitFuture> {
        let label = label.into();

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::WriteInProgress {
                handler: self.name.clone(),
            });
        }

        let mut state = self.state.lock();
        if matches!(*state, WorkerState::Idle) {
            let (tx, rx) = mpsc::channel::<CommitJob>(1);
            let handle = tokio::spawn(Self::worker_loop(
                self.name.clone(),
                rx,
                Arc::clone(&self.in_flight),
            ));
            *state = WorkerState::Running { tx, handle };
        }

        let tx = match &*state {
            WorkerState::Running { tx, .. } => tx,
            _ => {
                self.in_flight.store(false, Ordering::SeqCst);
                return Err(Error::HandlerClosed {
                    handler: self.name.clone(),
                });
            }
        };

        let (done, rx) = oneshot::channel();
        let job = CommitJob {
            label: label.clone(),
            task,
            done,
        };
        if let Err(e) = tx.try_send(job) {
            self.in_flight.store(false, Ordering::SeqCst);
            return Err(Error::ChannelClosed {
                channel: format!("{} commit worker: {}", self.name, e),
            });
        }

        debug!(worker = %self.name, label = %label, "Queued background commit");
        Ok(CommitFuture::pending(label, rx))
    }

    /// Main worker loop
    async fn worker_loop(
        name: String,
        mut rx: mpsc::Receiver<CommitJob>,
        in_flight: Arc<AtomicBool>,
    ) {
        info!(worker = %name, "Commit worker started");

        while let Some(job) = rx.recv().await {
            let start = std::time::Instant::now();
            let result = job.task.await;

            match &result {
                Ok(()) => debug!(
                    worker = %name,
                    label = %job.label,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Background commit finished"
                ),
                Err(e) => error!(
                    worker = %name,
                    label = %job.label,
                    error = %e,
                    "Background commit failed"
                ),
            }

            in_flight.store(false, Ordering::SeqCst);
            let _ = job.done.send(result);
        }

        info!(worker = %name, "Commit worker stopped");
    }

    /// Stop accepting work and wait for the worker task to drain
    ///
    /// Idempotent.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), WorkerState::Closed);
        if let WorkerState::Running { tx, handle } = previous {
            drop(tx);
            if let Err(e) = handle.await {
                warn!(worker = %self.name, error = %e, "Commit worker task ended abnormally");
            }
        }
    }
}

impl Drop for CommitWorker {
    fn drop(&mut self) {
        if matches!(*self.state.get_mut(), WorkerState::Running { .. }) {
            warn!(worker = %self.name, "Commit worker dropped without close()");
        }
    }
}
