//! Handles to background commits

use checkpoint_core::{Error, Result};
use tokio::sync::oneshot;

enum FutureState {
    Pending(oneshot::Receiver<Result<()>>),
    Done(Result<()>),
}

/// A pending background write
///
/// Resolves once the write is durable or has failed. A failure is held until
/// [`result`](Self::result) is called and is then handed to that caller.
pub struct CommitFuture {
    label: String,
    state: FutureState,
}

impl CommitFuture {
    pub(crate) fn pending(label: impl Into<String>, rx: oneshot::Receiver<Result<()>>) -> Self {
        Self {
            label: label.into(),
            state: FutureState::Pending(rx),
        }
    }

    /// A future that has already completed successfully
    pub fn ready(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: FutureState::Done(Ok(())),
        }
    }

    /// A future that has already failed with `error`
    pub fn failed(label: impl Into<String>, error: Error) -> Self {
        Self {
            label: label.into(),
            state: FutureState::Done(Err(error)),
        }
    }

    /// Description of the write this future tracks
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Block until the write finishes, without consuming its result
    pub async fn wait(&mut self) {
        if let FutureState::Pending(rx) = &mut self.state {
            let result = rx.await.unwrap_or_else(|_| {
                Err(Error::ChannelClosed {
                    channel: format!("commit future {}", self.label),
                })
            });
            self.state = FutureState::Done(result);
        }
    }

    /// Check for completion without blocking
    pub fn is_done(&mut self) -> bool {
        match &mut self.state {
            FutureState::Done(_) => true,
            FutureState::Pending(rx) => match rx.try_recv() {
                Ok(result) => {
                    self.state = FutureState::Done(result);
                    true
                }
                Err(oneshot::error::TryRecvError::Empty) => false,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.state = FutureState::Done(Err(Error::ChannelClosed {
                        channel: format!("commit future {}", self.label),
                    }));
                    true
                }
            },
        }
    }

    /// Wait for the write and return its outcome
    pub async fn result(mut self) -> Result<()> {
        self.wait().await;
        match self.state {
            FutureState::Done(result) => result,
            FutureState::Pending(_) => Err(Error::Internal {
                message: format!("commit future {} still pending after wait", self.label),
            }),
        }
    }
}

impl std::fmt::Debug for CommitFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            FutureState::Pending(_) => "pending",
            FutureState::Done(Ok(())) => "done",
            FutureState::Done(Err(_)) => "failed",
        };
        f.debug_struct("CommitFuture")
            .field("label", &self.label)
            .field("state", &state)
            .finish()
    }
}

/// Await every future in order, returning the first failure
///
/// Later futures are still awaited so that no write is left running unobserved.
pub async fn wait_for_commits(futures: Vec<CommitFuture>) -> Result<()> {
    let mut first_error = None;
    for future in futures {
        if let Err(e) = future.result().await {
            if first_error.is_none() {
                first_error = Some(e);
            } else {
                tracing::error!(error = %e, "Additional commit failure");
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
