//! Checkpointer that commits in the background

use std::sync::Arc;

use checkpoint_core::{CheckpointerConfig, Error, ProcessContext, Result};
use storage::CheckpointPath;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::args::{ArgsRegistry, RestoreArgs, Restored, SaveArgs};
use crate::checkpointer::{restore_complete, structure_complete};
use crate::commit::{CommitProtocol, DirectoryState};
use crate::future::wait_for_commits;
use crate::handler::AsyncCheckpointHandler;
use crate::handlers::{ProtoCheckpointHandler, TensorTreeCheckpointHandler};

/// Commit still running for a previous save
struct PendingCommit {
    directory: String,
    handle: JoinHandle<Result<()>>,
}

impl PendingCommit {
    async fn join(self) -> Result<()> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal {
                message: format!("commit task for {} failed: {}", self.directory, e),
            }),
        }
    }
}

/// Checkpointer whose `save` returns once the write has been dispatched
///
/// The handler's writes, the final barrier and the rename run in a spawned
/// task. Call [`wait_until_finished`](Self::wait_until_finished) before
/// relying on the checkpoint and [`close`](Self::close) before shutdown.
pub struct AsyncCheckpointer {
    handler: Arc<dyn AsyncCheckpointHandler>,
    registry: Arc<ArgsRegistry>,
    protocol: CommitProtocol,
    pending: Mutex<Option<PendingCommit>>,
}

impl AsyncCheckpointer {
    pub fn new(handler: Arc<dyn AsyncCheckpointHandler>, ctx: ProcessContext) -> Result<Self> {
        Self::with_config(handler, ctx, CheckpointerConfig::default(), ArgsRegistry::standard())
    }

    pub fn with_config(
        handler: Arc<dyn AsyncCheckpointHandler>,
        ctx: ProcessContext,
        config: CheckpointerConfig,
        registry: ArgsRegistry,
    ) -> Result<Self> {
        let protocol = CommitProtocol::new(ctx, config, handler.kind().as_str())?;
        Ok(Self {
            handler,
            registry: Arc::new(registry),
            protocol,
            pending: Mutex::new(None),
        })
    }

    pub fn proto(filename: impl Into<String>, ctx: ProcessContext) -> Result<Self> {
        let handler = ProtoCheckpointHandler::new(filename, Arc::clone(&ctx.rank));
        Self::new(Arc::new(handler), ctx)
    }

    pub fn tensor_tree(ctx: ProcessContext) -> Result<Self> {
        let handler = TensorTreeCheckpointHandler::new(Arc::clone(&ctx.rank));
        Self::new(Arc::new(handler), ctx)
    }

    pub fn context(&self) -> &ProcessContext {
        self.protocol.context()
    }

    pub async fn state(&self, directory: &CheckpointPath) -> Result<DirectoryState> {
        self.protocol.state(directory).await
    }

    /// Dispatch a save to `directory`
    ///
    /// Waits for any previous save to commit first and returns its failure if
    /// it had one. The overwrite check happens before returning.
    #[instrument(skip(self, args), fields(handler = %self.handler.kind(), directory = %directory))]
    pub async fn save(
        &self,
        directory: &CheckpointPath,
        args: impl Into<SaveArgs>,
        force: bool,
    ) -> Result<()> {
        let args = args.into();
        self.registry.check(args.kind(), self.handler.kind())?;

        let mut pending = self.pending.lock().await;
        if let Some(previous) = pending.take() {
            debug!(previous = %previous.directory, "Waiting for previous commit");
            previous.join().await?;
        }

        let tmp = self.protocol.prepare(directory, force).await?;
        let futures = self.handler.async_save(&tmp, &args).await?;

        let protocol = self.protocol.clone();
        let target = directory.clone();
        let handle = tokio::spawn(async move {
            let start = std::time::Instant::now();
            wait_for_commits(futures).await?;
            protocol.finalize(&target, &tmp).await?;
            info!(
                directory = %target,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Background checkpoint committed"
            );
            Ok(())
        });

        *pending = Some(PendingCommit {
            directory: directory.to_string(),
            handle,
        });
        debug!("Checkpoint save dispatched");
        Ok(())
    }

    /// Block until the most recent save has committed
    ///
    /// A no-op when nothing is outstanding. Returns the commit's failure.
    pub async fn wait_until_finished(&self) -> Result<()> {
        let previous = self.pending.lock().await.take();
        match previous {
            Some(previous) => previous.join().await,
            None => Ok(()),
        }
    }

    /// Return the failure of a commit that has already finished, without blocking
    pub async fn check_for_errors(&self) -> Result<()> {
        let mut pending = self.pending.lock().await;
        match pending.as_ref() {
            Some(commit) if commit.handle.is_finished() => match pending.take() {
                Some(commit) => commit.join().await,
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// True while a dispatched save has not finished committing
    pub async fn is_saving(&self) -> bool {
        self.pending
            .lock()
            .await
            .as_ref()
            .is_some_and(|commit| !commit.handle.is_finished())
    }

    /// Restore from a complete `directory`
    ///
    /// Does not wait for an outstanding save.
    #[instrument(skip(self, args), fields(handler = %self.handler.kind(), directory = %directory))]
    pub async fn restore(
        &self,
        directory: &CheckpointPath,
        args: Option<RestoreArgs>,
    ) -> Result<Restored> {
        restore_complete(
            &self.protocol,
            &self.registry,
            self.handler.as_ref(),
            directory,
            args.as_ref(),
        )
        .await
    }

    pub async fn structure(&self, directory: &CheckpointPath) -> Result<serde_json::Value> {
        structure_complete(&self.protocol, self.handler.as_ref(), directory).await
    }

    /// Wait for the outstanding save, then release the handler
    ///
    /// The handler is closed even if the save failed; the failure is returned.
    pub async fn close(&self) -> Result<()> {
        let result = self.wait_until_finished().await;
        if let Err(e) = &result {
            error!(error = %e, "Outstanding checkpoint failed during close");
        }
        self.handler.close().await;
        result
    }
}

impl Drop for AsyncCheckpointer {
    fn drop(&mut self) {
        if let Some(commit) = self.pending.get_mut() {
            if !commit.handle.is_finished() {
                warn!(
                    directory = %commit.directory,
                    "AsyncCheckpointer dropped with a commit in flight"
                );
            }
        }
    }
}
