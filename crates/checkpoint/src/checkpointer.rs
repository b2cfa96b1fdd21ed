//! Synchronous checkpointer

use std::sync::Arc;

use checkpoint_core::{CheckpointerConfig, Error, ProcessContext, Result};
use storage::CheckpointPath;
use tracing::{info, instrument};

use crate::args::{ArgsRegistry, RestoreArgs, Restored, SaveArgs};
use crate::commit::{CommitProtocol, DirectoryState};
use crate::handler::CheckpointHandler;
use crate::handlers::{JsonCheckpointHandler, ProtoCheckpointHandler, TensorTreeCheckpointHandler};

/// Binds one handler to the commit protocol
///
/// Every process in the group calls [`save`](Self::save) with the same
/// arguments. The call returns once the checkpoint is committed everywhere.
pub struct Checkpointer {
    handler: Arc<dyn CheckpointHandler>,
    registry: Arc<ArgsRegistry>,
    protocol: CommitProtocol,
}

impl Checkpointer {
    /// Checkpointer with default settings and the standard registry
    pub fn new(handler: Arc<dyn CheckpointHandler>, ctx: ProcessContext) -> Result<Self> {
        Self::with_config(handler, ctx, CheckpointerConfig::default(), ArgsRegistry::standard())
    }

    pub fn with_config(
        handler: Arc<dyn CheckpointHandler>,
        ctx: ProcessContext,
        config: CheckpointerConfig,
        registry: ArgsRegistry,
    ) -> Result<Self> {
        let protocol = CommitProtocol::new(ctx, config, handler.kind().as_str())?;
        Ok(Self {
            handler,
            registry: Arc::new(registry),
            protocol,
        })
    }

    /// Checkpointer for JSON mappings written to `metadata`
    pub fn json(ctx: ProcessContext) -> Result<Self> {
        let handler = JsonCheckpointHandler::new(Arc::clone(&ctx.rank));
        Self::new(Arc::new(handler), ctx)
    }

    /// Checkpointer for protocol messages written to `filename`
    pub fn proto(filename: impl Into<String>, ctx: ProcessContext) -> Result<Self> {
        let handler = ProtoCheckpointHandler::new(filename, Arc::clone(&ctx.rank));
        Self::new(Arc::new(handler), ctx)
    }

    /// Checkpointer for tensor trees
    pub fn tensor_tree(ctx: ProcessContext) -> Result<Self> {
        let handler = TensorTreeCheckpointHandler::new(Arc::clone(&ctx.rank));
        Self::new(Arc::new(handler), ctx)
    }

    pub fn handler(&self) -> &Arc<dyn CheckpointHandler> {
        &self.handler
    }

    pub fn context(&self) -> &ProcessContext {
        self.protocol.context()
    }

    /// State of `directory` as seen by this checkpointer
    pub async fn state(&self, directory: &CheckpointPath) -> Result<DirectoryState> {
        self.protocol.state(directory).await
    }

    /// Save `args` to `directory` and commit
    ///
    /// # Errors
    /// `CheckpointExists` if `directory` is complete and `force` is false;
    /// `HandlerMismatch` if `args` belong to another handler
    #[instrument(skip(self, args), fields(handler = %self.handler.kind(), directory = %directory))]
    pub async fn save(
        &self,
        directory: &CheckpointPath,
        args: impl Into<SaveArgs>,
        force: bool,
    ) -> Result<()> {
        let args = args.into();
        self.registry.check(args.kind(), self.handler.kind())?;

        let start = std::time::Instant::now();
        let tmp = self.protocol.prepare(directory, force).await?;
        self.handler.save(&tmp, &args).await?;
        self.protocol.finalize(directory, &tmp).await?;

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Restore from a complete `directory`
    ///
    /// # Errors
    /// `CheckpointNotFound` if `directory` is absent or not committed
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

    /// Describe the contents of a complete `directory`
    pub async fn structure(&self, directory: &CheckpointPath) -> Result<serde_json::Value> {
        structure_complete(&self.protocol, self.handler.as_ref(), directory).await
    }

    /// Release the handler's resources
    pub async fn close(&self) {
        self.handler.close().await;
    }
}

async fn ensure_complete(protocol: &CommitProtocol, directory: &CheckpointPath) -> Result<()> {
    if !protocol.is_complete(directory).await? {
        return Err(Error::CheckpointNotFound {
            path: directory.to_string(),
        });
    }
    Ok(())
}

pub(crate) async fn restore_complete<H>(
    protocol: &CommitProtocol,
    registry: &ArgsRegistry,
    handler: &H,
    directory: &CheckpointPath,
    args: Option<&RestoreArgs>,
) -> Result<Restored>
where
    H: CheckpointHandler + ?Sized,
{
    if let Some(args) = args {
        registry.check(args.kind(), handler.kind())?;
    }
    ensure_complete(protocol, directory).await?;
    handler.restore(directory, args).await
}

pub(crate) async fn structure_complete<H>(
    protocol: &CommitProtocol,
    handler: &H,
    directory: &CheckpointPath,
) -> Result<serde_json::Value>
where
    H: CheckpointHandler + ?Sized,
{
    ensure_complete(protocol, directory).await?;
    handler.structure(directory).await
}
