//! Handler capability contracts
//!
//! A handler knows how to turn one payload family into files under a
//! directory and back. Handlers never decide *whether* a checkpoint may be
//! written; that is the checkpointer's job. They only gate their physical
//! writes on the injected rank so that every process can run the same path.

use async_trait::async_trait;
use checkpoint_core::Result;
use storage::CheckpointPath;

use crate::args::{HandlerKind, RestoreArgs, Restored, SaveArgs};
use crate::future::CommitFuture;

/// Serialize and deserialize one payload family
#[async_trait]
pub trait CheckpointHandler: Send + Sync {
    /// Payload family this handler accepts
    fn kind(&self) -> HandlerKind;

    /// Write `args` under `directory`
    ///
    /// Called on every process; only the primary process performs writes.
    ///
    /// # Errors
    /// `InvalidArgument` if the item is malformed for this handler,
    /// `HandlerMismatch` if `args` belong to another handler
    async fn save(&self, directory: &CheckpointPath, args: &SaveArgs) -> Result<()>;

    /// Read a value back from `directory`
    ///
    /// # Errors
    /// `MissingRestoreHint` if the handler needs a type hint and none was given
    async fn restore(
        &self,
        directory: &CheckpointPath,
        args: Option<&RestoreArgs>,
    ) -> Result<Restored>;

    /// Describe what is stored without loading it
    ///
    /// # Errors
    /// `Unsupported` if the handler cannot summarize its payload
    async fn structure(&self, directory: &CheckpointPath) -> Result<serde_json::Value>;

    /// Release any background resources. Idempotent.
    async fn close(&self) {}
}

/// Handler that can defer its writes to a background worker
#[async_trait]
pub trait AsyncCheckpointHandler: CheckpointHandler {
    /// Dispatch the write of `args` and return without waiting for it
    ///
    /// Every process receives the same number of futures; the rank gate is
    /// applied inside the deferred work.
    ///
    /// # Errors
    /// `WriteInProgress` if the previous dispatch has not resolved,
    /// `HandlerClosed` after `close`
    async fn async_save(
        &self,
        directory: &CheckpointPath,
        args: &SaveArgs,
    ) -> Result<Vec<CommitFuture>>;
}
