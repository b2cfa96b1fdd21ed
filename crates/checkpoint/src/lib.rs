//! Checkpoint persistence for multi-process training
//!
//! A [`Checkpointer`] binds one [`CheckpointHandler`] to a commit protocol:
//! every process calls `save` with the same arguments, only the primary
//! process writes, and the directory becomes visible only after all processes
//! have passed the commit barrier. [`AsyncCheckpointer`] runs the handler's
//! writes and the commit in the background.
//!
//! ```no_run
//! use std::sync::Arc;
//! use checkpoint::{Checkpointer, JsonSaveArgs};
//! use checkpoint_core::ProcessContext;
//! use storage::{CheckpointPath, LocalStorage};
//!
//! # async fn example() -> checkpoint_core::Result<()> {
//! let root = CheckpointPath::root(Arc::new(LocalStorage::new("/tmp/run")));
//! let checkpointer = Checkpointer::json(ProcessContext::single())?;
//! checkpointer
//!     .save(&root.join("step_100"), JsonSaveArgs::new(serde_json::json!({"step": 100})), false)
//!     .await?;
//! let restored = checkpointer.restore(&root.join("step_100"), None).await?.into_json()?;
//! # Ok(())
//! # }
//! ```

pub mod args;
pub mod async_checkpointer;
pub mod checkpointer;
pub mod commit;
pub mod future;
pub mod handler;
pub mod handlers;
pub mod tree;
pub mod worker;

pub use args::{ArgsKind, ArgsRegistry, HandlerKind, RestoreArgs, Restored, SaveArgs};
pub use async_checkpointer::AsyncCheckpointer;
pub use checkpointer::Checkpointer;
pub use commit::{CommitProtocol, DirectoryState};
pub use future::{wait_for_commits, CommitFuture};
pub use handler::{AsyncCheckpointHandler, CheckpointHandler};
pub use handlers::{
    JsonCheckpointHandler, JsonRestoreArgs, JsonSaveArgs, ProtoCheckpointHandler,
    ProtoRestoreArgs, ProtoSaveArgs, TensorTreeCheckpointHandler, TensorTreeRestoreArgs,
    TensorTreeSaveArgs,
};
pub use tree::{DType, Tensor, TensorTree};
pub use worker::{CommitTask, CommitWorker};
