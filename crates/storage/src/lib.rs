//! Storage - Directory abstraction for the checkpoint layer
//!
//! Provides async storage operations and a path-like [`CheckpointPath`]
//! handle that checkpoint handlers read and write through:
//! - Local filesystem backend with atomic file writes
//! - Directory rename and recursive removal used by the commit protocol
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use storage::{CheckpointPath, LocalStorage};
//!
//! # async fn example() -> checkpoint_core::Result<()> {
//! let root = CheckpointPath::root(Arc::new(LocalStorage::new("/tmp/checkpoints")));
//! let ckpt = root.join("step_100");
//! (&ckpt / "metadata").write_text("{}").await?;
//! let text = ckpt.join("metadata").read_text().await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;
mod path;

pub use backend::StorageBackend;
pub use local::LocalStorage;
pub use path::CheckpointPath;
