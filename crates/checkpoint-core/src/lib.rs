//! Checkpoint Core - Foundation for the distributed checkpoint layer
//!
//! Provides the shared error taxonomy, configuration types, and the process
//! identity and barrier primitives that checkpointers and handlers are built on.

pub mod config;
pub mod error;
pub mod process;
pub mod types;

pub use config::{CheckpointerConfig, JsonHandlerConfig, ProcessConfig};
pub use error::{Error, ErrorKind, Result};
pub use process::{
    CommitBarrier, LocalProcess, LocalProcessGroup, ProcessContext, RankProvider, SingleProcess,
};
pub use types::*;
