//! Built-in handlers

pub mod json;
pub mod proto;
pub mod tensor_tree;

pub use json::{JsonCheckpointHandler, JsonRestoreArgs, JsonSaveArgs};
pub use proto::{ProtoCheckpointHandler, ProtoRestoreArgs, ProtoSaveArgs};
pub use tensor_tree::{TensorTreeCheckpointHandler, TensorTreeRestoreArgs, TensorTreeSaveArgs};
