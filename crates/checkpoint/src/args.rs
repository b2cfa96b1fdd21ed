//! Typed save/restore arguments and the registry binding them to handlers
//!
//! Every argument bundle has an [`ArgsKind`]. An [`ArgsRegistry`] maps each
//! kind to the [`HandlerKind`] that consumes it, so a checkpointer can decide
//! from the arguments alone whether its handler is the right one.

use std::collections::HashMap;
use std::fmt;

use checkpoint_core::{Error, Result};
use prost_reflect::DynamicMessage;

use crate::handlers::json::{JsonRestoreArgs, JsonSaveArgs};
use crate::handlers::proto::{ProtoRestoreArgs, ProtoSaveArgs};
use crate::handlers::tensor_tree::{TensorTreeRestoreArgs, TensorTreeSaveArgs};
use crate::tree::TensorTree;

/// Payload families with a dedicated handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Json,
    Proto,
    TensorTree,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Json => "json",
            HandlerKind::Proto => "proto",
            HandlerKind::TensorTree => "tensor_tree",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete argument bundle types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgsKind {
    JsonSave,
    JsonRestore,
    ProtoSave,
    ProtoRestore,
    TensorTreeSave,
    TensorTreeRestore,
}

impl fmt::Display for ArgsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Mapping from argument kind to the handler kind that consumes it
///
/// Built once at startup and handed to checkpointers. A kind can be bound
/// only once.
#[derive(Debug, Clone, Default)]
pub struct ArgsRegistry {
    bindings: HashMap<ArgsKind, HandlerKind>,
}

impl ArgsRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in argument kind bound to its handler
    pub fn standard() -> Self {
        let mut registry = Self::new();
        let bindings = [
            (ArgsKind::JsonSave, HandlerKind::Json),
            (ArgsKind::JsonRestore, HandlerKind::Json),
            (ArgsKind::ProtoSave, HandlerKind::Proto),
            (ArgsKind::ProtoRestore, HandlerKind::Proto),
            (ArgsKind::TensorTreeSave, HandlerKind::TensorTree),
            (ArgsKind::TensorTreeRestore, HandlerKind::TensorTree),
        ];
        for (args, handler) in bindings {
            registry.bindings.insert(args, handler);
        }
        registry
    }

    /// Bind `args` to `handler`
    ///
    /// # Errors
    /// `ArgsAlreadyRegistered` if `args` is already bound
    pub fn register_with_handler(&mut self, args: ArgsKind, handler: HandlerKind) -> Result<()> {
        if let Some(existing) = self.bindings.get(&args) {
            return Err(Error::ArgsAlreadyRegistered {
                args: args.to_string(),
                handler: existing.to_string(),
            });
        }
        self.bindings.insert(args, handler);
        Ok(())
    }

    /// Handler kind bound to `args`
    ///
    /// # Errors
    /// `ArgsNotRegistered` if nothing is bound
    pub fn handler_for(&self, args: ArgsKind) -> Result<HandlerKind> {
        self.bindings
            .get(&args)
            .copied()
            .ok_or_else(|| Error::ArgsNotRegistered {
                args: args.to_string(),
            })
    }

    /// Confirm that `args` belongs to a handler of kind `handler`
    pub fn check(&self, args: ArgsKind, handler: HandlerKind) -> Result<()> {
        let expected = self.handler_for(args)?;
        if expected != handler {
            return Err(Error::HandlerMismatch {
                args: args.to_string(),
                expected: expected.to_string(),
                actual: handler.to_string(),
            });
        }
        Ok(())
    }
}

/// Error for argument bundles handed to a handler that cannot consume them
pub(crate) fn foreign_args(args: ArgsKind, handler: HandlerKind) -> Error {
    Error::InvalidArgument {
        message: format!("{} handler cannot consume {} arguments", handler, args),
    }
}

/// Arguments for a save
#[derive(Debug, Clone)]
pub enum SaveArgs {
    Json(JsonSaveArgs),
    Proto(ProtoSaveArgs),
    TensorTree(TensorTreeSaveArgs),
}

impl SaveArgs {
    pub fn kind(&self) -> ArgsKind {
        match self {
            SaveArgs::Json(_) => ArgsKind::JsonSave,
            SaveArgs::Proto(_) => ArgsKind::ProtoSave,
            SaveArgs::TensorTree(_) => ArgsKind::TensorTreeSave,
        }
    }
}

impl From<JsonSaveArgs> for SaveArgs {
    fn from(args: JsonSaveArgs) -> Self {
        SaveArgs::Json(args)
    }
}

impl From<ProtoSaveArgs> for SaveArgs {
    fn from(args: ProtoSaveArgs) -> Self {
        SaveArgs::Proto(args)
    }
}

impl From<TensorTreeSaveArgs> for SaveArgs {
    fn from(args: TensorTreeSaveArgs) -> Self {
        SaveArgs::TensorTree(args)
    }
}

/// Arguments for a restore
#[derive(Debug, Clone)]
pub enum RestoreArgs {
    Json(JsonRestoreArgs),
    Proto(ProtoRestoreArgs),
    TensorTree(TensorTreeRestoreArgs),
}

impl RestoreArgs {
    pub fn kind(&self) -> ArgsKind {
        match self {
            RestoreArgs::Json(_) => ArgsKind::JsonRestore,
            RestoreArgs::Proto(_) => ArgsKind::ProtoRestore,
            RestoreArgs::TensorTree(_) => ArgsKind::TensorTreeRestore,
        }
    }
}

impl From<JsonRestoreArgs> for RestoreArgs {
    fn from(args: JsonRestoreArgs) -> Self {
        RestoreArgs::Json(args)
    }
}

impl From<ProtoRestoreArgs> for RestoreArgs {
    fn from(args: ProtoRestoreArgs) -> Self {
        RestoreArgs::Proto(args)
    }
}

impl From<TensorTreeRestoreArgs> for RestoreArgs {
    fn from(args: TensorTreeRestoreArgs) -> Self {
        RestoreArgs::TensorTree(args)
    }
}

/// A value reconstructed by a handler
#[derive(Debug, Clone)]
pub enum Restored {
    Json(serde_json::Value),
    Proto(DynamicMessage),
    TensorTree(TensorTree),
}

impl Restored {
    fn mismatch(&self, wanted: HandlerKind) -> Error {
        let actual = match self {
            Restored::Json(_) => HandlerKind::Json,
            Restored::Proto(_) => HandlerKind::Proto,
            Restored::TensorTree(_) => HandlerKind::TensorTree,
        };
        Error::InvalidArgument {
            message: format!("restored a {} value, not {}", actual, wanted),
        }
    }

    pub fn into_json(self) -> Result<serde_json::Value> {
        match self {
            Restored::Json(value) => Ok(value),
            other => Err(other.mismatch(HandlerKind::Json)),
        }
    }

    pub fn into_proto(self) -> Result<DynamicMessage> {
        match self {
            Restored::Proto(message) => Ok(message),
            other => Err(other.mismatch(HandlerKind::Proto)),
        }
    }

    /// Convert a restored proto into a generated message type
    pub fn into_message<M: prost::Message + Default>(self) -> Result<M> {
        self.into_proto()?
            .transcode_to::<M>()
            .map_err(|e| Error::Serialization(format!("cannot convert restored proto: {}", e)))
    }

    pub fn into_tensor_tree(self) -> Result<TensorTree> {
        match self {
            Restored::TensorTree(tree) => Ok(tree),
            other => Err(other.mismatch(HandlerKind::TensorTree)),
        }
    }
}
