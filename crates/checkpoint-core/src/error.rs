//! Error types for the distributed checkpoint layer

use thiserror::Error;

/// Result type alias using the checkpoint Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller supplied something invalid
    Usage,
    /// A checkpoint, path, or registration does not exist
    NotFound,
    /// A complete checkpoint already occupies the target directory
    OverwriteConflict,
    /// Storage or serialization failure
    Io,
    /// The handler does not implement the requested capability
    Unsupported,
    /// Cross-process synchronization or background worker failure
    Coordination,
}

/// Core error type for the checkpoint layer
#[derive(Error, Debug)]
pub enum Error {
    // Usage errors
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Missing restore hint for {handler} handler: {message}")]
    MissingRestoreHint { handler: String, message: String },

    #[error("Checkpoint args {args} already registered with handler {handler}")]
    ArgsAlreadyRegistered { args: String, handler: String },

    #[error("Checkpoint args {args} are handled by {expected}, not {actual}")]
    HandlerMismatch {
        args: String,
        expected: String,
        actual: String,
    },

    #[error("A background write is already in flight for {handler} handler")]
    WriteInProgress { handler: String },

    #[error("Handler {handler} has been closed")]
    HandlerClosed { handler: String },

    // Not-found errors
    #[error("Checkpoint not found: {path}")]
    CheckpointNotFound { path: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    #[error("No handler registered for checkpoint args {args}")]
    ArgsNotRegistered { args: String },

    // Overwrite errors
    #[error("Checkpoint already exists at {path}; pass force to overwrite")]
    CheckpointExists { path: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Checkpoint corrupted: {path} - {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    #[error("Checkpoint commit failed: {message}")]
    CommitFailed { message: String },

    // Capability errors
    #[error("{handler} handler does not support {operation}")]
    Unsupported { handler: String, operation: String },

    // Coordination errors
    #[error("Barrier timeout: {barrier_id} (waited {timeout_ms}ms)")]
    BarrierTimeout { barrier_id: String, timeout_ms: u64 },

    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Classify this error into the taxonomy callers match on
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument { .. }
            | Error::MissingRestoreHint { .. }
            | Error::ArgsAlreadyRegistered { .. }
            | Error::HandlerMismatch { .. }
            | Error::WriteInProgress { .. }
            | Error::HandlerClosed { .. }
            | Error::InvalidConfig { .. } => ErrorKind::Usage,
            Error::CheckpointNotFound { .. }
            | Error::StoragePathNotFound { .. }
            | Error::ArgsNotRegistered { .. } => ErrorKind::NotFound,
            Error::CheckpointExists { .. } => ErrorKind::OverwriteConflict,
            Error::Storage { .. }
            | Error::CheckpointCorrupted { .. }
            | Error::CommitFailed { .. }
            | Error::Io(_)
            | Error::Serialization(_) => ErrorKind::Io,
            Error::Unsupported { .. } => ErrorKind::Unsupported,
            Error::BarrierTimeout { .. }
            | Error::ChannelClosed { .. }
            | Error::Internal { .. } => ErrorKind::Coordination,
        }
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage { .. } | Error::BarrierTimeout { .. } | Error::Io(_)
        )
    }

    /// Returns true if this error was caused by the caller
    pub fn is_usage(&self) -> bool {
        self.kind() == ErrorKind::Usage
    }

    /// Returns true if this error reports a missing checkpoint or registration
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
