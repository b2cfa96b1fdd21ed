//! Storage backend trait definition
//!
//! Defines the async interface that every checkpoint directory is backed by.

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint_core::Result;

/// Async trait for storage backends
///
/// Paths are `/`-separated and relative to the backend root. Directories are
/// implicit for object-store style backends; `rename` and `remove_all`
/// operate on a path and everything beneath it.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read data from the given path
    ///
    /// # Errors
    /// Returns `StoragePathNotFound` if the path doesn't exist
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write data to the given path
    ///
    /// Creates parent directories if they don't exist.
    /// Uses atomic writes where possible (write to temp, then rename).
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Check if a file or directory exists at the path
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all file paths under a given prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Create a directory and any missing parents
    async fn create_dir_all(&self, path: &str) -> Result<()>;

    /// Move a file or directory tree from `from` to `to`
    ///
    /// `to` must not exist.
    ///
    /// # Errors
    /// Returns `StoragePathNotFound` if `from` doesn't exist
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Remove a file or directory tree; missing paths are not an error
    async fn remove_all(&self, path: &str) -> Result<()>;
}
