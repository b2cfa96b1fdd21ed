//! Path-like handle to a location inside a storage backend

use std::fmt;
use std::ops::Div;
use std::sync::Arc;

use bytes::Bytes;
use checkpoint_core::{Error, Result};

use crate::StorageBackend;

/// A location inside a [`StorageBackend`]
///
/// Cheap to clone; every clone shares the backend. Child paths are built
/// with [`join`](Self::join) or the `/` operator.
#[derive(Clone)]
pub struct CheckpointPath {
    backend: Arc<dyn StorageBackend>,
    path: String,
}

impl CheckpointPath {
    /// The root of `backend`
    pub fn root(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            path: String::new(),
        }
    }

    /// A path relative to the root of `backend`
    pub fn new(backend: Arc<dyn StorageBackend>, path: impl Into<String>) -> Self {
        Self {
            backend,
            path: normalize(&path.into()),
        }
    }

    /// Child path `self/name`
    ///
    /// `..` steps back through `self` but never above the backend root.
    pub fn join(&self, name: &str) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            path: normalize(&format!("{}/{}", self.path, name)),
        }
    }

    /// Sibling path formed by appending `suffix` to the final component
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            path: normalize(&format!("{}{}", self.path, suffix)),
        }
    }

    /// Parent directory, `None` at the root
    pub fn parent(&self) -> Option<Self> {
        if self.path.is_empty() {
            return None;
        }
        let parent = match self.path.rfind('/') {
            Some(idx) => self.path[..idx].to_string(),
            None => String::new(),
        };
        Some(Self {
            backend: Arc::clone(&self.backend),
            path: parent,
        })
    }

    /// Final path component
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }

    /// Path relative to the backend root
    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// The backend this path lives in
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Write UTF-8 text, replacing any existing file
    pub async fn write_text(&self, text: &str) -> Result<u64> {
        self.write_bytes(Bytes::copy_from_slice(text.as_bytes())).await
    }

    /// Read the file as UTF-8 text
    pub async fn read_text(&self) -> Result<String> {
        let data = self.read_bytes().await?;
        String::from_utf8(data.to_vec()).map_err(|e| Error::Serialization(format!(
            "{} is not valid UTF-8: {}",
            self.path, e
        )))
    }

    /// Write raw bytes, replacing any existing file
    pub async fn write_bytes(&self, data: Bytes) -> Result<u64> {
        self.backend.write(&self.path, data).await
    }

    /// Read raw bytes
    pub async fn read_bytes(&self) -> Result<Bytes> {
        self.backend.read(&self.path).await
    }

    /// True if a file or directory exists here
    pub async fn exists(&self) -> Result<bool> {
        self.backend.exists(&self.path).await
    }

    /// Create this directory and any missing parents
    pub async fn mkdir(&self) -> Result<()> {
        self.backend.create_dir_all(&self.path).await
    }

    /// Remove this file or directory tree; missing paths are ignored
    pub async fn remove_all(&self) -> Result<()> {
        self.backend.remove_all(&self.path).await
    }

    /// Move this tree to `target`, which must not exist
    pub async fn rename_to(&self, target: &CheckpointPath) -> Result<()> {
        self.backend.rename(&self.path, &target.path).await
    }

    /// Every file beneath this path, relative to the backend root
    pub async fn list(&self) -> Result<Vec<String>> {
        let prefix = if self.path.is_empty() {
            String::new()
        } else {
            format!("{}/", self.path)
        };
        self.backend.list(&prefix).await
    }
}

/// Collapse empty, `.` and `..` components; `..` at the root is dropped
fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    parts.join("/")
}

impl Div<&str> for &CheckpointPath {
    type Output = CheckpointPath;

    fn div(self, name: &str) -> CheckpointPath {
        self.join(name)
    }
}

impl Div<&str> for CheckpointPath {
    type Output = CheckpointPath;

    fn div(self, name: &str) -> CheckpointPath {
        self.join(name)
    }
}

impl PartialEq for CheckpointPath {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend) && self.path == other.path
    }
}

impl fmt::Display for CheckpointPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.path)
    }
}

impl fmt::Debug for CheckpointPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CheckpointPath").field(&self.path).finish()
    }
}
