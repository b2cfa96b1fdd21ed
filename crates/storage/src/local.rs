//! Local filesystem backend
//!
//! Files are written through a sibling temp file and renamed into place, so a
//! reader never observes a half-written leaf or metadata file. Directory
//! renames back the commit protocol's tmp -> final step.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::StorageBackend;

/// Storage rooted at a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

/// Map an IO failure on `path`, keeping "not found" distinguishable
fn io_error(action: &str, path: &Path, e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::NotFound {
        Error::StoragePathNotFound {
            path: path.display().to_string(),
        }
    } else {
        Error::Storage {
            message: format!("{} {}: {}", action, path.display(), e),
        }
    }
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Backend paths are relative; a leading `/` names the root and `..` is dropped
    fn full(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .fold(self.root.clone(), |full, part| full.join(part))
    }

    async fn ensure_parent(target: &Path) -> Result<()> {
        match target.parent() {
            Some(parent) => fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create directory", parent, e)),
            None => Ok(()),
        }
    }

    async fn write_through_temp(target: &Path, temp: &Path, data: &[u8]) -> Result<()> {
        let mut file = fs::File::create(temp)
            .await
            .map_err(|e| io_error("create", temp, e))?;
        file.write_all(data)
            .await
            .map_err(|e| io_error("write", temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("sync", temp, e))?;
        fs::rename(temp, target)
            .await
            .map_err(|e| io_error("publish", target, e))
    }

    /// Collect every regular file below `dir`, relative to the root
    async fn walk_files(&self, dir: PathBuf) -> Vec<String> {
        let mut files = Vec::new();
        let mut pending = vec![dir];
        while let Some(dir) = pending.pop() {
            let Ok(mut entries) = fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        files.push(relative.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
        }
        files
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let target = self.full(path);
        let data = fs::read(&target)
            .await
            .map_err(|e| io_error("read", &target, e))?;
        debug!(bytes = data.len(), "Read file");
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let target = self.full(path);
        Self::ensure_parent(&target).await?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = target.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

        if let Err(e) = Self::write_through_temp(&target, &temp, &data).await {
            if let Err(cleanup) = fs::remove_file(&temp).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(temp = %temp.display(), error = %cleanup, "Failed to remove temp file");
                }
            }
            return Err(e);
        }
        Ok(data.len() as u64)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        match fs::metadata(self.full(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("stat", &self.full(path), e)),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = prefix.trim_start_matches('/');
        let start = self.full(prefix);
        let scan_from = if start.is_dir() {
            start
        } else {
            match start.parent() {
                Some(parent) if parent.is_dir() => parent.to_path_buf(),
                _ => return Ok(Vec::new()),
            }
        };

        let mut files: Vec<String> = self
            .walk_files(scan_from)
            .await
            .into_iter()
            .filter(|f| f.starts_with(prefix))
            .collect();
        files.sort();
        debug!(count = files.len(), "Listed files");
        Ok(files)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn create_dir_all(&self, path: &str) -> Result<()> {
        let target = self.full(path);
        fs::create_dir_all(&target)
            .await
            .map_err(|e| io_error("create directory", &target, e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = self.full(from);
        let target = self.full(to);
        if self.exists(to).await? {
            return Err(Error::Storage {
                message: format!("rename target {} already exists", target.display()),
            });
        }
        Self::ensure_parent(&target).await?;

        debug!(from = %source.display(), to = %target.display(), "Renaming");
        fs::rename(&source, &target)
            .await
            .map_err(|e| io_error("rename", &source, e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn remove_all(&self, path: &str) -> Result<()> {
        let target = self.full(path);
        let is_dir = match fs::symlink_metadata(&target).await {
            Ok(meta) => meta.is_dir(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error("stat", &target, e)),
        };

        debug!(target = %target.display(), is_dir, "Removing");
        let removed = if is_dir {
            fs::remove_dir_all(&target).await
        } else {
            fs::remove_file(&target).await
        };
        match removed {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_error("remove", &target, e)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> (TempDir, LocalStorage) {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path());
        (dir, storage)
    }

    #[tokio::test]
    async fn test_write_creates_parents_and_reads_back() {
        let (_dir, storage) = storage();

        let written = storage
            .write("step_1/tensors/0", Bytes::from("leaf bytes"))
            .await
            .unwrap();
        assert_eq!(written, 10);
        assert_eq!(
            storage.read("/step_1/tensors/0").await.unwrap(),
            Bytes::from("leaf bytes")
        );
    }

    #[tokio::test]
    async fn test_parent_components_cannot_leave_root() {
        let outer = TempDir::new().unwrap();
        let inner = outer.path().join("store");
        let storage = LocalStorage::new(&inner);

        storage.write("../outside", Bytes::from("x")).await.unwrap();
        assert!(inner.join("outside").exists());
        assert!(!outer.path().join("outside").exists());
    }

    #[tokio::test]
    async fn test_missing_paths() {
        let (_dir, storage) = storage();

        let result = storage.read("step_1/metadata").await;
        assert!(matches!(result, Err(Error::StoragePathNotFound { .. })));
        assert!(!storage.exists("step_1").await.unwrap());
        storage.remove_all("step_1").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix() {
        let (_dir, storage) = storage();

        storage.write("ckpt/step_1/metadata", Bytes::from("1")).await.unwrap();
        storage.write("ckpt/step_2/metadata", Bytes::from("2")).await.unwrap();
        storage.write("logs/train.txt", Bytes::from("x")).await.unwrap();

        assert_eq!(
            storage.list("ckpt/").await.unwrap(),
            vec!["ckpt/step_1/metadata".to_string(), "ckpt/step_2/metadata".to_string()]
        );
        assert_eq!(storage.list("ckpt/step_2").await.unwrap().len(), 1);
        assert_eq!(storage.list("").await.unwrap().len(), 3);
        assert!(storage.list("nowhere/at/all").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_moves_whole_tree() {
        let (_dir, storage) = storage();

        storage.write("ckpt.checkpoint-tmp/_tree.json", Bytes::from("{}")).await.unwrap();
        storage.write("ckpt.checkpoint-tmp/tensors/0", Bytes::from("b")).await.unwrap();

        storage.rename("ckpt.checkpoint-tmp", "ckpt").await.unwrap();

        assert!(!storage.exists("ckpt.checkpoint-tmp").await.unwrap());
        assert_eq!(storage.read("ckpt/tensors/0").await.unwrap(), Bytes::from("b"));
    }

    #[tokio::test]
    async fn test_rename_errors() {
        let (_dir, storage) = storage();

        storage.write("new/a", Bytes::from("a")).await.unwrap();
        storage.write("old/a", Bytes::from("old")).await.unwrap();

        let taken = storage.rename("new", "old").await;
        assert!(matches!(taken, Err(Error::Storage { .. })));
        assert_eq!(storage.read("old/a").await.unwrap(), Bytes::from("old"));

        let missing = storage.rename("ghost", "elsewhere").await;
        assert!(matches!(missing, Err(Error::StoragePathNotFound { .. })));
    }

    #[tokio::test]
    async fn test_remove_all_removes_directories_and_files() {
        let (_dir, storage) = storage();

        storage.write("tree/x/y", Bytes::from("y")).await.unwrap();
        storage.write("single", Bytes::from("s")).await.unwrap();

        storage.remove_all("tree").await.unwrap();
        storage.remove_all("single").await.unwrap();
        assert!(!storage.exists("tree").await.unwrap());
        assert!(!storage.exists("single").await.unwrap());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_after_write() {
        let (dir, storage) = storage();

        storage.write("metadata", Bytes::from("{}")).await.unwrap();
        storage.write("metadata", Bytes::from("{\"a\":1}")).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["metadata".to_string()]);
    }
}
