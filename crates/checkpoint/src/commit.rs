//! Directory commit protocol shared by both checkpointers
//!
//! A save writes into `<dir><tmp_suffix>` and becomes visible only when the
//! primary process renames that directory into place. The final directory
//! carries a `_CHECKPOINT_METADATA` marker, so a directory is complete iff the
//! marker is present. Every phase is bracketed by a named barrier so that no
//! process runs ahead of the others:
//!
//! ```text
//! <dir>:save_start      overwrite check passed everywhere
//! <dir>:tmp_ready       primary has cleared and created the temp directory
//! <dir>:write_complete  every process has resolved its commit futures
//! <dir>:committed       primary has renamed the temp directory into place
//! ```
//!
//! A crash between moving the old checkpoint aside and moving the new one
//! into place leaves only `<dir><old_suffix>`. The next save rolls it back
//! under two extra barriers (`<dir>:recover_start`, `<dir>:recovered`) before
//! the overwrite check runs.

use std::sync::Arc;

use checkpoint_core::{
    CheckpointerConfig, CommitMarker, Error, ProcessContext, Result, COMMIT_MARKER_FILE,
};
use storage::CheckpointPath;
use tracing::{debug, info, instrument, warn};

/// Lifecycle state of a checkpoint directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryState {
    /// Nothing has been written
    Absent,
    /// A save has started but not been committed
    Saving,
    /// Committed and safe to read
    Complete,
}

/// Phase names used with the commit barrier
const SAVE_START: &str = "save_start";
const TMP_READY: &str = "tmp_ready";
const WRITE_COMPLETE: &str = "write_complete";
const COMMITTED: &str = "committed";
const RECOVER_START: &str = "recover_start";
const RECOVERED: &str = "recovered";

/// Runs the barrier and rename steps of a save
#[derive(Clone)]
pub struct CommitProtocol {
    ctx: ProcessContext,
    config: Arc<CheckpointerConfig>,
    handler: &'static str,
}

impl CommitProtocol {
    pub fn new(ctx: ProcessContext, config: CheckpointerConfig, handler: &'static str) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ctx,
            config: Arc::new(config),
            handler,
        })
    }

    pub fn context(&self) -> &ProcessContext {
        &self.ctx
    }

    pub fn config(&self) -> &CheckpointerConfig {
        &self.config
    }

    /// Temp directory a save into `directory` writes to
    pub fn tmp_dir(&self, directory: &CheckpointPath) -> CheckpointPath {
        directory.with_suffix(&self.config.tmp_suffix)
    }

    fn old_dir(&self, directory: &CheckpointPath) -> CheckpointPath {
        directory.with_suffix(&self.config.old_suffix)
    }

    /// Classify `directory`
    pub async fn state(&self, directory: &CheckpointPath) -> Result<DirectoryState> {
        let complete = if self.config.write_commit_marker {
            directory.join(COMMIT_MARKER_FILE).exists().await?
        } else {
            directory.exists().await?
        };
        if complete {
            return Ok(DirectoryState::Complete);
        }
        if directory.exists().await? || self.tmp_dir(directory).exists().await? {
            return Ok(DirectoryState::Saving);
        }
        Ok(DirectoryState::Absent)
    }

    /// Whether a replaced checkpoint was left aside with nothing in its place
    pub async fn needs_recovery(&self, directory: &CheckpointPath) -> Result<bool> {
        if directory.exists().await? {
            return Ok(false);
        }
        let old = self.old_dir(directory);
        if self.config.write_commit_marker {
            old.join(COMMIT_MARKER_FILE).exists().await
        } else {
            old.exists().await
        }
    }

    /// Move a stranded replaced checkpoint back to `directory`
    ///
    /// Every process decides from the same untouched directory listing, and the
    /// primary only renames once all of them have arrived at `recover_start`.
    async fn recover(&self, directory: &CheckpointPath) -> Result<()> {
        self.sync(directory, RECOVER_START).await?;
        if self.ctx.is_primary() {
            let old = self.old_dir(directory);
            warn!(old = %old, "Restoring checkpoint stranded by an interrupted overwrite");
            old.rename_to(directory).await?;
        }
        self.sync(directory, RECOVERED).await
    }

    pub async fn is_complete(&self, directory: &CheckpointPath) -> Result<bool> {
        Ok(self.state(directory).await? == DirectoryState::Complete)
    }

    /// Wait for every process at the `phase` barrier of `directory`
    async fn sync(&self, directory: &CheckpointPath, phase: &str) -> Result<()> {
        let name = format!("{}:{}", directory, phase);
        debug!(barrier_id = %name, "Entering commit barrier");
        match self.config.barrier_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.ctx.barrier.sync(&name))
                .await
                .map_err(|_| Error::BarrierTimeout {
                    barrier_id: name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })?,
            None => self.ctx.barrier.sync(&name).await,
        }
    }

    /// Check for overwrite and set up the temp directory
    ///
    /// Returns the temp directory the handler should write into. Fails with
    /// `CheckpointExists` before any barrier when `directory` is complete and
    /// `force` is false, so the existing checkpoint is left untouched.
    #[instrument(skip(self), fields(directory = %directory))]
    pub async fn prepare(&self, directory: &CheckpointPath, force: bool) -> Result<CheckpointPath> {
        if self.needs_recovery(directory).await? {
            self.recover(directory).await?;
        }

        let state = self.state(directory).await?;
        if state == DirectoryState::Complete && !force {
            return Err(Error::CheckpointExists {
                path: directory.to_string(),
            });
        }
        if state == DirectoryState::Complete {
            info!("Overwriting existing checkpoint");
        }

        self.sync(directory, SAVE_START).await?;

        let tmp = self.tmp_dir(directory);
        if self.ctx.is_primary() {
            if tmp.exists().await? {
                warn!(tmp = %tmp, "Removing leftover temporary directory from an interrupted save");
                tmp.remove_all().await?;
            }
            let old = self.old_dir(directory);
            if state == DirectoryState::Complete && old.exists().await? {
                warn!(old = %old, "Removing leftover replaced checkpoint");
                old.remove_all().await?;
            }
            tmp.mkdir().await?;
        }

        self.sync(directory, TMP_READY).await?;
        Ok(tmp)
    }

    /// Make the contents of `tmp` visible as `directory`
    ///
    /// Must run on every process after its commit futures have resolved.
    #[instrument(skip(self, tmp), fields(directory = %directory))]
    pub async fn finalize(&self, directory: &CheckpointPath, tmp: &CheckpointPath) -> Result<()> {
        self.sync(directory, WRITE_COMPLETE).await?;

        if self.ctx.is_primary() {
            let start = std::time::Instant::now();
            if self.config.write_commit_marker {
                let marker = CommitMarker::new(self.handler, self.ctx.rank.process_count());
                tmp.join(COMMIT_MARKER_FILE)
                    .write_text(&serde_json::to_string(&marker)?)
                    .await?;
            }

            let old = self.old_dir(directory);
            let replaced = directory.exists().await?;
            if replaced {
                old.remove_all().await?;
                directory.rename_to(&old).await?;
            }
            tmp.rename_to(directory).await.map_err(|e| Error::CommitFailed {
                message: format!("cannot move {} into place: {}", tmp, e),
            })?;
            if replaced {
                old.remove_all().await?;
            }

            info!(
                handler = self.handler,
                replaced,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Checkpoint committed"
            );
        }

        self.sync(directory, COMMITTED).await
    }
}

impl std::fmt::Debug for CommitProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitProtocol")
            .field("handler", &self.handler)
            .field("config", &self.config)
            .field("ctx", &self.ctx)
            .finish()
    }
}
