//! Checkpoint configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// Default file name written by the JSON handler
pub const DEFAULT_JSON_FILENAME: &str = "metadata";

/// Checkpointer settings shared by the sync and async variants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointerConfig {
    /// Suffix appended to the target directory while a save is in progress
    pub tmp_suffix: String,

    /// Suffix given to a replaced checkpoint until the new one is in place
    pub old_suffix: String,

    /// Write the `_CHECKPOINT_METADATA` commit marker on finalize
    pub write_commit_marker: bool,

    /// Upper bound on each commit barrier, `None` waits forever
    #[serde(with = "optional_millis")]
    pub barrier_timeout: Option<Duration>,
}

impl Default for CheckpointerConfig {
    fn default() -> Self {
        Self {
            tmp_suffix: ".checkpoint-tmp".to_string(),
            old_suffix: ".checkpoint-old".to_string(),
            write_commit_marker: true,
            barrier_timeout: None,
        }
    }
}

impl CheckpointerConfig {
    /// Reject suffixes that would collide with the target directory
    pub fn validate(&self) -> Result<()> {
        if self.tmp_suffix.is_empty() || self.old_suffix.is_empty() {
            return Err(Error::InvalidConfig {
                message: "tmp_suffix and old_suffix must be non-empty".to_string(),
            });
        }
        if self.tmp_suffix == self.old_suffix {
            return Err(Error::InvalidConfig {
                message: format!(
                    "tmp_suffix and old_suffix must differ (both {:?})",
                    self.tmp_suffix
                ),
            });
        }
        if !self.write_commit_marker {
            tracing::warn!("Commit marker disabled; completeness falls back to directory existence");
        }
        Ok(())
    }
}

/// JSON handler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonHandlerConfig {
    /// File name written under the checkpoint directory
    pub filename: String,
}

impl Default for JsonHandlerConfig {
    fn default() -> Self {
        Self {
            filename: DEFAULT_JSON_FILENAME.to_string(),
        }
    }
}

/// Identity of this process within the cooperating group
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Zero-based index of this process
    pub process_index: usize,

    /// Number of cooperating processes
    pub process_count: usize,

    /// Index of the process permitted to write
    pub primary_process: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            process_index: 0,
            process_count: 1,
            primary_process: 0,
        }
    }
}

impl ProcessConfig {
    /// Check that indices fall inside the group
    pub fn validate(&self) -> Result<()> {
        if self.process_count == 0 {
            return Err(Error::InvalidConfig {
                message: "process_count must be at least 1".to_string(),
            });
        }
        if self.process_index >= self.process_count {
            return Err(Error::InvalidConfig {
                message: format!(
                    "process_index {} out of range for {} processes",
                    self.process_index, self.process_count
                ),
            });
        }
        if self.primary_process >= self.process_count {
            return Err(Error::InvalidConfig {
                message: format!(
                    "primary_process {} out of range for {} processes",
                    self.primary_process, self.process_count
                ),
            });
        }
        Ok(())
    }
}

/// Optional duration serialized as milliseconds
mod optional_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
