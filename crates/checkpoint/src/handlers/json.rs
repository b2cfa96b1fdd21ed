//! Nested mappings stored as a single JSON file

use std::sync::Arc;

use async_trait::async_trait;
use checkpoint_core::{Error, JsonHandlerConfig, RankProvider, Result};
use serde::Serialize;
use serde_json::Value;
use storage::CheckpointPath;
use tracing::{debug, instrument};

use crate::args::{foreign_args, HandlerKind, RestoreArgs, Restored, SaveArgs};
use crate::handler::CheckpointHandler;

/// Parameters for saving to JSON
#[derive(Debug, Clone, PartialEq)]
pub struct JsonSaveArgs {
    /// A JSON object
    pub item: Value,
}

impl JsonSaveArgs {
    pub fn new(item: Value) -> Self {
        Self { item }
    }

    /// Build from any serializable value
    pub fn from_serialize<T: Serialize>(item: &T) -> Result<Self> {
        Ok(Self {
            item: serde_json::to_value(item)?,
        })
    }
}

/// Marks a restore as JSON; the handler needs no hint
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JsonRestoreArgs;

/// Saves a nested mapping as JSON text
pub struct JsonCheckpointHandler {
    filename: String,
    rank: Arc<dyn RankProvider>,
}

impl JsonCheckpointHandler {
    /// Handler writing to the default `metadata` file
    pub fn new(rank: Arc<dyn RankProvider>) -> Self {
        Self::with_config(JsonHandlerConfig::default(), rank)
    }

    pub fn with_config(config: JsonHandlerConfig, rank: Arc<dyn RankProvider>) -> Self {
        Self {
            filename: config.filename,
            rank,
        }
    }

    pub fn with_filename(filename: impl Into<String>, rank: Arc<dyn RankProvider>) -> Self {
        Self::with_config(
            JsonHandlerConfig {
                filename: filename.into(),
            },
            rank,
        )
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl CheckpointHandler for JsonCheckpointHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Json
    }

    #[instrument(skip(self, args), fields(handler = "json", directory = %directory))]
    async fn save(&self, directory: &CheckpointPath, args: &SaveArgs) -> Result<()> {
        let item = match args {
            SaveArgs::Json(args) => &args.item,
            other => return Err(foreign_args(other.kind(), HandlerKind::Json)),
        };
        if !item.is_object() {
            return Err(Error::InvalidArgument {
                message: format!("JSON checkpoint item must be a mapping, got {}", type_name(item)),
            });
        }

        if !self.rank.is_primary() {
            debug!(process_index = self.rank.process_index(), "Skipping JSON write on non-primary process");
            return Ok(());
        }

        let text = serde_json::to_string(item)?;
        let size = directory.join(&self.filename).write_text(&text).await?;
        debug!(size_bytes = size, file = %self.filename, "JSON checkpoint written");
        Ok(())
    }

    #[instrument(skip(self, args), fields(handler = "json", directory = %directory))]
    async fn restore(
        &self,
        directory: &CheckpointPath,
        args: Option<&RestoreArgs>,
    ) -> Result<Restored> {
        if let Some(other) = args.filter(|a| !matches!(a, RestoreArgs::Json(_))) {
            return Err(foreign_args(other.kind(), HandlerKind::Json));
        }

        let text = directory.join(&self.filename).read_text().await?;
        Ok(Restored::Json(serde_json::from_str(&text)?))
    }

    async fn structure(&self, _directory: &CheckpointPath) -> Result<Value> {
        Err(Error::Unsupported {
            handler: "json".to_string(),
            operation: "structure".to_string(),
        })
    }
}
