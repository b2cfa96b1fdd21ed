//! Protocol messages stored in protobuf text format
//!
//! Messages are handled reflectively through [`prost_reflect`], so the
//! handler works for any message type whose descriptor is known at runtime.
//! The write runs on the handler's [`CommitWorker`]; restoring needs the
//! target [`MessageDescriptor`] because text format carries no type name.

use std::sync::Arc;

use async_trait::async_trait;
use checkpoint_core::{Error, RankProvider, Result};
use futures::FutureExt;
use prost_reflect::{DynamicMessage, MessageDescriptor, ReflectMessage};
use storage::CheckpointPath;
use tracing::{debug, instrument};

use crate::args::{foreign_args, HandlerKind, RestoreArgs, Restored, SaveArgs};
use crate::future::{wait_for_commits, CommitFuture};
use crate::handler::{AsyncCheckpointHandler, CheckpointHandler};
use crate::worker::{CommitTask, CommitWorker};

/// Parameters for saving a message
#[derive(Debug, Clone)]
pub struct ProtoSaveArgs {
    pub item: DynamicMessage,
}

impl ProtoSaveArgs {
    pub fn new(item: DynamicMessage) -> Self {
        Self { item }
    }

    /// Build from a generated message type
    pub fn from_message<M: ReflectMessage>(message: &M) -> Self {
        Self {
            item: message.transcode_to_dynamic(),
        }
    }
}

/// Parameters for restoring a message
#[derive(Debug, Clone, Default)]
pub struct ProtoRestoreArgs {
    /// Type to parse the stored text into
    pub item: Option<MessageDescriptor>,
}

impl ProtoRestoreArgs {
    pub fn new(item: MessageDescriptor) -> Self {
        Self { item: Some(item) }
    }

    /// Restore into the type of a generated message
    pub fn for_message<M: ReflectMessage + Default>() -> Self {
        Self::new(M::default().descriptor())
    }
}

/// Saves one protocol message as a text file
pub struct ProtoCheckpointHandler {
    filename: String,
    rank: Arc<dyn RankProvider>,
    worker: CommitWorker,
}

impl ProtoCheckpointHandler {
    pub fn new(filename: impl Into<String>, rank: Arc<dyn RankProvider>) -> Self {
        let filename = filename.into();
        Self {
            worker: CommitWorker::new(format!("proto:{}", filename)),
            filename,
            rank,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }
}

#[async_trait]
impl CheckpointHandler for ProtoCheckpointHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Proto
    }

    async fn save(&self, directory: &CheckpointPath, args: &SaveArgs) -> Result<()> {
        let futures = self.async_save(directory, args).await?;
        wait_for_commits(futures).await
    }

    #[instrument(skip(self, args), fields(handler = "proto", directory = %directory))]
    async fn restore(
        &self,
        directory: &CheckpointPath,
        args: Option<&RestoreArgs>,
    ) -> Result<Restored> {
        let descriptor = match args {
            Some(RestoreArgs::Proto(ProtoRestoreArgs {
                item: Some(descriptor),
            })) => descriptor.clone(),
            Some(RestoreArgs::Proto(_)) | None => {
                return Err(Error::MissingRestoreHint {
                    handler: HandlerKind::Proto.to_string(),
                    message: "Must provide `item` in order to deserialize proto to the correct type."
                        .to_string(),
                })
            }
            Some(other) => return Err(foreign_args(other.kind(), HandlerKind::Proto)),
        };

        let path = directory.join(&self.filename);
        let text = path.read_text().await?;
        let message = DynamicMessage::parse_text_format(descriptor.clone(), &text).map_err(|e| {
            Error::Serialization(format!(
                "cannot parse {} as {}: {}",
                path,
                descriptor.full_name(),
                e
            ))
        })?;
        Ok(Restored::Proto(message))
    }

    async fn structure(&self, _directory: &CheckpointPath) -> Result<serde_json::Value> {
        Err(Error::Unsupported {
            handler: HandlerKind::Proto.to_string(),
            operation: "structure".to_string(),
        })
    }

    async fn close(&self) {
        self.worker.close().await;
    }
}

#[async_trait]
impl AsyncCheckpointHandler for ProtoCheckpointHandler {
    #[instrument(skip(self, args), fields(handler = "proto", directory = %directory))]
    async fn async_save(
        &self,
        directory: &CheckpointPath,
        args: &SaveArgs,
    ) -> Result<Vec<CommitFuture>> {
        let message = match args {
            SaveArgs::Proto(args) => args.item.clone(),
            other => return Err(foreign_args(other.kind(), HandlerKind::Proto)),
        };

        let path = directory.join(&self.filename);
        let rank = Arc::clone(&self.rank);
        let task: CommitTask = async move {
            if !rank.is_primary() {
                return Ok(());
            }
            let size = path.write_text(&message.to_text_format()).await?;
            debug!(
                file = %path,
                message_type = message.descriptor().full_name(),
                size_bytes = size,
                "Proto checkpoint written"
            );
            Ok(())
        }
        .boxed();

        let future = self
            .worker
            .submit(format!("write {}", self.filename), task)?;
        Ok(vec![future])
    }
}
