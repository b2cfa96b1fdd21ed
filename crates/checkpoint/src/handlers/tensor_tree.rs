//! Tensor trees stored as a structure file plus one binary file per leaf
//!
//! Layout under the checkpoint directory:
//!
//! ```text
//! _tree.json       nested structure, leaf dtype/shape, inline scalars
//! tensors/0..N     one file per tensor leaf, in key order
//! ```
//!
//! Each leaf file starts with the `CKPT` magic, a little-endian format
//! version and header length, then a bincode [`LeafHeader`] followed by the
//! raw tensor bytes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use checkpoint_core::{Error, RankProvider, Result};
use futures::future::try_join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use storage::CheckpointPath;
use tracing::{debug, info, instrument, warn};

use crate::args::{foreign_args, HandlerKind, RestoreArgs, Restored, SaveArgs};
use crate::future::{wait_for_commits, CommitFuture};
use crate::handler::{AsyncCheckpointHandler, CheckpointHandler};
use crate::tree::{join_key, DType, Tensor, TensorTree};
use crate::worker::{CommitTask, CommitWorker};

/// Name of the structure file
pub const TREE_METADATA_FILE: &str = "_tree.json";

/// Directory holding leaf files
pub const TENSOR_DIR: &str = "tensors";

/// Magic bytes for leaf files
pub const LEAF_MAGIC: [u8; 4] = *b"CKPT";

/// Leaf file format version
pub const LEAF_FORMAT_VERSION: u32 = 1;

/// Fixed prefix: magic, version, header length
const LEAF_PREFIX_LEN: usize = 12;

/// Header preceding the tensor bytes in each leaf file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafHeader {
    pub dtype: DType,
    pub shape: Vec<u64>,
    pub data_size: u64,
}

/// Serialized form of a tree node in `_tree.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TreeMetadata {
    Tensor {
        dtype: DType,
        shape: Vec<usize>,
        file: String,
    },
    Scalar {
        value: serde_json::Value,
    },
    Node {
        children: BTreeMap<String, TreeMetadata>,
    },
}

/// Parameters for saving a tree
#[derive(Debug, Clone)]
pub struct TensorTreeSaveArgs {
    pub item: TensorTree,
}

impl TensorTreeSaveArgs {
    pub fn new(item: TensorTree) -> Self {
        Self { item }
    }
}

/// How to materialize one restored leaf
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeafRestoreArgs {
    /// Cast the stored tensor to this type
    pub dtype: Option<DType>,
}

/// Parameters for restoring a tree
#[derive(Debug, Clone, Default)]
pub struct TensorTreeRestoreArgs {
    /// Template whose keys select what to restore; `None` restores everything
    pub item: Option<TensorTree>,
    /// Per-leaf options keyed by `/`-joined key path
    pub restore_args: BTreeMap<String, LeafRestoreArgs>,
}

impl TensorTreeRestoreArgs {
    pub fn with_template(item: TensorTree) -> Self {
        Self {
            item: Some(item),
            restore_args: BTreeMap::new(),
        }
    }

    /// Request `dtype` for the leaf at `key_path`
    pub fn cast(mut self, key_path: impl Into<String>, dtype: DType) -> Self {
        self.restore_args
            .insert(key_path.into(), LeafRestoreArgs { dtype: Some(dtype) });
        self
    }
}

/// Saves nested tensor trees
pub struct TensorTreeCheckpointHandler {
    rank: Arc<dyn RankProvider>,
    worker: CommitWorker,
}

impl TensorTreeCheckpointHandler {
    pub fn new(rank: Arc<dyn RankProvider>) -> Self {
        Self {
            rank,
            worker: CommitWorker::new(HandlerKind::TensorTree.as_str()),
        }
    }

    async fn read_metadata(directory: &CheckpointPath) -> Result<TreeMetadata> {
        let text = directory.join(TREE_METADATA_FILE).read_text().await?;
        serde_json::from_str(&text).map_err(|e| Error::CheckpointCorrupted {
            path: directory.to_string(),
            reason: format!("invalid {}: {}", TREE_METADATA_FILE, e),
        })
    }
}

/// Build the structure file and the list of leaf writes
fn plan_tree(tree: &TensorTree, leaves: &mut Vec<(String, Tensor)>) -> TreeMetadata {
    match tree {
        TensorTree::Leaf(tensor) => {
            let file = format!("{}/{}", TENSOR_DIR, leaves.len());
            leaves.push((file.clone(), tensor.clone()));
            TreeMetadata::Tensor {
                dtype: tensor.dtype(),
                shape: tensor.shape().to_vec(),
                file,
            }
        }
        TensorTree::Scalar(value) => TreeMetadata::Scalar {
            value: value.clone(),
        },
        TensorTree::Node(children) => TreeMetadata::Node {
            children: children
                .iter()
                .map(|(key, child)| (key.clone(), plan_tree(child, leaves)))
                .collect(),
        },
    }
}

/// Encode a leaf file
fn encode_leaf(tensor: &Tensor) -> Result<Bytes> {
    let header = LeafHeader {
        dtype: tensor.dtype(),
        shape: tensor.shape().iter().map(|&d| d as u64).collect(),
        data_size: tensor.data().len() as u64,
    };
    let header_bytes = bincode::serialize(&header)?;

    let mut buf = BytesMut::with_capacity(LEAF_PREFIX_LEN + header_bytes.len() + tensor.data().len());
    buf.put_slice(&LEAF_MAGIC);
    buf.put_u32_le(LEAF_FORMAT_VERSION);
    buf.put_u32_le(header_bytes.len() as u32);
    buf.put_slice(&header_bytes);
    buf.put_slice(tensor.data());
    Ok(buf.freeze())
}

/// Decode a leaf file
fn decode_leaf(path: &str, data: Bytes) -> Result<Tensor> {
    let corrupted = |reason: String| Error::CheckpointCorrupted {
        path: path.to_string(),
        reason,
    };

    if data.len() < LEAF_PREFIX_LEN {
        return Err(corrupted(format!("leaf file truncated at {} bytes", data.len())));
    }
    if data[..4] != LEAF_MAGIC {
        return Err(corrupted("invalid leaf magic".to_string()));
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != LEAF_FORMAT_VERSION {
        warn!(
            path,
            expected = LEAF_FORMAT_VERSION,
            actual = version,
            "Leaf format version mismatch"
        );
    }
    let header_len = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    let data_start = usize::try_from(header_len)
        .ok()
        .and_then(|len| len.checked_add(LEAF_PREFIX_LEN))
        .filter(|&end| end <= data.len())
        .ok_or_else(|| corrupted("leaf header truncated".to_string()))?;

    let header: LeafHeader = bincode::deserialize(&data[LEAF_PREFIX_LEN..data_start])?;
    let payload = data.slice(data_start..);
    if payload.len() as u64 != header.data_size {
        return Err(corrupted(format!(
            "expected {} data bytes, found {}",
            header.data_size,
            payload.len()
        )));
    }

    let shape = header
        .shape
        .iter()
        .map(|&d| usize::try_from(d))
        .collect::<std::result::Result<Vec<usize>, _>>()
        .map_err(|_| corrupted(format!("leaf shape {:?} does not fit in memory", header.shape)))?;
    Tensor::from_bytes(header.dtype, shape, payload).map_err(|e| corrupted(e.to_string()))
}

/// Narrow the stored structure to the keys present in `template`
fn select(
    stored: &TreeMetadata,
    template: &TensorTree,
    prefix: &str,
    directory: &CheckpointPath,
) -> Result<TreeMetadata> {
    match (template, stored) {
        (TensorTree::Node(wanted), TreeMetadata::Node { children }) => {
            let mut selected = BTreeMap::new();
            for (key, child_template) in wanted {
                let key_path = join_key(prefix, key);
                let child = children.get(key).ok_or_else(|| Error::CheckpointCorrupted {
                    path: directory.to_string(),
                    reason: format!("key {:?} is missing from the checkpoint", key_path),
                })?;
                selected.insert(key.clone(), select(child, child_template, &key_path, directory)?);
            }
            Ok(TreeMetadata::Node { children: selected })
        }
        (TensorTree::Node(_), _) => Err(Error::CheckpointCorrupted {
            path: directory.to_string(),
            reason: format!("{:?} is a leaf in the checkpoint but a node in the template", prefix),
        }),
        _ => Ok(stored.clone()),
    }
}

/// Tensor leaves of a metadata tree as `(key path, file, dtype, shape)`
fn leaf_files(meta: &TreeMetadata, prefix: &str, out: &mut Vec<(String, String, DType, Vec<usize>)>) {
    match meta {
        TreeMetadata::Tensor { dtype, shape, file } => {
            out.push((prefix.to_string(), file.clone(), *dtype, shape.clone()))
        }
        TreeMetadata::Scalar { .. } => {}
        TreeMetadata::Node { children } => {
            for (key, child) in children {
                leaf_files(child, &join_key(prefix, key), out);
            }
        }
    }
}

fn assemble(
    meta: &TreeMetadata,
    prefix: &str,
    tensors: &mut HashMap<String, Tensor>,
) -> Result<TensorTree> {
    Ok(match meta {
        TreeMetadata::Tensor { .. } => {
            let tensor = tensors.remove(prefix).ok_or_else(|| Error::Internal {
                message: format!("leaf {:?} was not loaded", prefix),
            })?;
            TensorTree::Leaf(tensor)
        }
        TreeMetadata::Scalar { value } => TensorTree::Scalar(value.clone()),
        TreeMetadata::Node { children } => {
            let mut nodes = BTreeMap::new();
            for (key, child) in children {
                nodes.insert(key.clone(), assemble(child, &join_key(prefix, key), tensors)?);
            }
            TensorTree::Node(nodes)
        }
    })
}

#[async_trait]
impl CheckpointHandler for TensorTreeCheckpointHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::TensorTree
    }

    async fn save(&self, directory: &CheckpointPath, args: &SaveArgs) -> Result<()> {
        let futures = self.async_save(directory, args).await?;
        wait_for_commits(futures).await
    }

    #[instrument(skip(self, args), fields(handler = "tensor_tree", directory = %directory))]
    async fn restore(
        &self,
        directory: &CheckpointPath,
        args: Option<&RestoreArgs>,
    ) -> Result<Restored> {
        let default_args = TensorTreeRestoreArgs::default();
        let args = match args {
            Some(RestoreArgs::TensorTree(args)) => args,
            None => &default_args,
            Some(other) => return Err(foreign_args(other.kind(), HandlerKind::TensorTree)),
        };

        let stored = Self::read_metadata(directory).await?;
        let selected = match &args.item {
            Some(template) => select(&stored, template, "", directory)?,
            None => stored,
        };

        let mut leaves = Vec::new();
        leaf_files(&selected, "", &mut leaves);

        let loaded = try_join_all(leaves.into_iter().map(|(key_path, file, dtype, shape)| {
            let path = directory.join(&file);
            async move {
                let tensor = decode_leaf(path.as_str(), path.read_bytes().await?)?;
                if tensor.dtype() != dtype || tensor.shape() != shape.as_slice() {
                    return Err(Error::CheckpointCorrupted {
                        path: path.to_string(),
                        reason: format!(
                            "leaf {:?} has dtype {:?} shape {:?}, structure records {:?} {:?}",
                            key_path,
                            tensor.dtype(),
                            tensor.shape(),
                            dtype,
                            shape
                        ),
                    });
                }
                Ok::<_, Error>((key_path, tensor))
            }
        }))
        .await?;

        let mut tensors: HashMap<String, Tensor> = loaded.into_iter().collect();
        for (key_path, leaf_args) in &args.restore_args {
            match (tensors.get_mut(key_path), leaf_args.dtype) {
                (Some(tensor), Some(dtype)) => *tensor = tensor.cast(dtype),
                (None, _) => debug!(key_path = %key_path, "Restore args for a key that is not a restored leaf"),
                _ => {}
            }
        }

        let num_leaves = tensors.len();
        let tree = assemble(&selected, "", &mut tensors)?;
        debug!(num_leaves, "Tensor tree restored");
        Ok(Restored::TensorTree(tree))
    }

    async fn structure(&self, directory: &CheckpointPath) -> Result<serde_json::Value> {
        let text = directory.join(TREE_METADATA_FILE).read_text().await?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn close(&self) {
        self.worker.close().await;
    }
}

#[async_trait]
impl AsyncCheckpointHandler for TensorTreeCheckpointHandler {
    #[instrument(skip(self, args), fields(handler = "tensor_tree", directory = %directory))]
    async fn async_save(
        &self,
        directory: &CheckpointPath,
        args: &SaveArgs,
    ) -> Result<Vec<CommitFuture>> {
        let tree = match args {
            SaveArgs::TensorTree(args) => &args.item,
            other => return Err(foreign_args(other.kind(), HandlerKind::TensorTree)),
        };
        tree.validate_keys()?;

        let mut leaves = Vec::new();
        let metadata = plan_tree(tree, &mut leaves);
        let metadata_text = serde_json::to_string_pretty(&metadata)?;

        let directory = directory.clone();
        let rank = Arc::clone(&self.rank);
        let task: CommitTask = async move {
            if !rank.is_primary() {
                return Ok(());
            }
            let start = std::time::Instant::now();

            let sizes = try_join_all(leaves.iter().map(|(file, tensor)| {
                let path = directory.join(file);
                async move { path.write_bytes(encode_leaf(tensor)?).await }
            }))
            .await?;

            // Structure last, so a readable _tree.json implies its leaves exist
            let metadata_size = directory
                .join(TREE_METADATA_FILE)
                .write_text(&metadata_text)
                .await?;

            let size: u64 = sizes.iter().sum::<u64>() + metadata_size;
            let elapsed = start.elapsed();
            info!(
                directory = %directory,
                num_leaves = leaves.len(),
                size_bytes = size,
                elapsed_ms = elapsed.as_millis() as u64,
                throughput_mbps = (size as f64 / 1024.0 / 1024.0) / elapsed.as_secs_f64().max(1e-9),
                "Tensor tree write complete"
            );
            Ok(())
        }
        .boxed();

        let future = self.worker.submit("write tensor tree", task)?;
        Ok(vec![future])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use checkpoint_core::{LocalProcessGroup, SingleProcess};
    use serde_json::json;
    use storage::LocalStorage;
    use tempfile::TempDir;

    fn root(dir: &TempDir) -> CheckpointPath {
        CheckpointPath::root(Arc::new(LocalStorage::new(dir.path())))
    }

    fn train_state() -> TensorTree {
        TensorTree::node()
            .with(
                "params",
                TensorTree::node()
                    .with("bias", Tensor::from_f32(vec![2], &[0.5, -1.0]).unwrap().into())
                    .with(
                        "kernel",
                        Tensor::from_f64(vec![2, 2], &[1.5, 2.0, 3.25, 4.0]).unwrap().into(),
                    ),
            )
            .with("step", TensorTree::Scalar(json!(100)))
            .with("mask", Tensor::from_u8(vec![3], &[1, 0, 1]).unwrap().into())
    }

    #[tokio::test]
    async fn test_save_restore_full_tree() {
        let dir = TempDir::new().unwrap();
        let ckpt = root(&dir).join("ckpt");
        let handler = TensorTreeCheckpointHandler::new(Arc::new(SingleProcess));

        handler
            .save(&ckpt, &TensorTreeSaveArgs::new(train_state()).into())
            .await
            .unwrap();
        assert!(ckpt.join(TREE_METADATA_FILE).exists().await.unwrap());
        assert!(ckpt.join("tensors/0").exists().await.unwrap());

        let restored = handler
            .restore(&ckpt, None)
            .await
            .unwrap()
            .into_tensor_tree()
            .unwrap();
        assert_eq!(restored, train_state());
        handler.close().await;
    }

    #[tokio::test]
    async fn test_structure_reads_metadata_only() {
        let dir = TempDir::new().unwrap();
        let ckpt = root(&dir).join("ckpt");
        let handler = TensorTreeCheckpointHandler::new(Arc::new(SingleProcess));
        handler
            .save(&ckpt, &TensorTreeSaveArgs::new(train_state()).into())
            .await
            .unwrap();

        // Leaf data is not needed to describe the tree
        ckpt.join(TENSOR_DIR).remove_all().await.unwrap();

        let structure = handler.structure(&ckpt).await.unwrap();
        assert_eq!(structure["type"], "node");
        assert_eq!(structure["children"]["step"]["value"], 100);
        assert_eq!(structure["children"]["params"]["children"]["kernel"]["dtype"], "f64");
        assert_eq!(
            structure["children"]["params"]["children"]["kernel"]["shape"],
            json!([2, 2])
        );
        handler.close().await;
    }

    #[tokio::test]
    async fn test_restore_with_template_and_cast() {
        let dir = TempDir::new().unwrap();
        let ckpt = root(&dir).join("ckpt");
        let handler = TensorTreeCheckpointHandler::new(Arc::new(SingleProcess));
        handler
            .save(&ckpt, &TensorTreeSaveArgs::new(train_state()).into())
            .await
            .unwrap();

        let template = TensorTree::node().with(
            "params",
            TensorTree::node().with("kernel", TensorTree::Scalar(json!(null))),
        );
        let args = TensorTreeRestoreArgs::with_template(template).cast("params/kernel", DType::F32);

        let restored = handler
            .restore(&ckpt, Some(&args.into()))
            .await
            .unwrap()
            .into_tensor_tree()
            .unwrap();

        assert!(restored.get("step").is_none());
        assert!(restored.get("params/bias").is_none());
        match restored.get("params/kernel") {
            Some(TensorTree::Leaf(kernel)) => {
                assert_eq!(kernel.dtype(), DType::F32);
                assert_eq!(kernel.to_f64_vec(), vec![1.5, 2.0, 3.25, 4.0]);
            }
            other => panic!("unexpected kernel: {:?}", other),
        }
        handler.close().await;
    }

    #[tokio::test]
    async fn test_template_key_missing_from_checkpoint() {
        let dir = TempDir::new().unwrap();
        let ckpt = root(&dir).join("ckpt");
        let handler = TensorTreeCheckpointHandler::new(Arc::new(SingleProcess));
        handler
            .save(&ckpt, &TensorTreeSaveArgs::new(train_state()).into())
            .await
            .unwrap();

        let template = TensorTree::node().with("opt_state", TensorTree::node());
        let err = handler
            .restore(&ckpt, Some(&TensorTreeRestoreArgs::with_template(template).into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CheckpointCorrupted { .. }));
        assert!(err.to_string().contains("opt_state"));
        handler.close().await;
    }

    #[tokio::test]
    async fn test_invalid_key_is_rejected_before_dispatch() {
        let dir = TempDir::new().unwrap();
        let ckpt = root(&dir).join("ckpt");
        let handler = TensorTreeCheckpointHandler::new(Arc::new(SingleProcess));

        let tree = TensorTree::node().with("layer/0", TensorTree::Scalar(json!(1)));
        let err = handler
            .async_save(&ckpt, &TensorTreeSaveArgs::new(tree).into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert!(!handler.worker.is_busy());
        assert!(!ckpt.exists().await.unwrap());
        handler.close().await;
    }

    #[tokio::test]
    async fn test_corrupted_leaf_is_detected() {
        let dir = TempDir::new().unwrap();
        let ckpt = root(&dir).join("ckpt");
        let handler = TensorTreeCheckpointHandler::new(Arc::new(SingleProcess));
        handler
            .save(&ckpt, &TensorTreeSaveArgs::new(train_state()).into())
            .await
            .unwrap();

        ckpt.join("tensors/0")
            .write_bytes(Bytes::from_static(b"JUNKJUNKJUNKJUNK"))
            .await
            .unwrap();
        let err = handler.restore(&ckpt, None).await.unwrap_err();
        assert!(matches!(err, Error::CheckpointCorrupted { .. }));
        handler.close().await;
    }

    #[tokio::test]
    async fn test_non_primary_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let ckpt = root(&dir).join("ckpt");
        let group = LocalProcessGroup::new(2).unwrap();
        let handler = TensorTreeCheckpointHandler::new(Arc::new(group.process(1).unwrap()));

        handler
            .save(&ckpt, &TensorTreeSaveArgs::new(train_state()).into())
            .await
            .unwrap();
        assert!(!ckpt.exists().await.unwrap());
        handler.close().await;
    }

    #[test]
    fn test_leaf_encoding() {
        let tensor = Tensor::from_i32(vec![2], &[7, -7]).unwrap();
        let encoded = encode_leaf(&tensor).unwrap();
        assert_eq!(&encoded[..4], b"CKPT");

        let decoded = decode_leaf("leaf", encoded.clone()).unwrap();
        assert_eq!(decoded, tensor);

        let truncated = encoded.slice(..encoded.len() - 1);
        assert!(matches!(
            decode_leaf("leaf", truncated),
            Err(Error::CheckpointCorrupted { .. })
        ));
    }

    #[test]
    fn test_leaf_with_huge_shape_is_corrupted() {
        let header = LeafHeader {
            dtype: DType::F32,
            shape: vec![u64::MAX / 2, 4],
            data_size: 0,
        };
        let header_bytes = bincode::serialize(&header).unwrap();
        let mut buf = BytesMut::new();
        buf.put_slice(&LEAF_MAGIC);
        buf.put_u32_le(LEAF_FORMAT_VERSION);
        buf.put_u32_le(header_bytes.len() as u32);
        buf.put_slice(&header_bytes);

        let result = decode_leaf("tensors/0", buf.freeze());
        assert!(matches!(result, Err(Error::CheckpointCorrupted { .. })));
    }

    #[test]
    fn test_leaf_header_length_past_end_is_corrupted() {
        let mut buf = BytesMut::new();
        buf.put_slice(&LEAF_MAGIC);
        buf.put_u32_le(LEAF_FORMAT_VERSION);
        buf.put_u32_le(u32::MAX);

        let result = decode_leaf("tensors/0", buf.freeze());
        assert!(matches!(result, Err(Error::CheckpointCorrupted { .. })));
    }
}
