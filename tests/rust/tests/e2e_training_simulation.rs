//! End-to-end training simulation test
//!
//! Several simulated processes share one storage root and a barrier group.
//! Each runs the same training loop, checkpointing model state with the async
//! tensor-tree checkpointer and run metadata with the JSON checkpointer, then
//! "restarts" and resumes from the newest complete checkpoint.

use anyhow::Result;
use checkpoint::{
    AsyncCheckpointer, Checkpointer, DType, DirectoryState, JsonSaveArgs, Tensor, TensorTree,
    TensorTreeRestoreArgs, TensorTreeSaveArgs,
};
use checkpoint_core::{LocalProcess, LocalProcessGroup, ProcessContext, RankProvider};
use serde_json::json;
use std::sync::Arc;
use storage::{CheckpointPath, LocalStorage};
use tempfile::TempDir;

const WORLD_SIZE: usize = 4;
const TOTAL_STEPS: i64 = 9;
const SAVE_EVERY: i64 = 3;

/// Simulates one training process
struct SimulatedWorker {
    process: LocalProcess,
    root: CheckpointPath,
    weights: Vec<f32>,
}

impl SimulatedWorker {
    fn new(process: LocalProcess, root: CheckpointPath) -> Self {
        Self {
            process,
            root,
            weights: vec![0.0; 8],
        }
    }

    fn ctx(&self) -> ProcessContext {
        ProcessContext::local(self.process.clone())
    }

    fn state(&self, step: i64) -> Result<TensorTree> {
        Ok(TensorTree::node()
            .with("step", TensorTree::Scalar(json!(step)))
            .with(
                "params",
                TensorTree::node().with("w", Tensor::from_f32(vec![2, 4], &self.weights)?.into()),
            ))
    }

    /// Every process computes the same update, as with synchronized data parallelism
    fn train_step(&mut self, step: i64) {
        for (i, w) in self.weights.iter_mut().enumerate() {
            *w += 0.5 * (step as f32) + i as f32;
        }
    }

    async fn run(&mut self) -> Result<Vec<i64>> {
        let state_ckpt = AsyncCheckpointer::tensor_tree(self.ctx())?;
        let meta_ckpt = Checkpointer::json(self.ctx())?;
        let mut saved = Vec::new();

        for step in 1..=TOTAL_STEPS {
            self.train_step(step);
            if step % SAVE_EVERY == 0 {
                let dir = self.root.join(&format!("step_{}", step));
                state_ckpt
                    .save(&dir.join("state"), TensorTreeSaveArgs::new(self.state(step)?), false)
                    .await?;
                meta_ckpt
                    .save(
                        &dir.join("metadata"),
                        JsonSaveArgs::new(json!({
                            "step": step,
                            "world_size": self.process.process_count(),
                        })),
                        false,
                    )
                    .await?;
                saved.push(step);
            }
        }

        state_ckpt.close().await?;
        meta_ckpt.close().await;
        Ok(saved)
    }

    /// Find the newest step whose state and metadata are both committed
    async fn resume(&mut self) -> Result<Option<i64>> {
        let state_ckpt = Checkpointer::tensor_tree(self.ctx())?;
        let meta_ckpt = Checkpointer::json(self.ctx())?;

        let mut step = TOTAL_STEPS;
        while step > 0 {
            let dir = self.root.join(&format!("step_{}", step));
            let complete = state_ckpt.state(&dir.join("state")).await? == DirectoryState::Complete
                && meta_ckpt.state(&dir.join("metadata")).await? == DirectoryState::Complete;
            if complete {
                let meta = meta_ckpt.restore(&dir.join("metadata"), None).await?.into_json()?;
                assert_eq!(meta["step"], step);

                let restored = state_ckpt
                    .restore(&dir.join("state"), None)
                    .await?
                    .into_tensor_tree()?;
                match restored.get("params/w") {
                    Some(TensorTree::Leaf(w)) => {
                        self.weights = w.to_f64_vec().into_iter().map(|v| v as f32).collect();
                    }
                    other => anyhow::bail!("unexpected params/w: {:?}", other),
                }
                state_ckpt.close().await;
                return Ok(Some(step));
            }
            step -= 1;
        }
        state_ckpt.close().await;
        Ok(None)
    }
}

fn storage_root(dir: &TempDir) -> CheckpointPath {
    CheckpointPath::root(Arc::new(LocalStorage::new(dir.path())))
}

#[tokio::test]
async fn test_training_run_checkpoints_and_resumes() -> Result<()> {
    checkpoint_core::init_tracing("warn");

    let temp_dir = tempfile::tempdir()?;
    let root = storage_root(&temp_dir);
    let group = LocalProcessGroup::new(WORLD_SIZE)?;

    let mut handles = Vec::new();
    for process in group.processes() {
        let root = root.clone();
        handles.push(tokio::spawn(async move {
            let mut worker = SimulatedWorker::new(process, root);
            let saved = worker.run().await?;
            Ok::<_, anyhow::Error>((saved, worker.weights))
        }));
    }

    let mut final_weights = Vec::new();
    for handle in handles {
        let (saved, weights) = handle.await??;
        assert_eq!(saved, vec![3, 6, 9]);
        final_weights.push(weights);
    }
    assert!(final_weights.windows(2).all(|w| w[0] == w[1]));

    // Nothing is left behind in temporary directories
    for file in root.list().await? {
        assert!(!file.contains(".checkpoint-tmp"), "leftover file {}", file);
        assert!(!file.contains(".checkpoint-old"), "leftover file {}", file);
    }

    // Restart: every process resumes from the same step with the same weights
    let mut handles = Vec::new();
    for process in group.processes() {
        let root = root.clone();
        handles.push(tokio::spawn(async move {
            let mut worker = SimulatedWorker::new(process, root);
            let step = worker.resume().await?;
            Ok::<_, anyhow::Error>((step, worker.weights))
        }));
    }
    for handle in handles {
        let (step, weights) = handle.await??;
        assert_eq!(step, Some(TOTAL_STEPS));
        assert_eq!(weights, final_weights[0]);
    }

    Ok(())
}

#[tokio::test]
async fn test_resume_ignores_uncommitted_step() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let root = storage_root(&temp_dir);
    let ctx = ProcessContext::single();

    let checkpointer = Checkpointer::tensor_tree(ctx.clone())?;
    let meta = Checkpointer::json(ctx)?;
    let state = TensorTree::node().with("w", Tensor::from_f32(vec![2], &[1.0, 2.0])?.into());
    checkpointer
        .save(&root.join("step_3/state"), TensorTreeSaveArgs::new(state.clone()), false)
        .await?;
    meta.save(&root.join("step_3/metadata"), JsonSaveArgs::new(json!({"step": 3})), false)
        .await?;

    // A crash mid-save leaves only a temp directory for step 6
    root.join("step_6/state.checkpoint-tmp/_tree.json")
        .write_text("{\"type\":\"node\",\"children\":{}}")
        .await?;
    assert_eq!(
        checkpointer.state(&root.join("step_6/state")).await?,
        DirectoryState::Saving
    );

    let group = LocalProcessGroup::new(1)?;
    let mut worker = SimulatedWorker::new(group.process(0)?, root.clone());
    assert_eq!(worker.resume().await?, Some(3));
    assert_eq!(worker.weights, vec![1.0, 2.0]);

    // Casting on restore
    let restored = checkpointer
        .restore(
            &root.join("step_3/state"),
            Some(TensorTreeRestoreArgs::default().cast("w", DType::F64).into()),
        )
        .await?
        .into_tensor_tree()?;
    match restored.get("w") {
        Some(TensorTree::Leaf(w)) => assert_eq!(w.dtype(), DType::F64),
        other => anyhow::bail!("unexpected w: {:?}", other),
    }
    checkpointer.close().await;
    Ok(())
}
