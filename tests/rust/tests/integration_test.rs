use anyhow::Result;
use checkpoint::{
    AsyncCheckpointer, Checkpointer, JsonCheckpointHandler, JsonSaveArgs, ProtoRestoreArgs,
    ProtoSaveArgs,
};
use checkpoint_core::{
    CheckpointerConfig, Error, ErrorKind, LocalProcessGroup, ProcessContext, COMMIT_MARKER_FILE,
};
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, Value};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use storage::{CheckpointPath, LocalStorage};

fn storage_root(dir: &tempfile::TempDir) -> CheckpointPath {
    CheckpointPath::root(Arc::new(LocalStorage::new(dir.path())))
}

fn trainer_state_descriptor() -> Result<MessageDescriptor> {
    let field = |name: &str, number: i32, ty: Type| FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(ty as i32),
        json_name: Some(name.to_string()),
        ..Default::default()
    };
    let file = FileDescriptorProto {
        name: Some("trainer_state.proto".to_string()),
        package: Some("trainer".to_string()),
        message_type: vec![DescriptorProto {
            name: Some("TrainerState".to_string()),
            field: vec![
                field("experiment", 1, Type::String),
                field("global_step", 2, Type::Int64),
            ],
            ..Default::default()
        }],
        syntax: Some("proto3".to_string()),
        ..Default::default()
    };
    let pool = DescriptorPool::from_file_descriptor_set(FileDescriptorSet { file: vec![file] })?;
    pool.get_message_by_name("trainer.TrainerState")
        .ok_or_else(|| anyhow::anyhow!("TrainerState missing from pool"))
}

#[tokio::test]
async fn test_json_overwrite_guard() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let ckpt = storage_root(&temp_dir).join("ckpt");
    let checkpointer = Checkpointer::json(ProcessContext::single())?;

    checkpointer
        .save(&ckpt, JsonSaveArgs::new(json!({"step": 3, "loss": 0.12})), false)
        .await?;
    assert_eq!(
        checkpointer.restore(&ckpt, None).await?.into_json()?,
        json!({"step": 3, "loss": 0.12})
    );

    let err = checkpointer
        .save(&ckpt, JsonSaveArgs::new(json!({"step": 4})), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OverwriteConflict);
    assert_eq!(
        checkpointer.restore(&ckpt, None).await?.into_json()?,
        json!({"step": 3, "loss": 0.12})
    );

    checkpointer
        .save(&ckpt, JsonSaveArgs::new(json!({"step": 4})), true)
        .await?;
    assert_eq!(
        checkpointer.restore(&ckpt, None).await?.into_json()?,
        json!({"step": 4})
    );
    Ok(())
}

#[tokio::test]
async fn test_overwrite_conflict_is_reported_on_every_process() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let root = storage_root(&temp_dir);
    let group = LocalProcessGroup::new(3)?;

    let mut handles = Vec::new();
    for process in group.processes() {
        let ckpt = root.join("ckpt");
        handles.push(tokio::spawn(async move {
            let checkpointer = Checkpointer::json(ProcessContext::local(process))?;
            checkpointer
                .save(&ckpt, JsonSaveArgs::new(json!({"step": 1})), false)
                .await?;
            let second = checkpointer
                .save(&ckpt, JsonSaveArgs::new(json!({"step": 2})), false)
                .await;
            let restored = checkpointer.restore(&ckpt, None).await?.into_json()?;
            Ok::<_, Error>((second, restored))
        }));
    }

    for handle in handles {
        let (second, restored) = handle.await??;
        assert!(matches!(second, Err(Error::CheckpointExists { .. })));
        assert_eq!(restored, json!({"step": 1}));
    }
    Ok(())
}

#[tokio::test]
async fn test_force_overwrite_across_processes() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let root = storage_root(&temp_dir);
    let group = LocalProcessGroup::new(4)?;

    let mut handles = Vec::new();
    for process in group.processes() {
        let ckpt = root.join("ckpt");
        handles.push(tokio::spawn(async move {
            let checkpointer = Checkpointer::json(ProcessContext::local(process))?;
            checkpointer
                .save(&ckpt, JsonSaveArgs::new(json!({"step": 1})), false)
                .await?;
            checkpointer
                .save(&ckpt, JsonSaveArgs::new(json!({"step": 2, "lr": 0.01})), true)
                .await?;
            let restored = checkpointer.restore(&ckpt, None).await?.into_json()?;
            Ok::<_, Error>(restored)
        }));
    }

    for handle in handles {
        assert_eq!(handle.await??, json!({"step": 2, "lr": 0.01}));
    }

    let ckpt = root.join("ckpt");
    assert!(ckpt.join(COMMIT_MARKER_FILE).exists().await?);
    assert!(!ckpt.with_suffix(".checkpoint-old").exists().await?);
    assert!(!ckpt.with_suffix(".checkpoint-tmp").exists().await?);
    Ok(())
}

#[tokio::test]
async fn test_non_primary_processes_write_nothing() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let group = LocalProcessGroup::new(2)?;

    // Only process 1 runs; its writes are suppressed, so with no barrier
    // partner it must not create anything before the first barrier times out.
    let ctx = ProcessContext::local(group.process(1)?);
    let handler = JsonCheckpointHandler::new(Arc::clone(&ctx.rank));
    let config = CheckpointerConfig {
        barrier_timeout: Some(Duration::from_millis(50)),
        ..Default::default()
    };
    let checkpointer = Checkpointer::with_config(
        Arc::new(handler),
        ctx,
        config,
        checkpoint::ArgsRegistry::standard(),
    )?;

    let err = checkpointer
        .save(
            &storage_root(&temp_dir).join("ckpt"),
            JsonSaveArgs::new(json!({"step": 1})),
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BarrierTimeout { .. }));
    assert_eq!(std::fs::read_dir(temp_dir.path())?.count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_async_proto_checkpoint_across_processes() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let root = storage_root(&temp_dir);
    let group = LocalProcessGroup::new(2)?;
    let descriptor = trainer_state_descriptor()?;

    let mut handles = Vec::new();
    for process in group.processes() {
        let ckpt = root.join("trainer");
        let descriptor = descriptor.clone();
        handles.push(tokio::spawn(async move {
            let checkpointer = AsyncCheckpointer::proto("trainer_state.pbtxt", ProcessContext::local(process))?;

            let mut message = DynamicMessage::new(descriptor.clone());
            message.set_field_by_name("experiment", Value::String("sweep-7".to_string()));
            message.set_field_by_name("global_step", Value::I64(1200));

            checkpointer
                .save(&ckpt, ProtoSaveArgs::new(message.clone()), false)
                .await?;
            checkpointer.wait_until_finished().await?;

            let err = checkpointer.restore(&ckpt, None).await.unwrap_err();
            assert!(matches!(err, Error::MissingRestoreHint { .. }));

            let restored = checkpointer
                .restore(&ckpt, Some(ProtoRestoreArgs::new(descriptor).into()))
                .await?
                .into_proto()?;
            checkpointer.close().await?;
            Ok::<_, Error>((message, restored))
        }));
    }

    for handle in handles {
        let (saved, restored) = handle.await??;
        assert_eq!(saved, restored);
    }

    let ckpt = root.join("trainer");
    assert!(ckpt.join(COMMIT_MARKER_FILE).exists().await?);
    let text = ckpt.join("trainer_state.pbtxt").read_text().await?;
    assert!(text.contains("sweep-7"));
    Ok(())
}

#[tokio::test]
async fn test_restore_not_found_for_any_path() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let root = storage_root(&temp_dir);
    let checkpointer = Checkpointer::json(ProcessContext::single())?;

    for path in ["never_saved", "deep/nested/path", "ckpt.checkpoint-old"] {
        let err = checkpointer.restore(&root.join(path), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound, "path {}", path);
    }
    Ok(())
}
