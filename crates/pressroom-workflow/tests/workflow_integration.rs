//! Workflow integration tests: concurrent resolution, and pause/resume across
//! an engine restart with file-backed stores.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use pressroom_core::PressroomError;
use pressroom_workflow::*;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

fn draft_graph() -> WorkflowGraph {
    GraphBuilder::new("draft_review")
        .add_node(
            "write",
            node_fn(|state| {
                let topic = state.get_str("topic").unwrap_or("untitled").to_string();
                let mut update = StateUpdate::new();
                update.insert("draft".into(), json!(format!("Draft about {topic}")));
                Ok(update)
            }),
        )
        .add_interrupt_node(
            "review",
            node_fn(|state| {
                let mut update = StateUpdate::new();
                update.insert(
                    "reviewed_by".into(),
                    state.get("editor").cloned().unwrap_or(json!("unknown")),
                );
                Ok(update)
            }),
        )
        .add_node(
            "finalize",
            node_fn(|_| {
                let mut update = StateUpdate::new();
                update.insert("final".into(), json!(true));
                Ok(update)
            }),
        )
        .add_edge("write", Target::node("review"))
        .add_edge("review", Target::node("finalize"))
        .add_edge("finalize", Target::End)
        .set_entry("write")
        .build()
        .unwrap()
}

async fn file_engine(root: &Path) -> WorkflowEngine {
    let checkpoints = FileCheckpointStore::open(root.join("checkpoints"))
        .await
        .unwrap();
    let validations = FileValidationStore::open(root.join("validations"))
        .await
        .unwrap();
    let mut engine = WorkflowEngine::new(
        Arc::new(checkpoints),
        Arc::new(validations),
        EngineConfig::default(),
    );
    engine.register(draft_graph()).unwrap();
    engine
}

fn decision(editor: &str) -> StateUpdate {
    let mut update = StateUpdate::new();
    update.insert("editor".into(), json!(editor));
    update
}

#[tokio::test]
async fn test_concurrent_resolve_single_winner() {
    let store = Arc::new(MemoryValidationStore::new());
    let record = ValidationRecord::new(
        uuid::Uuid::new_v4(),
        "draft_review",
        "review",
        WorkflowState::new().with("draft", "text"),
        chrono::Utc::now(),
    );
    let id = record.validation_id;
    store.put(record).await.unwrap();

    let mut handles = Vec::new();
    for editor in ["ana", "bruno", "carla", "dario"] {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            (editor, store.resolve(id, decision(editor)).await)
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        let (editor, result) = handle.await.unwrap();
        match result {
            Ok(_) => winners.push(editor),
            Err(e) => assert!(matches!(e, PressroomError::Conflict(_))),
        }
    }
    assert_eq!(winners.len(), 1);
    let stored = store.get(id).await.unwrap();
    assert_eq!(stored.snapshot.get_str("editor"), Some(winners[0]));
}

#[tokio::test]
async fn test_concurrent_file_resume_single_winner() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = Arc::new(file_engine(tmp.path()).await);
    let paused = engine
        .start("draft_review", WorkflowState::new().with("topic", "worlds"))
        .await
        .unwrap();
    let id = paused.next_validation_id.unwrap();

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.resume(id, decision("ana")).await })
    };
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.resume(id, decision("bruno")).await })
    };
    let results = [first.await.unwrap(), second.await.unwrap()];

    let completed: Vec<&WorkflowOutcome> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].status, WorkflowStatus::Completed);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(matches!(loser, PressroomError::Conflict(_)));
}

#[tokio::test]
async fn test_resume_after_restart() {
    let tmp = tempfile::tempdir().unwrap();

    let (workflow_id, validation_id) = {
        let engine = file_engine(tmp.path()).await;
        let paused = engine
            .start("draft_review", WorkflowState::new().with("topic", "msi"))
            .await
            .unwrap();
        assert_eq!(paused.status, WorkflowStatus::AwaitingValidation);
        assert_eq!(paused.state.get_str("draft"), Some("Draft about msi"));
        (paused.workflow_id, paused.next_validation_id.unwrap())
    };

    let engine = file_engine(tmp.path()).await;
    let pending = engine.pending_validations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].workflow_id, workflow_id);

    let done = engine.resume(validation_id, decision("ana")).await.unwrap();
    assert_eq!(done.workflow_id, workflow_id);
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(done.state.get_str("reviewed_by"), Some("ana"));
    assert_eq!(done.state.get("final"), Some(&json!(true)));

    let listed = engine.list_workflows().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, WorkflowStatus::Completed);
    assert!(engine.pending_validations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_persisted_snapshot_matches_pause_state() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = file_engine(tmp.path()).await;
    let initial = WorkflowState::new()
        .with("topic", "lck")
        .with("tags", json!(["esports", "korea"]))
        .with("word_count", 800);
    let paused = engine.start("draft_review", initial).await.unwrap();

    let store = FileValidationStore::open(tmp.path().join("validations"))
        .await
        .unwrap();
    let record = store.get(paused.next_validation_id.unwrap()).await.unwrap();
    assert_eq!(record.snapshot, paused.state);
    assert_eq!(record.node, "review");
    assert_eq!(record.workflow_name, "draft_review");
}
