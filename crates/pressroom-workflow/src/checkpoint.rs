//! Persisted progress of workflow runs.
//!
//! A checkpoint is saved after every node, so a run can be inspected, resumed
//! or cancelled from any process sharing the store.

use crate::fs::{read_json, read_json_dir, record_path, remove_json, write_json};
use crate::state::WorkflowState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pressroom_core::{PressroomError, PressroomResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    AwaitingValidation,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::AwaitingValidation => "awaiting_validation",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted progress of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub state: WorkflowState,
    /// Node to run next, or the node that failed.
    #[serde(default)]
    pub next_node: Option<String>,
    #[serde(default)]
    pub pending_validation: Option<Uuid>,
    /// Node executions so far.
    pub steps: usize,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        workflow_name: impl Into<String>,
        state: WorkflowState,
        entry: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow_id: Uuid::new_v4(),
            workflow_name: workflow_name.into(),
            status: WorkflowStatus::Running,
            state,
            next_node: Some(entry.into()),
            pending_validation: None,
            steps: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Insert or overwrite the checkpoint for its workflow id.
    async fn save(&self, checkpoint: &Checkpoint) -> PressroomResult<()>;
    async fn load(&self, workflow_id: Uuid) -> PressroomResult<Checkpoint>;
    /// Returns whether a checkpoint was removed.
    async fn delete(&self, workflow_id: Uuid) -> PressroomResult<bool>;
    /// All checkpoints, oldest first.
    async fn list(&self) -> PressroomResult<Vec<Checkpoint>>;
}

fn not_found(id: Uuid) -> PressroomError {
    PressroomError::NotFound(format!("workflow {id}"))
}

fn oldest_first(mut checkpoints: Vec<Checkpoint>) -> Vec<Checkpoint> {
    checkpoints.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then(a.workflow_id.cmp(&b.workflow_id))
    });
    checkpoints
}

#[derive(Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<Uuid, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> PressroomResult<()> {
        self.checkpoints
            .lock()
            .insert(checkpoint.workflow_id, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, workflow_id: Uuid) -> PressroomResult<Checkpoint> {
        self.checkpoints
            .lock()
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| not_found(workflow_id))
    }

    async fn delete(&self, workflow_id: Uuid) -> PressroomResult<bool> {
        Ok(self.checkpoints.lock().remove(&workflow_id).is_some())
    }

    async fn list(&self) -> PressroomResult<Vec<Checkpoint>> {
        let all = self.checkpoints.lock().values().cloned().collect();
        Ok(oldest_first(all))
    }
}

/// Checkpoints as `<dir>/<workflow_id>.json`.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub async fn open(dir: PathBuf) -> PressroomResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> PressroomResult<()> {
        write_json(&record_path(&self.dir, checkpoint.workflow_id), checkpoint).await
    }

    async fn load(&self, workflow_id: Uuid) -> PressroomResult<Checkpoint> {
        read_json(&record_path(&self.dir, workflow_id))
            .await?
            .ok_or_else(|| not_found(workflow_id))
    }

    async fn delete(&self, workflow_id: Uuid) -> PressroomResult<bool> {
        remove_json(&record_path(&self.dir, workflow_id)).await
    }

    async fn list(&self) -> PressroomResult<Vec<Checkpoint>> {
        Ok(oldest_first(read_json_dir(&self.dir).await?))
    }
}
