//! Paused-workflow snapshots awaiting a human decision.
//!
//! A record is created when a workflow reaches an interrupt point and is then
//! either resolved exactly once or expired. `resolve` is a compare-and-swap on
//! the `awaiting` flag: of any number of concurrent callers, one wins and the
//! rest get [`PressroomError::Conflict`].

use crate::fs::{read_json, read_json_dir, record_path, write_json};
use crate::state::{StateUpdate, WorkflowState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pressroom_core::clock::{elapsed_between, system_clock, Clock};
use pressroom_core::{PressroomError, PressroomResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// A paused run waiting on a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub validation_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    /// Interrupt node to re-enter on resume.
    pub node: String,
    /// State at pause time. Cleared when the record expires.
    pub snapshot: WorkflowState,
    pub awaiting: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decision: Option<StateUpdate>,
    #[serde(default)]
    pub expired_at: Option<DateTime<Utc>>,
}

impl ValidationRecord {
    pub fn new(
        workflow_id: Uuid,
        workflow_name: impl Into<String>,
        node: impl Into<String>,
        snapshot: WorkflowState,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            validation_id: Uuid::new_v4(),
            workflow_id,
            workflow_name: workflow_name.into(),
            node: node.into(),
            snapshot,
            awaiting: true,
            created_at,
            resolved_at: None,
            decision: None,
            expired_at: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expired_at.is_some()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Still awaiting, but older than `timeout` at `now`.
    pub fn is_past_timeout(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.awaiting && elapsed_between(self.created_at, now) >= timeout
    }

    fn resolve(&mut self, decision: StateUpdate, now: DateTime<Utc>) -> PressroomResult<WorkflowState> {
        if self.is_expired() {
            return Err(PressroomError::ExpiredValidation(format!(
                "validation {} expired",
                self.validation_id
            )));
        }
        if !self.awaiting {
            return Err(PressroomError::Conflict(format!(
                "validation {} already resolved",
                self.validation_id
            )));
        }
        self.snapshot.merge(decision.clone());
        self.decision = Some(decision);
        self.awaiting = false;
        self.resolved_at = Some(now);
        Ok(self.snapshot.clone())
    }

    fn expire(&mut self, now: DateTime<Utc>) -> PressroomResult<bool> {
        if self.is_expired() {
            return Ok(false);
        }
        if self.is_resolved() {
            return Err(PressroomError::Conflict(format!(
                "validation {} already resolved",
                self.validation_id
            )));
        }
        self.awaiting = false;
        self.expired_at = Some(now);
        self.snapshot = WorkflowState::default();
        Ok(true)
    }
}

/// Storage for [`ValidationRecord`]s.
#[async_trait]
pub trait ValidationStore: Send + Sync {
    /// Store a new record. Reusing an id is a conflict.
    async fn put(&self, record: ValidationRecord) -> PressroomResult<()>;

    /// The stored record. Unknown ids are `NotFound`.
    async fn get(&self, id: Uuid) -> PressroomResult<ValidationRecord>;

    /// Atomically move an awaiting record to resolved, merging `decision`
    /// into its snapshot. Returns the merged snapshot.
    async fn resolve(&self, id: Uuid, decision: StateUpdate) -> PressroomResult<WorkflowState>;

    /// Tombstone a record. Expiring an already expired record does nothing.
    async fn expire(&self, id: Uuid) -> PressroomResult<()>;

    /// Undo a `resolve` whose follow-up write failed: store `record`, as read
    /// before the resolve, so the decision can be submitted again. Only a
    /// resolved record can be reopened.
    async fn reopen(&self, record: &ValidationRecord) -> PressroomResult<()>;

    /// Records still awaiting a decision, oldest first.
    async fn list_awaiting(&self) -> PressroomResult<Vec<ValidationRecord>>;
}

fn not_found(id: Uuid) -> PressroomError {
    PressroomError::NotFound(format!("validation {id}"))
}

fn check_reopenable(stored: &ValidationRecord, original: &ValidationRecord) -> PressroomResult<()> {
    if !stored.is_resolved() || stored.is_expired() {
        return Err(PressroomError::Conflict(format!(
            "validation {} is not resolved",
            stored.validation_id
        )));
    }
    if !original.awaiting {
        return Err(PressroomError::Validation(format!(
            "validation {} can only be reopened to an awaiting record",
            original.validation_id
        )));
    }
    Ok(())
}

fn sort_awaiting(mut records: Vec<ValidationRecord>) -> Vec<ValidationRecord> {
    records.retain(|r| r.awaiting);
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then(a.validation_id.cmp(&b.validation_id))
    });
    records
}

/// In-memory store. Compare-and-swap happens under one `parking_lot` lock.
pub struct MemoryValidationStore {
    records: Mutex<HashMap<Uuid, ValidationRecord>>,
    clock: Arc<dyn Clock>,
}

impl MemoryValidationStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryValidationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ValidationStore for MemoryValidationStore {
    async fn put(&self, record: ValidationRecord) -> PressroomResult<()> {
        let mut records = self.records.lock();
        if records.contains_key(&record.validation_id) {
            return Err(PressroomError::Conflict(format!(
                "validation {} already exists",
                record.validation_id
            )));
        }
        records.insert(record.validation_id, record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> PressroomResult<ValidationRecord> {
        self.records
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    async fn resolve(&self, id: Uuid, decision: StateUpdate) -> PressroomResult<WorkflowState> {
        let now = self.clock.now();
        let mut records = self.records.lock();
        let record = records.get_mut(&id).ok_or_else(|| not_found(id))?;
        let snapshot = record.resolve(decision, now)?;
        debug!(validation_id = %id, "Validation resolved");
        Ok(snapshot)
    }

    async fn expire(&self, id: Uuid) -> PressroomResult<()> {
        let now = self.clock.now();
        let mut records = self.records.lock();
        let record = records.get_mut(&id).ok_or_else(|| not_found(id))?;
        if record.expire(now)? {
            info!(validation_id = %id, "Validation expired");
        }
        Ok(())
    }

    async fn reopen(&self, record: &ValidationRecord) -> PressroomResult<()> {
        let id = record.validation_id;
        let mut records = self.records.lock();
        let stored = records.get_mut(&id).ok_or_else(|| not_found(id))?;
        check_reopenable(stored, record)?;
        *stored = record.clone();
        info!(validation_id = %id, "Validation reopened");
        Ok(())
    }

    async fn list_awaiting(&self) -> PressroomResult<Vec<ValidationRecord>> {
        let records: Vec<ValidationRecord> = self.records.lock().values().cloned().collect();
        Ok(sort_awaiting(records))
    }
}

/// One JSON file per record under a directory.
///
/// Writers are serialized through an async mutex, so `resolve` is a
/// compare-and-swap for every caller sharing this store. Separate processes
/// writing the same directory are not coordinated.
pub struct FileValidationStore {
    dir: PathBuf,
    writer: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl FileValidationStore {
    pub async fn open(dir: PathBuf) -> PressroomResult<Self> {
        Self::open_with_clock(dir, system_clock()).await
    }

    pub async fn open_with_clock(dir: PathBuf, clock: Arc<dyn Clock>) -> PressroomResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            writer: tokio::sync::Mutex::new(()),
            clock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn load(&self, id: Uuid) -> PressroomResult<ValidationRecord> {
        read_json(&record_path(&self.dir, id))
            .await?
            .ok_or_else(|| not_found(id))
    }
}

#[async_trait]
impl ValidationStore for FileValidationStore {
    async fn put(&self, record: ValidationRecord) -> PressroomResult<()> {
        let _writer = self.writer.lock().await;
        let path = record_path(&self.dir, record.validation_id);
        if tokio::fs::try_exists(&path).await? {
            return Err(PressroomError::Conflict(format!(
                "validation {} already exists",
                record.validation_id
            )));
        }
        write_json(&path, &record).await
    }

    async fn get(&self, id: Uuid) -> PressroomResult<ValidationRecord> {
        self.load(id).await
    }

    async fn resolve(&self, id: Uuid, decision: StateUpdate) -> PressroomResult<WorkflowState> {
        let _writer = self.writer.lock().await;
        let mut record = self.load(id).await?;
        let snapshot = record.resolve(decision, self.clock.now())?;
        write_json(&record_path(&self.dir, id), &record).await?;
        debug!(validation_id = %id, "Validation resolved");
        Ok(snapshot)
    }

    async fn expire(&self, id: Uuid) -> PressroomResult<()> {
        let _writer = self.writer.lock().await;
        let mut record = self.load(id).await?;
        if record.expire(self.clock.now())? {
            write_json(&record_path(&self.dir, id), &record).await?;
            info!(validation_id = %id, "Validation expired");
        }
        Ok(())
    }

    async fn reopen(&self, record: &ValidationRecord) -> PressroomResult<()> {
        let _writer = self.writer.lock().await;
        let id = record.validation_id;
        let stored = self.load(id).await?;
        check_reopenable(&stored, record)?;
        write_json(&record_path(&self.dir, id), record).await?;
        info!(validation_id = %id, "Validation reopened");
        Ok(())
    }

    async fn list_awaiting(&self) -> PressroomResult<Vec<ValidationRecord>> {
        Ok(sort_awaiting(read_json_dir(&self.dir).await?))
    }
}
