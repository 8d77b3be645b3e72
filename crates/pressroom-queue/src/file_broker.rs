//! Broker backend that survives restarts.
//!
//! Each task lives in `<dir>/<id>.json`, written to a temporary file and
//! renamed into place.

use crate::broker::{Broker, BrokerState, QueueCounts, TaskFilter, DEFAULT_RETRY_DELAY};
use crate::task::Task;
use async_trait::async_trait;
use pressroom_core::clock::{system_clock, Clock};
use pressroom_core::PressroomResult;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Broker persisted as one JSON file per task.
///
/// Every mutation is written to disk before the call returns, while the queue
/// lock is still held, so the files never lag behind what callers observed.
/// Reopening the same directory restores every task, including ones that were
/// Processing when the process stopped; `reclaim_expired` hands those back.
pub struct FileBroker {
    dir: PathBuf,
    state: Mutex<BrokerState>,
    clock: Arc<dyn Clock>,
    retry_delay: Duration,
}

impl FileBroker {
    /// Open `dir`, creating it if needed, and load every stored task.
    pub async fn open(dir: PathBuf) -> PressroomResult<Self> {
        Self::open_with_clock(dir, system_clock()).await
    }

    /// [`FileBroker::open`] on an explicit clock.
    pub async fn open_with_clock(dir: PathBuf, clock: Arc<dyn Clock>) -> PressroomResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let tasks = load_tasks(&dir).await?;
        info!(dir = %dir.display(), tasks = tasks.len(), "Task broker opened");
        Ok(Self {
            dir,
            state: Mutex::new(BrokerState::restore(tasks)),
            clock,
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    /// Wait applied before a failed task may be claimed again.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Directory holding the task files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn task_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    async fn persist(&self, task: &Task) -> PressroomResult<()> {
        let path = self.task_path(task.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(task)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> PressroomResult<()> {
        let path = self.task_path(id);
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }
}

async fn load_tasks(dir: &Path) -> PressroomResult<Vec<Task>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut tasks = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let data = tokio::fs::read_to_string(&path).await?;
        match serde_json::from_str::<Task>(&data) {
            Ok(task) => tasks.push(task),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable task file");
            }
        }
    }
    Ok(tasks)
}

#[async_trait]
impl Broker for FileBroker {
    async fn enqueue(&self, task: Task) -> PressroomResult<Uuid> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let stored = state.insert(task, now)?;
        if let Err(e) = self.persist(&stored).await {
            // An unsaved task was never enqueued.
            if let Err(rollback) = state.cancel(stored.id) {
                warn!(task_id = %stored.id, error = %rollback, "Failed to drop unsaved task");
            }
            return Err(e);
        }
        Ok(stored.id)
    }

    async fn dequeue_matching(&self, eligible: TaskFilter<'_>) -> PressroomResult<Option<Task>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let claimed = state.claim(eligible, now)?;
        if let Some(task) = &claimed {
            self.persist(task).await?;
        }
        Ok(claimed)
    }

    async fn ack(&self, id: Uuid, result: Value) -> PressroomResult<Task> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state.ack(id, result, now)?;
        self.persist(&task).await?;
        Ok(task)
    }

    async fn fail(&self, id: Uuid, error: &str) -> PressroomResult<Task> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state.fail(id, error, now, self.retry_delay)?;
        self.persist(&task).await?;
        Ok(task)
    }

    async fn abandon(&self, id: Uuid, error: &str) -> PressroomResult<Task> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let task = state.abandon(id, error, now)?;
        self.persist(&task).await?;
        Ok(task)
    }

    async fn reclaim_expired(&self, visibility_timeout: Duration) -> PressroomResult<Vec<Uuid>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let reclaimed = state.reclaim_expired(visibility_timeout, now, self.retry_delay)?;
        for task in &reclaimed {
            self.persist(task).await?;
        }
        Ok(reclaimed.into_iter().map(|t| t.id).collect())
    }

    async fn cancel(&self, id: Uuid) -> PressroomResult<Task> {
        let mut state = self.state.lock().await;
        let task = state.cancel(id)?;
        self.remove(id).await?;
        Ok(task)
    }

    async fn get(&self, id: Uuid) -> PressroomResult<Task> {
        self.state.lock().await.get(id)
    }

    async fn find(&self, predicate: TaskFilter<'_>) -> PressroomResult<Vec<Task>> {
        Ok(self.state.lock().await.find(predicate))
    }

    async fn counts(&self) -> PressroomResult<QueueCounts> {
        Ok(self.state.lock().await.counts())
    }
}

impl std::fmt::Debug for FileBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBroker").field("dir", &self.dir).finish()
    }
}
