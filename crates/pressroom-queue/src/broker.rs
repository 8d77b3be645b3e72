//! Task broker: the queue every worker pulls from.
//!
//! A broker hands each task to at most one worker at a time. Claiming,
//! acknowledging and failing all happen under one lock, so two concurrent
//! `dequeue` calls can never receive the same task.

use crate::task::{Task, TaskStatus, TaskStatusReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pressroom_core::clock::{elapsed_between, system_clock, to_chrono, Clock};
use pressroom_core::{PressroomError, PressroomResult};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Wait applied after a retryable failure unless the broker is told otherwise.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Predicate used to pick eligible tasks.
pub type TaskFilter<'a> = &'a (dyn Fn(&Task) -> bool + Send + Sync);

/// Durable queue of [`Task`]s with retry-aware acknowledgement.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Store a new Pending task. Fails with a validation error on a malformed
    /// payload or a reused id.
    async fn enqueue(&self, task: Task) -> PressroomResult<Uuid>;

    /// Claim the highest-priority Pending task, oldest first on ties.
    async fn dequeue(&self) -> PressroomResult<Option<Task>> {
        self.dequeue_matching(&|_: &Task| true).await
    }

    /// Claim the best Pending task accepted by `eligible`. Rejected tasks stay
    /// Pending.
    async fn dequeue_matching(&self, eligible: TaskFilter<'_>) -> PressroomResult<Option<Task>>;

    /// Mark a Processing task Completed. Acknowledging an already Completed
    /// task returns it unchanged.
    async fn ack(&self, id: Uuid, result: Value) -> PressroomResult<Task>;

    /// Report a failed attempt. Requeues while the retry budget lasts, then
    /// fails permanently. A requeued task is not claimable again until the
    /// broker's retry delay has passed. A task that is no longer Processing is
    /// returned unchanged.
    async fn fail(&self, id: Uuid, error: &str) -> PressroomResult<Task>;

    /// Fail a Processing task permanently, skipping the retry budget.
    async fn abandon(&self, id: Uuid, error: &str) -> PressroomResult<Task>;

    /// Send Processing tasks claimed longer than `visibility_timeout` ago
    /// through the retry path. Returns the ids that were reclaimed.
    async fn reclaim_expired(&self, visibility_timeout: Duration) -> PressroomResult<Vec<Uuid>>;

    /// Remove a task that has not been claimed yet.
    async fn cancel(&self, id: Uuid) -> PressroomResult<Task>;

    /// The stored task. Unknown ids are `NotFound`.
    async fn get(&self, id: Uuid) -> PressroomResult<Task>;

    /// Status view of one task.
    async fn status(&self, id: Uuid) -> PressroomResult<TaskStatusReport> {
        Ok(self.get(id).await?.report())
    }

    /// All tasks accepted by `predicate`, oldest first.
    async fn find(&self, predicate: TaskFilter<'_>) -> PressroomResult<Vec<Task>>;

    /// Number of tasks per status.
    async fn counts(&self) -> PressroomResult<QueueCounts>;
}

/// Number of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Pending, including tasks waiting out a retry delay.
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    /// Sum over every status.
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

struct Entry {
    task: Task,
    seq: u64,
}

/// In-memory queue state shared by every broker backend.
#[derive(Default)]
pub(crate) struct BrokerState {
    tasks: HashMap<Uuid, Entry>,
    next_seq: u64,
}

impl BrokerState {
    pub(crate) fn restore(mut tasks: Vec<Task>) -> Self {
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let mut state = Self::default();
        for task in tasks {
            let seq = state.bump_seq();
            state.tasks.insert(task.id, Entry { task, seq });
        }
        state
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn entry_mut(&mut self, id: Uuid) -> PressroomResult<&mut Entry> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| PressroomError::NotFound(format!("task {id}")))
    }

    pub(crate) fn insert(&mut self, mut task: Task, now: DateTime<Utc>) -> PressroomResult<Task> {
        task.validate()?;
        if task.status != TaskStatus::Pending {
            return Err(PressroomError::Validation(format!(
                "new tasks must be pending, got {}",
                task.status
            )));
        }
        if self.tasks.contains_key(&task.id) {
            return Err(PressroomError::Validation(format!(
                "task id {} already used",
                task.id
            )));
        }
        task.created_at = now;
        task.started_at = None;
        task.completed_at = None;
        task.not_before = None;

        let seq = self.bump_seq();
        info!(
            task_id = %task.id,
            kind = %task.kind,
            priority = task.priority,
            "Task enqueued"
        );
        self.tasks.insert(
            task.id,
            Entry {
                task: task.clone(),
                seq,
            },
        );
        Ok(task)
    }

    pub(crate) fn claim(
        &mut self,
        eligible: TaskFilter<'_>,
        now: DateTime<Utc>,
    ) -> PressroomResult<Option<Task>> {
        let chosen = self
            .tasks
            .values()
            .filter(|e| {
                e.task.status == TaskStatus::Pending && e.task.is_due(now) && eligible(&e.task)
            })
            .max_by_key(|e| (e.task.priority, Reverse(e.task.created_at), Reverse(e.seq)))
            .map(|e| e.task.id);

        let Some(id) = chosen else {
            return Ok(None);
        };
        let entry = self.entry_mut(id)?;
        entry.task.transition(TaskStatus::Processing)?;
        entry.task.started_at = Some(now);
        debug!(task_id = %id, attempt = entry.task.retry_count + 1, "Task claimed");
        Ok(Some(entry.task.clone()))
    }

    pub(crate) fn ack(&mut self, id: Uuid, result: Value, now: DateTime<Utc>) -> PressroomResult<Task> {
        let entry = self.entry_mut(id)?;
        if entry.task.status == TaskStatus::Completed {
            debug!(task_id = %id, "Duplicate ack ignored");
            return Ok(entry.task.clone());
        }
        entry.task.transition(TaskStatus::Completed)?;
        entry.task.completed_at = Some(now);
        entry.task.result = Some(result);
        entry.task.error = None;
        info!(task_id = %id, retries = entry.task.retry_count, "Task completed");
        Ok(entry.task.clone())
    }

    pub(crate) fn fail(
        &mut self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
        retry_delay: Duration,
    ) -> PressroomResult<Task> {
        let entry = self.entry_mut(id)?;
        let task = &mut entry.task;
        match task.status {
            TaskStatus::Processing => {}
            TaskStatus::Completed => {
                return Err(PressroomError::InvalidTransition {
                    task_id: id.to_string(),
                    from: task.status.to_string(),
                    to: TaskStatus::Failed.to_string(),
                })
            }
            _ => {
                debug!(task_id = %id, status = %task.status, "Duplicate failure report ignored");
                return Ok(task.clone());
            }
        }

        task.error = Some(error.to_string());
        if task.retry_count < task.max_retries {
            task.transition(TaskStatus::Retry)?;
            task.retry_count += 1;
            task.transition(TaskStatus::Pending)?;
            task.started_at = None;
            task.not_before = now.checked_add_signed(to_chrono(retry_delay));
            warn!(
                task_id = %id,
                attempt = task.retry_count,
                max_retries = task.max_retries,
                retry_in_secs = retry_delay.as_secs(),
                error = %error,
                "Task failed, requeued for retry"
            );
        } else {
            task.transition(TaskStatus::Failed)?;
            task.completed_at = Some(now);
            warn!(
                task_id = %id,
                retries = task.retry_count,
                error = %error,
                "Task failed permanently, retries exhausted"
            );
        }
        Ok(task.clone())
    }

    pub(crate) fn abandon(
        &mut self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> PressroomResult<Task> {
        let entry = self.entry_mut(id)?;
        let task = &mut entry.task;
        if task.status == TaskStatus::Failed {
            return Ok(task.clone());
        }
        task.transition(TaskStatus::Failed)?;
        task.error = Some(error.to_string());
        task.completed_at = Some(now);
        warn!(task_id = %id, error = %error, "Task failed permanently, not retryable");
        Ok(task.clone())
    }

    pub(crate) fn reclaim_expired(
        &mut self,
        visibility_timeout: Duration,
        now: DateTime<Utc>,
        retry_delay: Duration,
    ) -> PressroomResult<Vec<Task>> {
        let stale: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|e| e.task.status == TaskStatus::Processing)
            .filter(|e| {
                e.task
                    .started_at
                    .is_some_and(|started| elapsed_between(started, now) >= visibility_timeout)
            })
            .map(|e| e.task.id)
            .collect();

        let reason = format!(
            "visibility timeout expired after {}s",
            visibility_timeout.as_secs()
        );
        stale
            .into_iter()
            .map(|id| self.fail(id, &reason, now, retry_delay))
            .collect()
    }

    pub(crate) fn cancel(&mut self, id: Uuid) -> PressroomResult<Task> {
        let entry = self.entry_mut(id)?;
        if entry.task.status != TaskStatus::Pending {
            return Err(PressroomError::Conflict(format!(
                "task {id} is {}; only pending tasks can be cancelled",
                entry.task.status
            )));
        }
        let removed = self
            .tasks
            .remove(&id)
            .map(|e| e.task)
            .ok_or_else(|| PressroomError::NotFound(format!("task {id}")))?;
        info!(task_id = %id, "Task cancelled");
        Ok(removed)
    }

    pub(crate) fn get(&self, id: Uuid) -> PressroomResult<Task> {
        self.tasks
            .get(&id)
            .map(|e| e.task.clone())
            .ok_or_else(|| PressroomError::NotFound(format!("task {id}")))
    }

    pub(crate) fn find(&self, predicate: TaskFilter<'_>) -> Vec<Task> {
        let mut entries: Vec<&Entry> = self
            .tasks
            .values()
            .filter(|e| predicate(&e.task))
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.task.clone()).collect()
    }

    pub(crate) fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for entry in self.tasks.values() {
            match entry.task.status {
                TaskStatus::Pending | TaskStatus::Retry => counts.pending += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

/// Broker that keeps everything in process memory.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    clock: Arc<dyn Clock>,
    retry_delay: Duration,
}

impl MemoryBroker {
    /// Empty broker on the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Empty broker on `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            clock,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Wait applied before a failed task may be claimed again.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, task: Task) -> PressroomResult<Uuid> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.insert(task, now)?.id)
    }

    async fn dequeue_matching(&self, eligible: TaskFilter<'_>) -> PressroomResult<Option<Task>> {
        let now = self.clock.now();
        self.state.lock().await.claim(eligible, now)
    }

    async fn ack(&self, id: Uuid, result: Value) -> PressroomResult<Task> {
        let now = self.clock.now();
        self.state.lock().await.ack(id, result, now)
    }

    async fn fail(&self, id: Uuid, error: &str) -> PressroomResult<Task> {
        let now = self.clock.now();
        self.state
            .lock()
            .await
            .fail(id, error, now, self.retry_delay)
    }

    async fn abandon(&self, id: Uuid, error: &str) -> PressroomResult<Task> {
        let now = self.clock.now();
        self.state.lock().await.abandon(id, error, now)
    }

    async fn reclaim_expired(&self, visibility_timeout: Duration) -> PressroomResult<Vec<Uuid>> {
        let now = self.clock.now();
        let reclaimed = self
            .state
            .lock()
            .await
            .reclaim_expired(visibility_timeout, now, self.retry_delay)?;
        Ok(reclaimed.into_iter().map(|t| t.id).collect())
    }

    async fn cancel(&self, id: Uuid) -> PressroomResult<Task> {
        self.state.lock().await.cancel(id)
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
