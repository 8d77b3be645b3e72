//! Admission control for periodic collection jobs.
//!
//! The manager sits between the scheduler and the broker. Jobs are always
//! queued; the ceiling and the per-source rate limit only decide when a queued
//! job may start.

use crate::broker::Broker;
use crate::rate_limit::IntervalLimiter;
use crate::scheduler::{JobSink, ScheduledSource};
use crate::task::{Task, TaskDefaults};
use async_trait::async_trait;
use pressroom_core::clock::{system_clock, Clock};
use pressroom_core::config::QueueConfig;
use pressroom_core::{DedupPolicy, PressroomError, PressroomResult, TaskKind};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Admission settings.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Collection jobs Processing at once, across all sources.
    pub max_concurrent: usize,
    /// Minimum spacing between two starts for the same source.
    pub rate_limit: Duration,
    pub dedup: DedupPolicy,
    pub defaults: TaskDefaults,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for AdmissionConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            rate_limit: config.rate_limit(),
            dedup: config.dedup,
            defaults: TaskDefaults::from(config),
        }
    }
}

struct Admission {
    in_flight: HashSet<Uuid>,
    limiter: IntervalLimiter,
}

/// Concurrency ceiling, per-source rate limit and optional de-duplication in
/// front of a [`Broker`].
pub struct QueueManager {
    broker: Arc<dyn Broker>,
    config: AdmissionConfig,
    clock: Arc<dyn Clock>,
    admission: Mutex<Admission>,
}

impl QueueManager {
    pub fn new(broker: Arc<dyn Broker>, config: AdmissionConfig) -> Self {
        Self::with_clock(broker, config, system_clock())
    }

    pub fn with_clock(
        broker: Arc<dyn Broker>,
        config: AdmissionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = IntervalLimiter::new(config.rate_limit);
        Self {
            broker,
            config,
            clock,
            admission: Mutex::new(Admission {
                in_flight: HashSet::new(),
                limiter,
            }),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Queue one collection job for `source`.
    ///
    /// Returns `None` when the dedup policy is `drop` and a job for the source
    /// is already Pending or Processing.
    pub async fn queue_collection_job(
        &self,
        source: &str,
        priority: Option<i32>,
    ) -> PressroomResult<Option<Uuid>> {
        let _admission = self.admission.lock().await;

        if self.config.dedup != DedupPolicy::Allow && self.has_active_job(source).await? {
            match self.config.dedup {
                DedupPolicy::Drop => {
                    debug!(source = %source, "Job already queued, dropping request");
                    return Ok(None);
                }
                DedupPolicy::Reject => {
                    return Err(PressroomError::CapacityExceeded(format!(
                        "a job for source '{source}' is already queued"
                    )));
                }
                DedupPolicy::Allow => {}
            }
        }

        let task = Task::collection(source)
            .with_priority(priority.unwrap_or(self.config.defaults.priority))
            .with_max_retries(self.config.defaults.max_retries);
        let id = self.broker.enqueue(task).await?;
        info!(task_id = %id, source = %source, "Collection job queued");
        Ok(Some(id))
    }

    async fn has_active_job(&self, source: &str) -> PressroomResult<bool> {
        let active = self
            .broker
            .find(&|t: &Task| {
                t.kind == TaskKind::Collection
                    && t.source_key.as_deref() == Some(source)
                    && t.is_active()
            })
            .await?;
        Ok(!active.is_empty())
    }

    /// Claim the next job allowed to start now.
    ///
    /// Returns `None` when the ceiling is reached or every queued source is
    /// still inside its rate-limit window.
    pub async fn acquire(&self) -> PressroomResult<Option<Task>> {
        let mut guard = self.admission.lock().await;
        let admission = &mut *guard;
        if admission.in_flight.len() >= self.config.max_concurrent {
            debug!(
                in_flight = admission.in_flight.len(),
                max_concurrent = self.config.max_concurrent,
                "Concurrency ceiling reached"
            );
            return Ok(None);
        }

        let now = self.clock.now();
        let limiter = &admission.limiter;
        let eligible = move |t: &Task| {
            t.kind == TaskKind::Collection
                && t.source_key
                    .as_deref()
                    .is_some_and(|key| limiter.is_ready(key, now))
        };
        let claimed = self.broker.dequeue_matching(&eligible).await?;

        if let Some(task) = &claimed {
            let source = task.source_key.as_deref().unwrap_or_default();
            admission.limiter.record(source, now);
            admission.in_flight.insert(task.id);
            info!(
                task_id = %task.id,
                source = %source,
                in_flight = admission.in_flight.len(),
                "Collection job started"
            );
        }
        Ok(claimed)
    }

    /// Acknowledge a job and free its slot.
    pub async fn complete(&self, id: Uuid, result: Value) -> PressroomResult<Task> {
        let outcome = self.broker.ack(id, result).await;
        self.release(id).await;
        outcome
    }

    /// Report a failed attempt and free its slot. The broker decides between
    /// requeue and permanent failure.
    pub async fn fail(&self, id: Uuid, error: &str) -> PressroomResult<Task> {
        let outcome = self.broker.fail(id, error).await;
        self.release(id).await;
        outcome
    }

    /// Fail a job without retry and free its slot.
    pub async fn abandon(&self, id: Uuid, error: &str) -> PressroomResult<Task> {
        let outcome = self.broker.abandon(id, error).await;
        self.release(id).await;
        outcome
    }

    /// Hand stale claims back to the broker and free their slots.
    pub async fn reclaim_expired(&self, visibility_timeout: Duration) -> PressroomResult<Vec<Uuid>> {
        let reclaimed = self.broker.reclaim_expired(visibility_timeout).await?;
        let mut admission = self.admission.lock().await;
        for id in &reclaimed {
            admission.in_flight.remove(id);
        }
        let idle_after = self.config.rate_limit.max(visibility_timeout);
        admission.limiter.cleanup(idle_after, self.clock.now());
        Ok(reclaimed)
    }

    async fn release(&self, id: Uuid) {
        let mut admission = self.admission.lock().await;
        if admission.in_flight.remove(&id) {
            debug!(task_id = %id, in_flight = admission.in_flight.len(), "Slot released");
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.admission.lock().await.in_flight.len()
    }

    /// Time before `source` may start another job. Zero when it may start now.
    pub async fn time_until_eligible(&self, source: &str) -> Duration {
        let now = self.clock.now();
        self.admission.lock().await.limiter.wait_time(source, now)
    }
}

#[async_trait]
impl JobSink for QueueManager {
    async fn submit(&self, source: &ScheduledSource) -> PressroomResult<Option<Uuid>> {
        self.queue_collection_job(&source.key, None).await
    }
}
