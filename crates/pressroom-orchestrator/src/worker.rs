//! Queue consumers.
//!
//! Workers settle every task they claim according to the error class:
//! success acks, retryable errors go through the broker's retry path, and
//! anything else fails the task without retry.

use crate::router::CommunicationRouter;
use async_trait::async_trait;
use pressroom_core::{PressroomError, PressroomResult, TaskKind};
use pressroom_queue::{Broker, QueueManager, Task};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Narrow contract for the external source scrapers.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Collect new items for one source. The returned value becomes the
    /// task result.
    async fn collect(&self, source_key: &str) -> PressroomResult<Value>;
}

/// Collector used when no scraper is wired in. Logs the run and reports an
/// empty batch, so scheduled jobs still settle instead of piling up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCollector;

#[async_trait]
impl Collector for NullCollector {
    async fn collect(&self, source_key: &str) -> PressroomResult<Value> {
        debug!(source = %source_key, "No collector configured for source");
        Ok(serde_json::json!({ "source": source_key, "items": 0 }))
    }
}

/// How a claimed task was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledged with the handler's result.
    Completed,
    /// Failed with a retryable error; the broker decided between requeue
    /// and permanent failure.
    Retried,
    /// Failed permanently without touching the retry budget.
    Abandoned,
}

fn classify(outcome: &PressroomResult<Value>) -> Settlement {
    match outcome {
        Ok(_) => Settlement::Completed,
        Err(e) if e.is_retryable() => Settlement::Retried,
        Err(_) => Settlement::Abandoned,
    }
}

/// Wait for `idle` or a shutdown signal. Returns `true` on shutdown.
async fn idle_or_shutdown(shutdown: &mut watch::Receiver<bool>, idle: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(idle) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

/// Pulls agent tasks from the broker and dispatches them through the router.
/// Collection jobs are left for [`CollectionWorker`].
pub struct TaskWorker {
    broker: Arc<dyn Broker>,
    router: Arc<CommunicationRouter>,
}

impl TaskWorker {
    /// Worker over `broker`, dispatching through `router`.
    pub fn new(broker: Arc<dyn Broker>, router: Arc<CommunicationRouter>) -> Self {
        Self { broker, router }
    }

    /// Process at most one task. Returns the settled task, or `None` when
    /// nothing was waiting.
    pub async fn run_once(&self) -> PressroomResult<Option<(Task, Settlement)>> {
        let Some(task) = self
            .broker
            .dequeue_matching(&|t: &Task| t.kind != TaskKind::Collection)
            .await?
        else {
            return Ok(None);
        };

        let outcome = self.router.dispatch_task(&task).await;
        let settlement = classify(&outcome);
        let settled = match outcome {
            Ok(result) => self.broker.ack(task.id, result).await?,
            Err(e) if e.is_retryable() => self.broker.fail(task.id, &e.to_string()).await?,
            Err(e) => self.broker.abandon(task.id, &e.to_string()).await?,
        };
        info!(
            task_id = %settled.id,
            kind = %settled.kind,
            status = %settled.status,
            "Task settled"
        );
        Ok(Some((settled, settlement)))
    }

    /// Drain the queue until `shutdown` flips, sleeping `idle` when empty.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, idle: Duration) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Task worker iteration failed"),
            }
            if idle_or_shutdown(&mut shutdown, idle).await {
                break;
            }
        }
    }
}

/// Pulls collection jobs through the queue manager, so the concurrency
/// ceiling and rate limit apply, and runs them on a [`Collector`].
pub struct CollectionWorker {
    manager: Arc<QueueManager>,
    collector: Arc<dyn Collector>,
}

impl CollectionWorker {
    /// Worker pulling through `manager` and collecting with `collector`.
    pub fn new(manager: Arc<QueueManager>, collector: Arc<dyn Collector>) -> Self {
        Self { manager, collector }
    }

    /// Start at most one admitted job. `None` when nothing may start now.
    pub async fn run_once(&self) -> PressroomResult<Option<(Task, Settlement)>> {
        let Some(task) = self.manager.acquire().await? else {
            return Ok(None);
        };
        let outcome = match task.source_key.as_deref() {
            Some(key) => self.collector.collect(key).await,
            None => Err(PressroomError::Validation(format!(
                "collection task {} has no source key",
                task.id
            ))),
        };

        let settlement = classify(&outcome);
        let settled = match outcome {
            Ok(result) => self.manager.complete(task.id, result).await?,
            Err(e) if e.is_retryable() => self.manager.fail(task.id, &e.to_string()).await?,
            Err(e) => self.manager.abandon(task.id, &e.to_string()).await?,
        };
        info!(
            task_id = %settled.id,
            source = settled.source_key.as_deref().unwrap_or_default(),
            status = %settled.status,
            "Collection job settled"
        );
        Ok(Some((settled, settlement)))
    }

    /// Run admitted jobs until `shutdown` flips, sleeping `idle` when none
    /// may start.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, idle: Duration) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Collection worker iteration failed"),
            }
            if idle_or_shutdown(&mut shutdown, idle).await {
                break;
            }
        }
    }
}
