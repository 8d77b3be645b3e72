//! Agent message routing.
//!
//! Queued tasks become [`Envelope`]s and are dispatched to the handler
//! registered for their (task kind, target role) pair.

use async_trait::async_trait;
use pressroom_core::{AgentMessage, AgentRole, PressroomError, PressroomResult, TaskKind};
use pressroom_queue::Task;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};
use uuid::Uuid;

/// A message on its way to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Set when the message comes from a queued task; handlers key
    /// idempotency on it.
    pub task_id: Option<Uuid>,
    /// Task kind, half of the routing key.
    pub kind: TaskKind,
    pub message: AgentMessage,
}

impl Envelope {
    /// An envelope not tied to a queued task.
    pub fn new(kind: TaskKind, message: AgentMessage) -> Self {
        Self {
            task_id: None,
            kind,
            message,
        }
    }

    /// Build the envelope for a queued task.
    ///
    /// The task needs a target role. A missing source role means the message
    /// was issued by the content router itself. `action` falls back to the
    /// kind name and `data` to the whole payload.
    pub fn from_task(task: &Task) -> PressroomResult<Self> {
        let target = task.target.ok_or_else(|| {
            PressroomError::Validation(format!("task {} has no target role", task.id))
        })?;
        let source = task.source.unwrap_or(AgentRole::ContentRouter);

        let action = task
            .payload
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or(task.kind.as_str());
        let data = match task.payload.get("data") {
            Some(Value::Object(data)) => data.clone(),
            Some(_) => {
                return Err(PressroomError::Validation(format!(
                    "task {}: payload.data must be an object",
                    task.id
                )))
            }
            None => without_envelope_keys(&task.payload),
        };

        let mut message = AgentMessage::new(source, target, action).with_data(data);
        if let Some(callback) = task.payload.get("callback").and_then(Value::as_str) {
            message = message.with_callback(callback);
        }
        Ok(Self {
            task_id: Some(task.id),
            kind: task.kind,
            message,
        })
    }
}

fn without_envelope_keys(payload: &Map<String, Value>) -> Map<String, Value> {
    payload
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "action" | "callback"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Receives routed messages. Invoked at least once per message, so handlers
/// must tolerate redelivery of the same `task_id`.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one message. The returned value becomes the task result.
    async fn handle(&self, envelope: &Envelope) -> PressroomResult<Value>;
}

/// Dispatch table keyed by (task kind, target role).
#[derive(Default)]
pub struct CommunicationRouter {
    handlers: HashMap<(TaskKind, AgentRole), Arc<dyn MessageHandler>>,
}

impl CommunicationRouter {
    /// An empty dispatch table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same pair.
    pub fn register(
        &mut self,
        kind: TaskKind,
        target: AgentRole,
        handler: Arc<dyn MessageHandler>,
    ) -> &mut Self {
        if self.handlers.insert((kind, target), handler).is_some() {
            debug!(kind = %kind, target = %target, "Handler replaced");
        }
        self
    }

    /// Registered pairs, sorted by kind then role.
    pub fn routes(&self) -> Vec<(TaskKind, AgentRole)> {
        let mut routes: Vec<_> = self.handlers.keys().copied().collect();
        routes.sort_by_key(|(kind, role)| (kind.as_str(), role.as_str()));
        routes
    }

    /// Whether a handler is registered for the pair.
    pub fn has_route(&self, kind: TaskKind, target: AgentRole) -> bool {
        self.handlers.contains_key(&(kind, target))
    }

    /// Hand `envelope` to its handler. An unregistered pair is a validation
    /// error.
    pub async fn dispatch(&self, envelope: &Envelope) -> PressroomResult<Value> {
        let target = envelope.message.target;
        let handler = self
            .handlers
            .get(&(envelope.kind, target))
            .ok_or_else(|| {
                PressroomError::Validation(format!(
                    "no handler for {} -> {}",
                    envelope.kind, target
                ))
            })?;
        info!(
            kind = %envelope.kind,
            source = %envelope.message.source,
            target = %target,
            action = %envelope.message.action,
            task_id = ?envelope.task_id,
            "Dispatching message"
        );
        handler.handle(envelope).await
    }

    /// Build the envelope for `task` and dispatch it.
    pub async fn dispatch_task(&self, task: &Task) -> PressroomResult<Value> {
        self.dispatch(&Envelope::from_task(task)?).await
    }
}

/// Task ids remembered by an [`IdempotentHandler`] unless told otherwise.
pub const DEFAULT_IDEMPOTENCY_CAPACITY: usize = 1024;

/// Runs the wrapped handler at most once per `task_id`, replaying the first
/// successful result on redelivery. Failures are not cached. Envelopes
/// without a task id always run.
///
/// Different task ids run concurrently; a redelivery of an id that is still
/// running waits for that run. Only the most recent `capacity` ids are
/// remembered.
pub struct IdempotentHandler {
    inner: Arc<dyn MessageHandler>,
    capacity: usize,
    slots: Mutex<Slots>,
}

#[derive(Default)]
struct Slots {
    by_task: HashMap<Uuid, Arc<OnceCell<Value>>>,
    order: VecDeque<Uuid>,
}

impl Slots {
    fn slot(&mut self, task_id: Uuid, capacity: usize) -> Arc<OnceCell<Value>> {
        if let Some(cell) = self.by_task.get(&task_id) {
            return cell.clone();
        }
        while self.order.len() >= capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.by_task.remove(&oldest);
        }
        let cell = Arc::new(OnceCell::new());
        self.by_task.insert(task_id, cell.clone());
        self.order.push_back(task_id);
        cell
    }

    fn remove(&mut self, task_id: Uuid) {
        if self.by_task.remove(&task_id).is_some() {
            self.order.retain(|id| *id != task_id);
        }
    }
}

impl IdempotentHandler {
    /// Wrap `inner`, remembering up to [`DEFAULT_IDEMPOTENCY_CAPACITY`] ids.
    pub fn new(inner: Arc<dyn MessageHandler>) -> Self {
        Self::with_capacity(inner, DEFAULT_IDEMPOTENCY_CAPACITY)
    }

    /// Wrap `inner`, remembering up to `capacity` ids. The oldest id is
    /// dropped first.
    pub fn with_capacity(inner: Arc<dyn MessageHandler>, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Drop the remembered result for `task_id`, so the next delivery runs.
    pub async fn forget(&self, task_id: Uuid) {
        self.slots.lock().await.remove(task_id);
    }

    /// Number of task ids currently remembered.
    pub async fn remembered(&self) -> usize {
        self.slots.lock().await.by_task.len()
    }
}

#[async_trait]
impl MessageHandler for IdempotentHandler {
    async fn handle(&self, envelope: &Envelope) -> PressroomResult<Value> {
        let Some(task_id) = envelope.task_id else {
            return self.inner.handle(envelope).await;
        };
        let cell = self.slots.lock().await.slot(task_id, self.capacity);
        if let Some(result) = cell.get() {
            debug!(task_id = %task_id, "Replaying cached result");
            return Ok(result.clone());
        }
        let result = cell
            .get_or_try_init(|| self.inner.handle(envelope))
            .await?;
        Ok(result.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Barrier;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, envelope: &Envelope) -> PressroomResult<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({"call": n, "action": envelope.message.action}))
        }
    }

    fn message_task() -> Task {
        let mut payload = Map::new();
        payload.insert("action".into(), json!("generate_metadata"));
        payload.insert("data".into(), json!({"title": "Patch 14.3 notes"}));
        payload.insert("callback".into(), json!("http://copywriter/callback"));
        Task::new(TaskKind::AgentMessage, payload).with_roles(
            Some(AgentRole::Copywriter),
            Some(AgentRole::MetadataGenerator),
        )
    }

    #[test]
    fn test_envelope_from_task() {
        let task = message_task();
        let envelope = Envelope::from_task(&task).unwrap();
        assert_eq!(envelope.task_id, Some(task.id));
        assert_eq!(envelope.message.source, AgentRole::Copywriter);
        assert_eq!(envelope.message.action, "generate_metadata");
        assert_eq!(envelope.message.data.get("title"), Some(&json!("Patch 14.3 notes")));
        assert_eq!(
            envelope.message.callback.as_deref(),
            Some("http://copywriter/callback")
        );
    }

    #[test]
    fn test_envelope_defaults() {
        let mut payload = Map::new();
        payload.insert("post".into(), json!({"title": "t"}));
        let task = Task::new(TaskKind::Publish, payload).with_roles(None, Some(AgentRole::Rewriter));
        let envelope = Envelope::from_task(&task).unwrap();
        assert_eq!(envelope.message.source, AgentRole::ContentRouter);
        assert_eq!(envelope.message.action, "publish");
        assert!(envelope.message.data.contains_key("post"));
    }

    #[test]
    fn test_envelope_requires_target() {
        let task = Task::new(TaskKind::RequestHandoff, Map::new());
        assert!(matches!(
            Envelope::from_task(&task).unwrap_err(),
            PressroomError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_dispatch_by_kind_and_target() {
        let handler = Arc::new(Counting::default());
        let mut router = CommunicationRouter::new();
        router.register(TaskKind::AgentMessage, AgentRole::MetadataGenerator, handler.clone());

        let result = router.dispatch_task(&message_task()).await.unwrap();
        assert_eq!(result["action"], json!("generate_metadata"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            router.routes(),
            vec![(TaskKind::AgentMessage, AgentRole::MetadataGenerator)]
        );
    }

    #[tokio::test]
    async fn test_unknown_route_is_validation_error() {
        let mut router = CommunicationRouter::new();
        router.register(
            TaskKind::AgentMessage,
            AgentRole::Copywriter,
            Arc::new(Counting::default()),
        );
        let envelope = Envelope::new(
            TaskKind::Publish,
            AgentMessage::new(AgentRole::ContentRouter, AgentRole::Copywriter, "publish"),
        );
        let err = router.dispatch(&envelope).await.unwrap_err();
        assert!(matches!(err, PressroomError::Validation(_)));
    }

    #[tokio::test]
    async fn test_idempotent_handler_runs_once_per_task() {
        let inner = Arc::new(Counting::default());
        let handler = IdempotentHandler::new(inner.clone());
        let envelope = Envelope::from_task(&message_task()).unwrap();

        let first = handler.handle(&envelope).await.unwrap();
        let second = handler.handle(&envelope).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        let untracked = Envelope {
            task_id: None,
            ..envelope
        };
        handler.handle(&untracked).await.unwrap();
        handler.handle(&untracked).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    /// Completes only once two calls are inside `handle` at the same time.
    struct Rendezvous {
        barrier: Barrier,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Rendezvous {
        async fn handle(&self, _envelope: &Envelope) -> PressroomResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.barrier.wait().await;
            Ok(json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn test_idempotent_handler_runs_distinct_tasks_concurrently() {
        let inner = Arc::new(Rendezvous {
            barrier: Barrier::new(2),
            calls: AtomicUsize::new(0),
        });
        let handler = IdempotentHandler::new(inner.clone());
        let first = Envelope::from_task(&message_task()).unwrap();
        let second = Envelope::from_task(&message_task()).unwrap();
        assert_ne!(first.task_id, second.task_id);

        let (a, b) = tokio::time::timeout(
            Duration::from_secs(2),
            async { tokio::join!(handler.handle(&first), handler.handle(&second)) },
        )
        .await
        .expect("distinct task ids must not wait on each other");
        a.unwrap();
        b.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_idempotent_handler_concurrent_redelivery_runs_once() {
        let inner = Arc::new(Counting::default());
        let handler = IdempotentHandler::new(inner.clone());
        let envelope = Envelope::from_task(&message_task()).unwrap();

        let (a, b) = tokio::join!(handler.handle(&envelope), handler.handle(&envelope));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idempotent_handler_evicts_oldest() {
        let inner = Arc::new(Counting::default());
        let handler = IdempotentHandler::with_capacity(inner.clone(), 2);
        let envelopes: Vec<Envelope> = (0..3)
            .map(|_| Envelope::from_task(&message_task()).unwrap())
            .collect();
        for envelope in &envelopes {
            handler.handle(envelope).await.unwrap();
        }
        assert_eq!(handler.remembered().await, 2);

        // The newest ids replay; the evicted one runs again.
        handler.handle(&envelopes[2]).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        handler.handle(&envelopes[0]).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_idempotent_handler_forget_reruns() {
        let inner = Arc::new(Counting::default());
        let handler = IdempotentHandler::new(inner.clone());
        let envelope = Envelope::from_task(&message_task()).unwrap();
        handler.handle(&envelope).await.unwrap();
        handler.forget(envelope.task_id.unwrap()).await;
        assert_eq!(handler.remembered().await, 0);
        handler.handle(&envelope).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
