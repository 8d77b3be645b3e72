use chrono::{DateTime, Utc};
use pressroom_core::config::QueueConfig;
use pressroom_core::{AgentRole, PressroomError, PressroomResult, TaskKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Upper bound accepted for `max_retries` at the boundary.
pub const MAX_RETRIES_LIMIT: u32 = 100;

/// Lifecycle status of a queued task.
///
/// Legal edges: Pending → Processing → {Completed, Failed, Retry} and
/// Retry → Pending. Nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Acknowledged with a result.
    Completed,
    /// Failed permanently.
    Failed,
    /// Transient state between a retryable failure and requeue.
    Retry,
}

impl TaskStatus {
    /// Whether `self -> next` is one of the legal edges.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Retry)
                | (Retry, Pending)
        )
    }

    /// Completed or Failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retry => "retry",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = PressroomError;

    fn from_str(s: &str) -> PressroomResult<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "retry" => Ok(TaskStatus::Retry),
            other => Err(PressroomError::Validation(format!(
                "Unknown task status '{other}'"
            ))),
        }
    }
}

/// One unit of queued work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// What the task does; fixes the payload shape.
    pub kind: TaskKind,
    /// Sending role. Absent means the content router.
    #[serde(default)]
    pub source: Option<AgentRole>,
    /// Receiving role, used for routing.
    #[serde(default)]
    pub target: Option<AgentRole>,
    /// Scheduled source a collection job belongs to.
    #[serde(default)]
    pub source_key: Option<String>,
    pub payload: Map<String, Value>,
    /// Higher runs first.
    pub priority: i32,
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Retries used so far.
    pub retry_count: u32,
    /// Stamped by the broker on enqueue.
    pub created_at: DateTime<Utc>,
    /// When the current attempt was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Not claimable before this instant. Set when a failure is retried.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Last failure message.
    pub error: Option<String>,
    /// Handler output once Completed.
    pub result: Option<Value>,
}

/// Defaults applied to tasks that do not set their own priority or retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDefaults {
    /// Priority for tasks that do not set one.
    pub priority: i32,
    /// Retry budget for tasks that do not set one.
    pub max_retries: u32,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            priority: 5,
            max_retries: 3,
        }
    }
}

impl From<&QueueConfig> for TaskDefaults {
    fn from(config: &QueueConfig) -> Self {
        Self {
            priority: config.default_priority,
            max_retries: config.max_retries,
        }
    }
}

impl Task {
    /// A Pending task with default priority and retry budget.
    pub fn new(kind: TaskKind, payload: Map<String, Value>) -> Self {
        let defaults = TaskDefaults::default();
        Self {
            id: Uuid::new_v4(),
            kind,
            source: None,
            target: None,
            source_key: None,
            payload,
            priority: defaults.priority,
            max_retries: defaults.max_retries,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            not_before: None,
            status: TaskStatus::Pending,
            error: None,
            result: None,
        }
    }

    /// A collection job for one scheduled source.
    pub fn collection(source_key: impl Into<String>) -> Self {
        let key = source_key.into();
        let mut payload = Map::new();
        payload.insert("source".into(), Value::String(key.clone()));
        let mut task = Self::new(TaskKind::Collection, payload);
        task.source_key = Some(key);
        task
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the sending and receiving roles.
    pub fn with_roles(mut self, source: Option<AgentRole>, target: Option<AgentRole>) -> Self {
        self.source = source;
        self.target = target;
        self
    }

    /// Check the payload against what the task kind needs.
    pub fn validate(&self) -> PressroomResult<()> {
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(PressroomError::Validation(format!(
                "max_retries {} exceeds limit {MAX_RETRIES_LIMIT}",
                self.max_retries
            )));
        }
        if self.retry_count > self.max_retries {
            return Err(PressroomError::Validation(format!(
                "retry_count {} exceeds max_retries {}",
                self.retry_count, self.max_retries
            )));
        }

        match self.kind {
            TaskKind::AgentMessage => {
                if self.target.is_none() {
                    return Err(PressroomError::Validation(
                        "agent_message tasks need a target role".into(),
                    ));
                }
                match self.payload.get("action") {
                    Some(Value::String(action)) if !action.trim().is_empty() => {}
                    _ => {
                        return Err(PressroomError::Validation(
                            "agent_message payload needs a non-empty string 'action'".into(),
                        ))
                    }
                }
            }
            TaskKind::Collection => {
                if self
                    .source_key
                    .as_deref()
                    .map_or(true, |k| k.trim().is_empty())
                {
                    return Err(PressroomError::Validation(
                        "collection tasks need a source_key".into(),
                    ));
                }
            }
            TaskKind::Publish => {
                if self.payload.is_empty() {
                    return Err(PressroomError::Validation(
                        "publish payload cannot be empty".into(),
                    ));
                }
            }
            TaskKind::RequestHandoff => {}
        }
        Ok(())
    }

    /// Move to `next`, rejecting edges outside the legal set.
    pub(crate) fn transition(&mut self, next: TaskStatus) -> PressroomResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(PressroomError::InvalidTransition {
                task_id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Not yet terminal: the task still occupies its source.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Pending | TaskStatus::Processing | TaskStatus::Retry
        )
    }

    /// Whether the retry delay, if any, has elapsed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }

    /// The status view handed back to callers.
    pub fn report(&self) -> TaskStatusReport {
        TaskStatusReport {
            task_id: self.id,
            status: self.status,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            result: self.result.clone(),
            error_message: self.error.clone(),
        }
    }
}

/// What a status query returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusReport {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Present once Completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Last failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Boundary form of an enqueue call. Strings are turned into the closed
/// enums here and nowhere else.
#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    /// Task kind name, e.g. `agent_message`.
    pub kind: String,
    /// Must be a JSON object.
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub source_key: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl EnqueueRequest {
    /// Parse the closed sets, apply `defaults` and validate.
    pub fn into_task(self, defaults: TaskDefaults) -> PressroomResult<Task> {
        let kind: TaskKind = self.kind.parse()?;
        let payload = match self.payload {
            Value::Object(map) => map,
            other => {
                return Err(PressroomError::Validation(format!(
                    "payload must be a JSON object, got {}",
                    json_type_name(&other)
                )))
            }
        };
        let source: Option<AgentRole> = self.source.as_deref().map(str::parse).transpose()?;
        let target: Option<AgentRole> = self.target.as_deref().map(str::parse).transpose()?;

        let mut task = Task::new(kind, payload)
            .with_priority(self.priority.unwrap_or(defaults.priority))
            .with_max_retries(self.max_retries.unwrap_or(defaults.max_retries))
            .with_roles(source, target);
        task.source_key = self.source_key;
        task.validate()?;
        Ok(task)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: Value) -> EnqueueRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_task_creation() {
        let task = Task::new(TaskKind::RequestHandoff, Map::new());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.priority, 5);
        assert!(task.started_at.is_none());
    }

    #[test]
    fn test_legal_edges_only() {
        use TaskStatus::*;
        let all = [Pending, Processing, Completed, Failed, Retry];
        let legal = [
            (Pending, Processing),
            (Processing, Completed),
            (Processing, Failed),
            (Processing, Retry),
            (Retry, Pending),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_transition_rejects_illegal_edge() {
        let mut task = Task::new(TaskKind::Publish, Map::new());
        let err = task.transition(TaskStatus::Completed).unwrap_err();
        assert!(matches!(err, PressroomError::InvalidTransition { .. }));
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_enqueue_request_applies_defaults() {
        let task = request(json!({"kind": "request_handoff", "payload": {"title": "Patch notes"}}))
            .into_task(TaskDefaults {
                priority: 7,
                max_retries: 1,
            })
            .unwrap();
        assert_eq!(task.kind, TaskKind::RequestHandoff);
        assert_eq!(task.priority, 7);
        assert_eq!(task.max_retries, 1);
    }

    #[test]
    fn test_enqueue_request_rejects_unknown_kind() {
        let err = request(json!({"kind": "wordpress_publish"}))
            .into_task(TaskDefaults::default())
            .unwrap_err();
        assert!(matches!(err, PressroomError::Validation(_)));
    }

    #[test]
    fn test_enqueue_request_rejects_non_object_payload() {
        let err = request(json!({"kind": "publish", "payload": [1, 2]}))
            .into_task(TaskDefaults::default())
            .unwrap_err();
        assert!(matches!(err, PressroomError::Validation(msg) if msg.contains("array")));
    }

    #[test]
    fn test_agent_message_needs_action_and_roles() {
        let missing_action = request(json!({
            "kind": "agent_message",
            "source": "content_router",
            "target": "rewriter",
            "payload": {"data": {}}
        }))
        .into_task(TaskDefaults::default());
        assert!(missing_action.is_err());

        let unknown_role = request(json!({
            "kind": "agent_message",
            "source": "content_router",
            "target": "illustrator",
            "payload": {"action": "draw"}
        }))
        .into_task(TaskDefaults::default());
        assert!(matches!(unknown_role, Err(PressroomError::Validation(_))));

        let ok = request(json!({
            "kind": "agent_message",
            "source": "content_router",
            "target": "rewriter",
            "payload": {"action": "rewrite", "data": {"url": "https://example.com/a"}}
        }))
        .into_task(TaskDefaults::default())
        .unwrap();
        assert_eq!(ok.target, Some(AgentRole::Rewriter));

        let missing_target = request(json!({
            "kind": "agent_message",
            "source": "content_router",
            "payload": {"action": "rewrite"}
        }))
        .into_task(TaskDefaults::default());
        assert!(matches!(missing_target, Err(PressroomError::Validation(_))));
    }

    #[test]
    fn test_agent_message_source_is_optional() {
        let task = request(json!({
            "kind": "agent_message",
            "target": "copywriter_news",
            "payload": {"action": "write"}
        }))
        .into_task(TaskDefaults::default())
        .unwrap();
        assert_eq!(task.source, None);
        assert_eq!(task.target, Some(AgentRole::CopywriterNews));
    }

    #[test]
    fn test_due_after_not_before() {
        let mut task = Task::new(TaskKind::RequestHandoff, Map::new());
        let now = Utc::now();
        assert!(task.is_due(now));
        task.not_before = Some(now + chrono::Duration::seconds(30));
        assert!(!task.is_due(now));
        assert!(task.is_due(now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_collection_needs_source_key() {
        let err = request(json!({"kind": "collection"}))
            .into_task(TaskDefaults::default())
            .unwrap_err();
        assert!(matches!(err, PressroomError::Validation(_)));
        assert!(Task::collection("league_of_legends").validate().is_ok());
    }

    #[test]
    fn test_publish_needs_payload() {
        let err = request(json!({"kind": "publish"}))
            .into_task(TaskDefaults::default())
            .unwrap_err();
        assert!(matches!(err, PressroomError::Validation(_)));
    }

    #[test]
    fn test_retry_budget_limit() {
        let err = Task::new(TaskKind::RequestHandoff, Map::new())
            .with_max_retries(MAX_RETRIES_LIMIT + 1)
            .validate()
            .unwrap_err();
        assert!(matches!(err, PressroomError::Validation(_)));
    }

    #[test]
    fn test_task_serialization_is_flat() {
        let task = Task::collection("valorant");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"], "collection");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["source_key"], "valorant");
        let parsed: Task = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, task);
    }
}
