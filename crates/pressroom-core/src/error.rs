use thiserror::Error;

/// A convenience `Result` alias using [`PressroomError`].
pub type PressroomResult<T> = Result<T, PressroomError>;

/// Top-level error type for every Pressroom crate.
///
/// The first block of variants is the queue/workflow taxonomy callers branch
/// on; the rest wrap infrastructure failures.
#[derive(Error, Debug)]
pub enum PressroomError {
    /// Malformed input. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An id that no store knows about.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A transient collaborator failure (network, upstream API).
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Retries exhausted or explicitly non-retryable.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// A validation record that is no longer awaiting a decision.
    #[error("Validation expired: {0}")]
    ExpiredValidation(String),

    /// Admission control refused the request.
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Lost a compare-and-swap race (e.g. a second resolve of the same record).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A task status change outside the legal edge set.
    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// The task that was being transitioned.
        task_id: String,
        /// Status the task was in.
        from: String,
        /// Status that was rejected.
        to: String,
    },

    /// Configuration parsing or validation failed.
    #[error("Config error: {0}")]
    Config(String),

    /// Workflow graph construction or traversal failed.
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PressroomError {
    /// Whether a worker should route this failure through the retry path.
    ///
    /// I/O errors count as transient; everything that describes bad input or
    /// a violated invariant does not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PressroomError::Retryable(_) | PressroomError::Io(_))
    }

    /// Short machine-readable name of the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            PressroomError::Validation(_) => "validation",
            PressroomError::NotFound(_) => "not_found",
            PressroomError::Retryable(_) => "retryable",
            PressroomError::Fatal(_) => "fatal",
            PressroomError::ExpiredValidation(_) => "expired_validation",
            PressroomError::CapacityExceeded(_) => "capacity_exceeded",
            PressroomError::Conflict(_) => "conflict",
            PressroomError::InvalidTransition { .. } => "invalid_transition",
            PressroomError::Config(_) => "config",
            PressroomError::Workflow(_) => "workflow",
            PressroomError::Json(_) => "json",
            PressroomError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PressroomError::Retryable("timeout".into()).is_retryable());
        assert!(PressroomError::Io(std::io::Error::other("disk")).is_retryable());
        assert!(!PressroomError::Validation("bad".into()).is_retryable());
        assert!(!PressroomError::Fatal("boom".into()).is_retryable());
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = PressroomError::InvalidTransition {
            task_id: "t-1".into(),
            from: "completed".into(),
            to: "processing".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("t-1"));
        assert!(msg.contains("completed -> processing"));
        assert_eq!(err.kind(), "invalid_transition");
    }

    #[test]
    fn test_json_error_converts() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let err: PressroomError = parse.unwrap_err().into();
        assert_eq!(err.kind(), "json");
    }
}
