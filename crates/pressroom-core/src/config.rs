//! TOML configuration for a Pressroom deployment.
//!
//! Every section is optional; missing keys fall back to the defaults the
//! collectors and workflows were tuned with.

use crate::{PressroomError, PressroomResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on `queue.rate_limit_secs`: one day.
pub const MAX_RATE_LIMIT_SECS: f64 = 86_400.0;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PressroomConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

/// What to do when a job for a source is already Pending or Processing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupPolicy {
    /// Enqueue anyway.
    #[default]
    Allow,
    /// Drop the new request without error.
    Drop,
    /// Refuse with a capacity error.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Ceiling on collection jobs Processing at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Minimum seconds between two job starts for the same source.
    #[serde(default = "default_rate_limit_secs")]
    pub rate_limit_secs: f64,
    #[serde(default)]
    pub dedup: DedupPolicy,
    #[serde(default = "default_priority")]
    pub default_priority: i32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// A Processing task older than this is handed back to the retry path.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// A task that failed with a retryable error waits this long before it
    /// can be claimed again.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub key: String,
    /// Defaults to the scheduler interval.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// How long a paused workflow waits for a human decision.
    #[serde(default = "default_validation_timeout_secs")]
    pub validation_timeout_secs: u64,
    /// Node executions allowed per run before the workflow is failed.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_concurrent() -> usize {
    5
}
fn default_rate_limit_secs() -> f64 {
    1.0
}
fn default_priority() -> i32 {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_visibility_timeout_secs() -> u64 {
    600
}
fn default_retry_delay_secs() -> u64 {
    30
}
fn default_interval_secs() -> u64 {
    3600
}
fn default_validation_timeout_secs() -> u64 {
    86_400
}
fn default_max_steps() -> usize {
    256
}

impl Default for PressroomConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            logging: LoggingConfig::default(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            rate_limit_secs: default_rate_limit_secs(),
            dedup: DedupPolicy::default(),
            default_priority: default_priority(),
            max_retries: default_max_retries(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            sources: Vec::new(),
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            validation_timeout_secs: default_validation_timeout_secs(),
            max_steps: default_max_steps(),
        }
    }
}

impl QueueConfig {
    /// Minimum spacing per source. Values outside `0..=MAX_RATE_LIMIT_SECS`
    /// are clamped; `validate` rejects them before they get here.
    pub fn rate_limit(&self) -> Duration {
        let secs = if self.rate_limit_secs.is_nan() {
            0.0
        } else {
            self.rate_limit_secs.clamp(0.0, MAX_RATE_LIMIT_SECS)
        };
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl SourceConfig {
    /// The source's own interval, falling back to the scheduler period.
    pub fn interval_or(&self, fallback: Duration) -> Duration {
        self.interval_secs
            .map(Duration::from_secs)
            .unwrap_or(fallback)
    }
}

impl WorkflowConfig {
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }
}

impl PressroomConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> PressroomResult<Self> {
        let config: PressroomConfig =
            toml::from_str(raw).map_err(|e| PressroomError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_file(path: &Path) -> PressroomResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PressroomError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> PressroomResult<()> {
        if self.queue.max_concurrent == 0 {
            return Err(PressroomError::Config(
                "queue.max_concurrent must be at least 1".into(),
            ));
        }
        if !self.queue.rate_limit_secs.is_finite() || self.queue.rate_limit_secs < 0.0 {
            return Err(PressroomError::Config(
                "queue.rate_limit_secs must be a non-negative number".into(),
            ));
        }
        if self.queue.rate_limit_secs > MAX_RATE_LIMIT_SECS {
            return Err(PressroomError::Config(format!(
                "queue.rate_limit_secs cannot exceed {MAX_RATE_LIMIT_SECS}"
            )));
        }
        if self.scheduler.interval_secs == 0 {
            return Err(PressroomError::Config(
                "scheduler.interval_secs must be at least 1".into(),
            ));
        }
        if self.workflow.max_steps == 0 {
            return Err(PressroomError::Config(
                "workflow.max_steps must be at least 1".into(),
            ));
        }

        let mut seen = HashSet::new();
        for source in &self.scheduler.sources {
            if source.key.trim().is_empty() {
                return Err(PressroomError::Config("source key cannot be empty".into()));
            }
            if source.interval_secs == Some(0) {
                return Err(PressroomError::Config(format!(
                    "source '{}' has a zero interval",
                    source.key
                )));
            }
            if !seen.insert(source.key.as_str()) {
                return Err(PressroomError::Config(format!(
                    "duplicate source key '{}'",
                    source.key
                )));
            }
        }
        Ok(())
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn validations_dir(&self) -> PathBuf {
        self.data_dir.join("validations")
    }
}
