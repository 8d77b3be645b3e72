//! Runs workflow graphs, pausing at interrupt points and resuming from
//! validation records.
//!
//! The engine keeps no per-run state in memory. Everything needed to resume a
//! paused run lives in the checkpoint and validation stores, so a resume may
//! arrive in a different process than the one that paused.

use crate::checkpoint::{Checkpoint, CheckpointStore, WorkflowStatus};
use crate::graph::{Target, WorkflowGraph};
use crate::state::{StateUpdate, WorkflowState};
use crate::validation::{ValidationRecord, ValidationStore};
use pressroom_core::clock::{system_clock, Clock};
use pressroom_core::config::WorkflowConfig;
use pressroom_core::{PressroomError, PressroomResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Engine limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a paused run waits for its decision.
    pub validation_timeout: Duration,
    /// Node executions allowed per run.
    pub max_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&WorkflowConfig::default())
    }
}

impl From<&WorkflowConfig> for EngineConfig {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            validation_timeout: config.validation_timeout(),
            max_steps: config.max_steps,
        }
    }
}

/// What `start` and `resume` report back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowOutcome {
    pub workflow_id: Uuid,
    pub status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_validation_id: Option<Uuid>,
    pub state: WorkflowState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Checkpoint> for WorkflowOutcome {
    fn from(cp: &Checkpoint) -> Self {
        Self {
            workflow_id: cp.workflow_id,
            status: cp.status,
            next_validation_id: cp.pending_validation,
            state: cp.state.clone(),
            error: cp.error.clone(),
        }
    }
}

/// Registry of workflow graphs plus the stores their runs persist to.
pub struct WorkflowEngine {
    graphs: HashMap<String, Arc<WorkflowGraph>>,
    checkpoints: Arc<dyn CheckpointStore>,
    validations: Arc<dyn ValidationStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        checkpoints: Arc<dyn CheckpointStore>,
        validations: Arc<dyn ValidationStore>,
        config: EngineConfig,
    ) -> Self {
        Self::with_clock(checkpoints, validations, config, system_clock())
    }

    pub fn with_clock(
        checkpoints: Arc<dyn CheckpointStore>,
        validations: Arc<dyn ValidationStore>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            graphs: HashMap::new(),
            checkpoints,
            validations,
            clock,
            config,
        }
    }

    /// Make a graph startable by name.
    pub fn register(&mut self, graph: WorkflowGraph) -> PressroomResult<()> {
        let name = graph.name().to_string();
        if self.graphs.contains_key(&name) {
            return Err(PressroomError::Workflow(format!(
                "workflow '{name}' already registered"
            )));
        }
        debug!(workflow = %name, interrupts = ?graph.interrupt_points(), "Workflow registered");
        self.graphs.insert(name, Arc::new(graph));
        Ok(())
    }

    pub fn graph(&self, name: &str) -> PressroomResult<Arc<WorkflowGraph>> {
        self.graphs
            .get(name)
            .cloned()
            .ok_or_else(|| PressroomError::NotFound(format!("workflow '{name}'")))
    }

    pub fn workflow_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.graphs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run `name` from its entry node until it ends, fails or pauses.
    pub async fn start(
        &self,
        name: &str,
        initial_state: WorkflowState,
    ) -> PressroomResult<WorkflowOutcome> {
        let graph = self.graph(name)?;
        let checkpoint = Checkpoint::new(name, initial_state, graph.entry(), self.clock.now());
        self.checkpoints.save(&checkpoint).await?;
        info!(workflow_id = %checkpoint.workflow_id, workflow = %name, "Workflow started");

        let entry = Target::node(graph.entry());
        self.drive(&graph, checkpoint, entry, false).await
    }

    /// Apply a human decision to a paused run and continue it.
    pub async fn resume(
        &self,
        validation_id: Uuid,
        decision: StateUpdate,
    ) -> PressroomResult<WorkflowOutcome> {
        let record = self.validations.get(validation_id).await?;
        if record.is_expired() {
            return Err(PressroomError::ExpiredValidation(format!(
                "validation {validation_id} expired"
            )));
        }
        if record.is_resolved() {
            return Err(PressroomError::Conflict(format!(
                "validation {validation_id} already resolved"
            )));
        }
        if record.is_past_timeout(self.config.validation_timeout, self.clock.now()) {
            self.expire_record(&record).await?;
            return Err(PressroomError::ExpiredValidation(format!(
                "validation {validation_id} timed out"
            )));
        }

        let graph = self.graph(&record.workflow_name)?;
        let mut checkpoint = self.checkpoints.load(record.workflow_id).await?;
        if checkpoint.pending_validation != Some(validation_id) {
            return Err(PressroomError::Conflict(format!(
                "workflow {} is not waiting on validation {validation_id}",
                record.workflow_id
            )));
        }

        let state = self.validations.resolve(validation_id, decision).await?;
        info!(
            workflow_id = %record.workflow_id,
            validation_id = %validation_id,
            node = %record.node,
            "Workflow resumed"
        );

        checkpoint.state = state;
        checkpoint.status = WorkflowStatus::Running;
        checkpoint.pending_validation = None;
        checkpoint.updated_at = self.clock.now();
        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            // The run still waits on this record; let the decision be sent again.
            warn!(
                workflow_id = %record.workflow_id,
                validation_id = %validation_id,
                error = %e,
                "Saving resumed checkpoint failed, reopening validation"
            );
            if let Err(rollback) = self.validations.reopen(&record).await {
                warn!(
                    validation_id = %validation_id,
                    error = %rollback,
                    "Reopening validation failed"
                );
            }
            return Err(e);
        }

        self.drive(&graph, checkpoint, Target::Node(record.node), true)
            .await
    }

    pub async fn status(&self, workflow_id: Uuid) -> PressroomResult<Checkpoint> {
        self.checkpoints.load(workflow_id).await
    }

    pub async fn list_workflows(&self) -> PressroomResult<Vec<Checkpoint>> {
        self.checkpoints.list().await
    }

    pub async fn pending_validations(&self) -> PressroomResult<Vec<ValidationRecord>> {
        self.validations.list_awaiting().await
    }

    /// Discard a run. A pending validation is expired so it can no longer
    /// resume anything. Returns the final checkpoint, marked cancelled.
    pub async fn cancel(&self, workflow_id: Uuid) -> PressroomResult<Checkpoint> {
        let mut checkpoint = self.checkpoints.load(workflow_id).await?;
        if let Some(validation_id) = checkpoint.pending_validation.take() {
            match self.validations.expire(validation_id).await {
                Ok(()) | Err(PressroomError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.checkpoints.delete(workflow_id).await?;
        checkpoint.status = WorkflowStatus::Cancelled;
        checkpoint.updated_at = self.clock.now();
        info!(workflow_id = %workflow_id, "Workflow cancelled");
        Ok(checkpoint)
    }

    /// Expire every awaiting record past the validation timeout and fail its
    /// run. Returns the expired validation ids.
    ///
    /// A record that cannot be expired, for instance because it was resolved
    /// after the listing, is logged and skipped.
    pub async fn expire_stale(&self) -> PressroomResult<Vec<Uuid>> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        for record in self.validations.list_awaiting().await? {
            if !record.is_past_timeout(self.config.validation_timeout, now) {
                continue;
            }
            match self.expire_record(&record).await {
                Ok(()) => expired.push(record.validation_id),
                Err(e) => warn!(
                    workflow_id = %record.workflow_id,
                    validation_id = %record.validation_id,
                    error = %e,
                    "Skipping validation during expiry sweep"
                ),
            }
        }
        Ok(expired)
    }

    async fn expire_record(&self, record: &ValidationRecord) -> PressroomResult<()> {
        self.validations.expire(record.validation_id).await?;
        warn!(
            workflow_id = %record.workflow_id,
            validation_id = %record.validation_id,
            "Validation timed out"
        );

        let mut checkpoint = match self.checkpoints.load(record.workflow_id).await {
            Ok(cp) => cp,
            Err(PressroomError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if checkpoint.pending_validation == Some(record.validation_id) {
            checkpoint.status = WorkflowStatus::Failed;
            checkpoint.pending_validation = None;
            checkpoint.error = Some(format!(
                "validation {} expired before a decision",
                record.validation_id
            ));
            checkpoint.updated_at = self.clock.now();
            self.checkpoints.save(&checkpoint).await?;
        }
        Ok(())
    }

    /// Execute nodes from `current` on. With `resuming` set, the first node
    /// runs even if it is an interrupt point.
    async fn drive(
        &self,
        graph: &WorkflowGraph,
        mut checkpoint: Checkpoint,
        mut current: Target,
        mut resuming: bool,
    ) -> PressroomResult<WorkflowOutcome> {
        let workflow_id = checkpoint.workflow_id;
        loop {
            let node_name = match current {
                Target::End => {
                    checkpoint.status = WorkflowStatus::Completed;
                    checkpoint.next_node = None;
                    checkpoint.updated_at = self.clock.now();
                    self.checkpoints.save(&checkpoint).await?;
                    info!(workflow_id = %workflow_id, steps = checkpoint.steps, "Workflow completed");
                    return Ok(WorkflowOutcome::from(&checkpoint));
                }
                Target::Node(name) => name,
            };

            if graph.is_interrupt(&node_name) && !resuming {
                let now = self.clock.now();
                let record = ValidationRecord::new(
                    workflow_id,
                    graph.name(),
                    node_name.clone(),
                    checkpoint.state.clone(),
                    now,
                );
                let validation_id = record.validation_id;
                self.validations.put(record).await?;

                checkpoint.status = WorkflowStatus::AwaitingValidation;
                checkpoint.pending_validation = Some(validation_id);
                checkpoint.next_node = Some(node_name.clone());
                checkpoint.updated_at = now;
                if let Err(e) = self.checkpoints.save(&checkpoint).await {
                    // No checkpoint points at the record, so it must not resume anything.
                    if let Err(rollback) = self.validations.expire(validation_id).await {
                        warn!(
                            validation_id = %validation_id,
                            error = %rollback,
                            "Expiring orphaned validation failed"
                        );
                    }
                    return Err(e);
                }
                info!(
                    workflow_id = %workflow_id,
                    validation_id = %validation_id,
                    node = %node_name,
                    "Workflow paused for validation"
                );
                return Ok(WorkflowOutcome::from(&checkpoint));
            }
            resuming = false;

            if checkpoint.steps >= self.config.max_steps {
                let message = format!("exceeded {} steps", self.config.max_steps);
                return self.fail(checkpoint, node_name, message).await;
            }

            let node = graph.node(&node_name)?;
            debug!(workflow_id = %workflow_id, node = %node_name, "Running node");
            match node.run(&checkpoint.state).await {
                Ok(update) => checkpoint.state.merge(update),
                Err(e) => {
                    let message = format!("node '{node_name}' failed: {e}");
                    return self.fail(checkpoint, node_name, message).await;
                }
            }
            checkpoint.steps += 1;

            current = match graph.next(&node_name, &checkpoint.state) {
                Ok(next) => next,
                Err(e) => return self.fail(checkpoint, node_name, e.to_string()).await,
            };
            checkpoint.next_node = match &current {
                Target::Node(next) => Some(next.clone()),
                Target::End => None,
            };
            checkpoint.updated_at = self.clock.now();
            self.checkpoints.save(&checkpoint).await?;
        }
    }

    async fn fail(
        &self,
        mut checkpoint: Checkpoint,
        node: String,
        message: String,
    ) -> PressroomResult<WorkflowOutcome> {
        warn!(
            workflow_id = %checkpoint.workflow_id,
            node = %node,
            error = %message,
            "Workflow failed"
        );
        checkpoint.status = WorkflowStatus::Failed;
        checkpoint.next_node = Some(node);
        checkpoint.error = Some(message);
        checkpoint.updated_at = self.clock.now();
        self.checkpoints.save(&checkpoint).await?;
        Ok(WorkflowOutcome::from(&checkpoint))
    }
}
