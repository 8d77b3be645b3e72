//! Checkpointed, interruptible workflows for Pressroom.
//!
//! A workflow is a [`WorkflowGraph`] of [`Node`]s joined by an edge table.
//! The [`WorkflowEngine`] threads a [`WorkflowState`] through it, persisting a
//! [`Checkpoint`] after every node. Before an interrupt node it writes a
//! [`ValidationRecord`] and returns; [`WorkflowEngine::resume`] picks the run
//! up again once a human decision arrives, in this process or another.

/// Checkpoint record and stores.
pub mod checkpoint;
/// Graph execution.
pub mod engine;
mod fs;
/// Node registry and edge table.
pub mod graph;
/// Workflow state map.
pub mod state;
/// Human-in-the-loop validation records and stores.
pub mod validation;

pub use checkpoint::{
    Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, WorkflowStatus,
};
pub use engine::{EngineConfig, WorkflowEngine, WorkflowOutcome};
pub use graph::{node_fn, Edge, FnNode, GraphBuilder, Node, Target, WorkflowGraph};
pub use state::{StateUpdate, WorkflowState};
pub use validation::{
    FileValidationStore, MemoryValidationStore, ValidationRecord, ValidationStore,
};
