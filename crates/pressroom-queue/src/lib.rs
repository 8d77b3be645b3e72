//! Task queue, admission control and periodic scheduling for Pressroom.
//!
//! # Main types
//!
//! - [`Task`] / [`TaskStatus`]: One unit of work and its lifecycle.
//! - [`Broker`]: Exclusive-claim queue with retry-aware acknowledgement,
//!   backed by [`MemoryBroker`] or [`FileBroker`].
//! - [`QueueManager`]: Concurrency ceiling, per-source rate limit and
//!   de-duplication for collection jobs.
//! - [`Scheduler`]: Fires one job per registered source on each tick, never
//!   overlapping ticks.

/// Broker trait and the in-memory backend.
pub mod broker;
/// JSON-file broker backend.
pub mod file_broker;
/// Admission control for collection jobs.
pub mod manager;
/// Per-source start spacing.
pub mod rate_limit;
/// Timer-driven job scheduler.
pub mod scheduler;
/// Task record and status machine.
pub mod task;

pub use broker::{Broker, MemoryBroker, QueueCounts, TaskFilter, DEFAULT_RETRY_DELAY};
pub use file_broker::FileBroker;
pub use manager::{AdmissionConfig, QueueManager};
pub use rate_limit::IntervalLimiter;
pub use scheduler::{
    IntervalTimer, JobSink, ManualTimer, ScheduledSource, Scheduler, TickReport, Ticker, Timer,
};
pub use task::{EnqueueRequest, Task, TaskDefaults, TaskStatus, TaskStatusReport};
