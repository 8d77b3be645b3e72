//! Core types and error definitions for Pressroom.
//!
//! This crate provides the foundational types shared across all Pressroom
//! crates: the error taxonomy, the closed sets of agent roles and task kinds,
//! the inter-agent message envelope, the injectable clock, configuration and
//! logging setup.
//!
//! # Main types
//!
//! - [`PressroomError`]: Unified error enum for queue, scheduler and workflow code.
//! - [`PressroomResult`]: Convenience alias for `Result<T, PressroomError>`.
//! - [`AgentRole`] / [`TaskKind`]: Closed sets validated at the boundary.
//! - [`AgentMessage`]: Envelope for inter-agent communication.
//! - [`Clock`]: Time source, swappable for [`ManualClock`] in tests.
//! - [`PressroomConfig`]: TOML configuration root.

/// Injectable wall clock.
pub mod clock;
/// TOML configuration.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Logging setup.
pub mod logging;
/// Inter-agent message envelope.
pub mod message;
/// Agent roles and task kinds.
pub mod types;

pub use clock::{system_clock, Clock, ManualClock, SystemClock};
pub use config::{DedupPolicy, PressroomConfig};
pub use error::{PressroomError, PressroomResult};
pub use message::AgentMessage;
pub use types::{AgentRole, TaskKind};
