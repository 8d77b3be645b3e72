//! Routing and processing on top of the Pressroom queue and workflow engine.
//!
//! - [`CommunicationRouter`] dispatches agent messages by task kind and
//!   target role.
//! - [`TaskWorker`] and [`CollectionWorker`] consume the queue and settle each
//!   task by error class.
//! - [`pipelines`] holds the built-in human-in-the-loop content workflows.

/// Built-in content workflows.
pub mod pipelines;
/// Message envelope and dispatch table.
pub mod router;
/// Queue consumers.
pub mod worker;

pub use pipelines::{
    content_routing, journalist_team, register_builtin, ContentAnalysis, ContentGenerator,
    Journalist, TeamBrief, TemplateGenerator, CONTENT_ROUTING, JOURNALIST_TEAM, MAX_TEAM_SIZE,
};
pub use router::{
    CommunicationRouter, Envelope, IdempotentHandler, MessageHandler, DEFAULT_IDEMPOTENCY_CAPACITY,
};
pub use worker::{CollectionWorker, Collector, NullCollector, Settlement, TaskWorker};
