//! Domain events, envelopes, fan-out and side-effect sinks.
//!
//! The event store (in `gatekeep-infra`) is the source of truth. Everything in
//! this crate is about what happens *after* a commit: distributing envelopes to
//! read models and to fire-and-forget consumers such as audit and email.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod projection;
pub mod runner;
pub mod sink;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use projection::Projection;
pub use runner::{ProjectionCursor, ProjectionError, ProjectionRunner};
pub use sink::{
    AuditRecord, AuditSink, AuditSeverity, EmailNotifier, EmailTemplate, InMemoryAuditSink,
    InMemoryEmailNotifier, SinkError, TracingAuditSink, TracingEmailNotifier,
};
