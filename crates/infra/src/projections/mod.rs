//! Projections fed from the event bus.
//!
//! Both consumers lag the event store and are safe under at-least-once
//! delivery when run behind a [`gatekeep_events::ProjectionRunner`].
//! Revocation and authentication never read from here.

pub mod audit;
pub mod users;

pub use audit::AuditProjector;
pub use users::{UserReadModel, UsersProjection};
