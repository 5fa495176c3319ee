//! `gatekeep-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! aggregate traits, optimistic-concurrency expectations, the domain error
//! model, strongly-typed identifiers and the injected clock contract.

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, ClientId, FamilyId, RequestId, SessionId, UserId, derive_id};
