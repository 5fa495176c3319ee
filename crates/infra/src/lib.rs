//! Infrastructure and engine layer: event store, command dispatch, signing,
//! the IAM engine services and the read side.
//!
//! Pure domain logic lives in `gatekeep-identity` and `gatekeep-oauth`; this
//! crate performs all IO and owns every collaborator contract.

pub mod command_dispatcher;
pub mod config;
pub mod context;
pub mod error;
pub mod event_store;
pub mod external;
pub mod projections;
pub mod read_model;
pub mod services;
pub mod signer;
pub mod workers;

pub use command_dispatcher::{CommandDispatcher, DispatchError, Dispatched};
pub use config::EngineConfig;
pub use context::{CallContext, CallError, Dependency, DependencyTimeouts};
pub use error::{EngineError, VerifyError};
pub use services::{Engine, EngineBuilder};
pub use signer::{JwtSigner, Signer, SignerError};
