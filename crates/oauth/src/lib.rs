//! `gatekeep-oauth`: OAuth2/OIDC protocol state, as event-sourced aggregates.
//!
//! - [`authorization::AuthorizationRequest`]: the authorization-code grant.
//! - [`family::TokenFamily`]: issued tokens, rotation and revocation.
//! - [`session::UserSessions`]: device sessions of one user.
//!
//! Signing, storage and time live outside; everything here is deterministic.

pub mod authorization;
pub mod claims;
pub mod family;
pub mod pkce;
pub mod session;

pub use authorization::{
    AuthorizationCode, AuthorizationCommand, AuthorizationEvent, AuthorizationRequest,
    AuthorizationStatus, RevocationReason,
};
pub use claims::{TokenClaims, TokenUse, TokenValidationError, validate_claims};
pub use family::{
    FamilyGrant, FamilyRevocationReason, IssuedToken, TokenFamily, TokenFamilyCommand,
    TokenFamilyEvent,
};
pub use pkce::{PkceChallenge, PkceMethod};
pub use session::{Session, SessionCommand, SessionEvent, UserSessions, sessions_stream_id};
