//! `gatekeep-identity`: users, OAuth clients and uniqueness claims.
//!
//! Pure domain crate: aggregates decide and evolve, nothing here performs IO
//! except password hashing, which is CPU-only.

pub mod claim;
pub mod client;
pub mod password;
pub mod roles;
pub mod scope;
pub mod user;

pub use claim::{ClaimCommand, ClaimEvent, ClaimKind, UniqueClaim, external_identity_key};
pub use client::{
    Client, ClientCommand, ClientCredential, ClientEvent, ClientType, GrantType,
    MAX_TOKEN_TTL_SECS, RegisterClient, digest_secret, validate_redirect_uri,
};
pub use password::{PasswordHasher, PasswordHashing, PasswordPolicy, verify_password};
pub use roles::Role;
pub use scope::{OPENID, ScopeSet};
pub use user::{LinkedIdentity, User, UserCommand, UserEvent, normalize_email};
