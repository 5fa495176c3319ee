//! Engine configuration.
//!
//! Every policy threshold the engine applies lives here with a documented
//! default; nothing in the services hard-codes a TTL or a password rule.

use chrono::Duration;

use gatekeep_identity::{MAX_TOKEN_TTL_SECS, PasswordHashing, PasswordPolicy};

use crate::context::DependencyTimeouts;
use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `iss` of every issued token and the discovery `issuer`.
    pub issuer: String,
    /// Lifetime of an authorization request before consent.
    pub authorization_request_ttl: Duration,
    /// Lifetime of an issued authorization code (default 5 minutes).
    pub authorization_code_ttl: Duration,
    /// Default access-token lifetime; a client may override it.
    pub access_token_ttl: Duration,
    /// Default refresh-token lifetime; a client may override it.
    pub refresh_token_ttl: Duration,
    pub id_token_ttl: Duration,
    /// Tolerance applied to `exp`/`iat` during verification.
    pub clock_skew_leeway: Duration,
    pub max_conflict_retries: u32,
    pub timeouts: DependencyTimeouts,
    pub password_policy: PasswordPolicy,
    pub password_hashing: PasswordHashing,
    /// How long finished requests and expired families are kept for audit.
    pub retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:8080".to_string(),
            authorization_request_ttl: Duration::minutes(10),
            authorization_code_ttl: Duration::minutes(5),
            access_token_ttl: Duration::minutes(15),
            refresh_token_ttl: Duration::days(30),
            id_token_ttl: Duration::minutes(15),
            clock_skew_leeway: Duration::seconds(30),
            max_conflict_retries: 3,
            timeouts: DependencyTimeouts::default(),
            password_policy: PasswordPolicy::default(),
            password_hashing: PasswordHashing::default(),
            retention: Duration::days(7),
        }
    }
}

impl EngineConfig {
    /// Cheap hashing and a length-only password policy.
    pub fn testing() -> Self {
        Self {
            password_policy: PasswordPolicy::lenient(),
            password_hashing: PasswordHashing::testing(),
            ..Self::default()
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// Reject lifetimes that are not positive or exceed the client override
    /// bound, so minting can never overflow the calendar.
    pub fn validate(&self) -> Result<(), EngineError> {
        let max = Duration::seconds(MAX_TOKEN_TTL_SECS);
        let lifetimes = [
            ("authorization_request_ttl", self.authorization_request_ttl),
            ("authorization_code_ttl", self.authorization_code_ttl),
            ("access_token_ttl", self.access_token_ttl),
            ("refresh_token_ttl", self.refresh_token_ttl),
            ("id_token_ttl", self.id_token_ttl),
            ("retention", self.retention),
        ];
        for (name, ttl) in lifetimes {
            if ttl <= Duration::zero() || ttl > max {
                return Err(EngineError::invalid_request(format!(
                    "{name} must be between 1 and {MAX_TOKEN_TTL_SECS} seconds"
                )));
            }
        }
        if self.clock_skew_leeway < Duration::zero() || self.clock_skew_leeway > max {
            return Err(EngineError::invalid_request("clock_skew_leeway is out of range"));
        }
        Ok(())
    }

    /// Access-token lifetime for a client, honouring its override.
    pub fn access_ttl_for(&self, client_override_secs: Option<i64>) -> Duration {
        client_override_secs
            .and_then(Duration::try_seconds)
            .unwrap_or(self.access_token_ttl)
    }

    pub fn refresh_ttl_for(&self, client_override_secs: Option<i64>) -> Duration {
        client_override_secs
            .and_then(Duration::try_seconds)
            .unwrap_or(self.refresh_token_ttl)
    }
}
