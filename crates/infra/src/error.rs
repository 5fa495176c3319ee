//! Engine error taxonomy and its OAuth2 mapping.
//!
//! Every failure an engine operation can surface maps deterministically to one
//! RFC 6749 error code. Unknown subjects and bad credentials share a code so
//! the boundary cannot be used to enumerate accounts.

use gatekeep_core::DomainError;

use crate::command_dispatcher::DispatchError;
use crate::context::CallError;
use crate::event_store::EventStoreError;
use crate::signer::SignerError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("client authentication failed")]
    InvalidClient,

    #[error("invalid grant: {0}")]
    InvalidGrant(String),

    #[error("client is not authorized for this request: {0}")]
    UnauthorizedClient(String),

    #[error("unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    /// Bad credentials, failed proof, inactive account. Carries no detail.
    #[error("authentication failed")]
    AuthFailed,

    /// Uniqueness collision (email or external identity already taken).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found")]
    NotFound,

    /// Retries exhausted, deadline hit or dependency down. Safe to retry.
    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn invalid_grant(msg: impl Into<String>) -> Self {
        Self::InvalidGrant(msg.into())
    }

    /// RFC 6749 §5.2 error code.
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            EngineError::InvalidRequest(_) | EngineError::Conflict(_) => "invalid_request",
            EngineError::InvalidClient => "invalid_client",
            EngineError::InvalidGrant(_) | EngineError::AuthFailed | EngineError::NotFound => {
                "invalid_grant"
            }
            EngineError::UnauthorizedClient(_) => "unauthorized_client",
            EngineError::UnsupportedGrantType(_) => "unsupported_grant_type",
            EngineError::InvalidScope(_) => "invalid_scope",
            EngineError::Unavailable(_) => "temporarily_unavailable",
            EngineError::Internal(_) => "server_error",
        }
    }

    /// Description safe to hand to a caller. Auth-type failures and internal
    /// errors never carry detail.
    pub fn public_description(&self) -> Option<String> {
        match self {
            EngineError::InvalidRequest(msg)
            | EngineError::UnauthorizedClient(msg)
            | EngineError::UnsupportedGrantType(msg)
            | EngineError::InvalidScope(msg)
            | EngineError::Conflict(msg) => Some(msg.clone()),
            EngineError::InvalidGrant(_) | EngineError::AuthFailed | EngineError::NotFound => {
                Some("the provided grant or credentials are invalid".to_string())
            }
            EngineError::InvalidClient => Some("client authentication failed".to_string()),
            EngineError::Unavailable(_) | EngineError::Internal(_) => None,
        }
    }

    pub fn is_server_side(&self) -> bool {
        matches!(self, EngineError::Unavailable(_) | EngineError::Internal(_))
    }
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvariantViolation(msg) | DomainError::InvalidId(msg) => {
                EngineError::InvalidRequest(msg)
            }
            DomainError::NotFound => EngineError::NotFound,
            DomainError::Conflict(msg) => EngineError::Conflict(msg),
            DomainError::Unauthorized => EngineError::UnauthorizedClient("operation not permitted".to_string()),
            DomainError::Authentication => EngineError::AuthFailed,
            DomainError::Expired(msg) | DomainError::Revoked(msg) => EngineError::InvalidGrant(msg),
        }
    }
}

impl From<DispatchError> for EngineError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Domain(e) => e.into(),
            DispatchError::Concurrency { attempts } => {
                EngineError::Unavailable(format!("write contention persisted after {attempts} attempts"))
            }
            DispatchError::Timeout(dep) => EngineError::Unavailable(format!("{} timed out", dep.as_str())),
            DispatchError::Cancelled => EngineError::Unavailable("call cancelled".to_string()),
            DispatchError::Store(EventStoreError::Unavailable(msg)) => EngineError::Unavailable(msg),
            DispatchError::Store(other) => EngineError::Internal(other.to_string()),
            DispatchError::Rehydration(msg) | DispatchError::Handler(msg) => EngineError::Internal(msg),
        }
    }
}

impl From<CallError> for EngineError {
    fn from(value: CallError) -> Self {
        DispatchError::from(value).into()
    }
}

impl From<SignerError> for EngineError {
    fn from(value: SignerError) -> Self {
        match value {
            SignerError::Unavailable(msg) => EngineError::Unavailable(msg),
            other => EngineError::Internal(other.to_string()),
        }
    }
}

/// Why a presented token did not verify.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("token expired")]
    Expired,
    #[error("token malformed")]
    Malformed,
    #[error("token revoked")]
    Revoked,
    #[error("token signature invalid")]
    SignatureInvalid,
    /// The verdict could not be reached (store or signer down, deadline hit).
    #[error("verification unavailable: {0}")]
    Unavailable(String),
}

impl From<SignerError> for VerifyError {
    fn from(value: SignerError) -> Self {
        match value {
            SignerError::Malformed => VerifyError::Malformed,
            SignerError::SignatureInvalid => VerifyError::SignatureInvalid,
            SignerError::Key(msg) | SignerError::Unavailable(msg) => VerifyError::Unavailable(msg),
        }
    }
}

impl From<CallError> for VerifyError {
    fn from(value: CallError) -> Self {
        VerifyError::Unavailable(value.to_string())
    }
}

impl From<DispatchError> for VerifyError {
    fn from(value: DispatchError) -> Self {
        VerifyError::Unavailable(value.to_string())
    }
}
