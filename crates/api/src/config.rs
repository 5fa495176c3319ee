//! Process configuration read from `GATEKEEP_*` environment variables.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Duration;
use tracing::warn;

use gatekeep_identity::MAX_TOKEN_TTL_SECS;
use gatekeep_infra::{EngineConfig, JwtSigner, Signer, SignerError};

const DEV_JWT_SECRET: &str = "gatekeep-dev-signing-secret-change-me";
const DEV_SESSION_SECRET: &str = "gatekeep-dev-session-secret-change-me";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: {reason}")]
    Invalid { var: &'static str, reason: String },
    #[error("{var}: cannot read key file: {source}")]
    KeyFile {
        var: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// How access, refresh and ID tokens are signed.
#[derive(Clone)]
pub enum SigningConfig {
    Hs256 { secret: String, kid: String },
    Rs256 {
        private_key_pem: String,
        public_key_pem: String,
        kid: Option<String>,
    },
}

impl std::fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningConfig::Hs256 { kid, .. } => f.debug_struct("Hs256").field("kid", kid).finish_non_exhaustive(),
            SigningConfig::Rs256 { kid, .. } => f.debug_struct("Rs256").field("kid", kid).finish_non_exhaustive(),
        }
    }
}

impl SigningConfig {
    pub fn signer(&self) -> Result<Arc<dyn Signer>, SignerError> {
        let signer = match self {
            SigningConfig::Hs256 { secret, kid } => JwtSigner::hs256(secret.as_bytes(), kid.clone()),
            SigningConfig::Rs256 {
                private_key_pem,
                public_key_pem,
                kid,
            } => JwtSigner::rs256(private_key_pem, public_key_pem, kid.clone())?,
        };
        Ok(Arc::new(signer))
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind: SocketAddr,
    pub engine: EngineConfig,
    pub signing: SigningConfig,
    /// HMAC key of the login session cookie. Never used for tokens.
    pub session_secret: String,
    pub session_ttl: Duration,
    /// Adds `Secure` to the session cookie. On unless the issuer is plain http.
    pub secure_cookies: bool,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let mut engine = EngineConfig::default();
        if let Some(issuer) = var("GATEKEEP_ISSUER") {
            engine.issuer = issuer.trim_end_matches('/').to_string();
        }
        if let Some(ttl) = seconds(&var, "GATEKEEP_ACCESS_TOKEN_TTL_SECS")? {
            engine.access_token_ttl = ttl;
        }
        if let Some(ttl) = seconds(&var, "GATEKEEP_REFRESH_TOKEN_TTL_SECS")? {
            engine.refresh_token_ttl = ttl;
        }
        if let Some(ttl) = seconds(&var, "GATEKEEP_ID_TOKEN_TTL_SECS")? {
            engine.id_token_ttl = ttl;
        }
        if let Some(ttl) = seconds(&var, "GATEKEEP_AUTHORIZATION_CODE_TTL_SECS")? {
            engine.authorization_code_ttl = ttl;
        }

        let bind = match var("GATEKEEP_BIND") {
            Some(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
                var: "GATEKEEP_BIND",
                reason: format!("{e}"),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let kid = var("GATEKEEP_KID");
        let signing = match (
            pem(&var, "GATEKEEP_JWT_PRIVATE_KEY_PEM")?,
            pem(&var, "GATEKEEP_JWT_PUBLIC_KEY_PEM")?,
        ) {
            (Some(private_key_pem), Some(public_key_pem)) => SigningConfig::Rs256 {
                private_key_pem,
                public_key_pem,
                kid,
            },
            (Some(_), None) | (None, Some(_)) => {
                return Err(ConfigError::Invalid {
                    var: "GATEKEEP_JWT_PRIVATE_KEY_PEM",
                    reason: "private and public key must be set together".to_string(),
                });
            }
            (None, None) => {
                let secret = var("GATEKEEP_JWT_SECRET").unwrap_or_else(|| {
                    warn!("GATEKEEP_JWT_SECRET not set; using insecure dev default");
                    DEV_JWT_SECRET.to_string()
                });
                SigningConfig::Hs256 {
                    secret,
                    kid: kid.unwrap_or_else(|| "hs256-1".to_string()),
                }
            }
        };

        let session_secret = var("GATEKEEP_SESSION_SECRET").unwrap_or_else(|| {
            warn!("GATEKEEP_SESSION_SECRET not set; using insecure dev default");
            DEV_SESSION_SECRET.to_string()
        });
        let session_ttl = seconds(&var, "GATEKEEP_SESSION_TTL_SECS")?.unwrap_or_else(|| Duration::hours(12));
        let secure_cookies = !engine.issuer.starts_with("http://");

        Ok(Self {
            bind,
            engine,
            signing,
            session_secret,
            session_ttl,
            secure_cookies,
        })
    }

    /// Loopback bind, fixed secrets and cheap password hashing.
    pub fn testing() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            engine: EngineConfig::testing(),
            signing: SigningConfig::Hs256 {
                secret: "test-signing-secret-0123456789abcdef".to_string(),
                kid: "test".to_string(),
            },
            session_secret: "test-session-secret-0123456789abcdef".to_string(),
            session_ttl: Duration::hours(1),
            secure_cookies: false,
        }
    }
}

/// A lifetime in whole seconds, at most [`MAX_TOKEN_TTL_SECS`].
fn seconds(var: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = var(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|secs| (1..=MAX_TOKEN_TTL_SECS).contains(secs))
        .and_then(Duration::try_seconds)
        .map(Some)
        .ok_or_else(|| ConfigError::Invalid {
            var: name,
            reason: format!("expected between 1 and {MAX_TOKEN_TTL_SECS} seconds, got {raw:?}"),
        })
}

/// A PEM given inline, or a path to a file holding it.
fn pem(var: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<String>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(value) if value.trim_start().starts_with("-----BEGIN") => Ok(Some(value)),
        Some(path) => std::fs::read_to_string(path.trim())
            .map(Some)
            .map_err(|source| ConfigError::KeyFile { var: name, source }),
    }
}
