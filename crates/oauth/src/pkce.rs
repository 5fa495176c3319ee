//! Proof Key for Code Exchange (RFC 7636).

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use gatekeep_core::DomainError;

const MIN_LEN: usize = 43;
const MAX_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PkceMethod {
    #[serde(rename = "S256")]
    S256,
    #[serde(rename = "plain")]
    Plain,
}

impl PkceMethod {
    /// Absent method means `plain`, per RFC 7636 §4.3.
    pub fn parse(raw: Option<&str>) -> Result<Self, DomainError> {
        match raw {
            None | Some("plain") => Ok(PkceMethod::Plain),
            Some("S256") => Ok(PkceMethod::S256),
            Some(other) => Err(DomainError::validation(format!(
                "unsupported code_challenge_method: {other}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PkceMethod::S256 => "S256",
            PkceMethod::Plain => "plain",
        }
    }
}

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

fn well_formed(value: &str) -> bool {
    (MIN_LEN..=MAX_LEN).contains(&value.len()) && value.chars().all(is_unreserved)
}

/// `base64url(SHA-256(verifier))`, no padding.
pub fn s256(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// A challenge bound to an authorization request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceChallenge {
    pub challenge: String,
    pub method: PkceMethod,
}

impl PkceChallenge {
    pub fn new(challenge: impl Into<String>, method: PkceMethod) -> Result<Self, DomainError> {
        let challenge = challenge.into();
        if !well_formed(&challenge) {
            return Err(DomainError::validation("malformed code_challenge"));
        }
        Ok(Self { challenge, method })
    }

    /// Check a presented verifier. Malformed verifiers never match.
    pub fn verify(&self, verifier: &str) -> bool {
        if !well_formed(verifier) {
            return false;
        }
        let derived = match self.method {
            PkceMethod::S256 => s256(verifier),
            PkceMethod::Plain => verifier.to_string(),
        };
        bool::from(derived.as_bytes().ct_eq(self.challenge.as_bytes()))
    }
}
