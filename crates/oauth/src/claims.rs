use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use gatekeep_core::{FamilyId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenUse {
    Access,
    Refresh,
    Id,
}

impl TokenUse {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenUse::Access => "access",
            TokenUse::Refresh => "refresh",
            TokenUse::Id => "id",
        }
    }
}

/// Claims carried by every token this server signs (access, refresh and ID).
///
/// Times are seconds since the Unix epoch, as in RFC 7519.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    /// User id, or the client id for client-credentials grants.
    pub sub: String,
    /// Client id the token was issued to.
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    pub jti: Uuid,
    /// Space-delimited scope list.
    pub scope: String,
    pub token_use: TokenUse,
    pub fid: FamilyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,

    #[error("token not yet valid (iat is in the future)")]
    NotYetValid,

    #[error("invalid token time window (exp <= iat)")]
    InvalidTimeWindow,
}

/// Check the claim time window against `now` (Unix seconds).
///
/// `leeway_secs` tolerates clock skew on `iat` only; expiry is strict.
pub fn validate_claims(
    claims: &TokenClaims,
    now: i64,
    leeway_secs: i64,
) -> Result<(), TokenValidationError> {
    if claims.exp <= claims.iat {
        return Err(TokenValidationError::InvalidTimeWindow);
    }
    if now + leeway_secs < claims.iat {
        return Err(TokenValidationError::NotYetValid);
    }
    if now >= claims.exp {
        return Err(TokenValidationError::Expired);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(iat: i64, exp: i64) -> TokenClaims {
        TokenClaims {
            iss: "https://id.example.com".to_string(),
            sub: "user".to_string(),
            aud: "client".to_string(),
            exp,
            iat,
            jti: Uuid::new_v4(),
            scope: "openid".to_string(),
            token_use: TokenUse::Access,
            fid: FamilyId::new(),
            sid: None,
            nonce: None,
            auth_time: None,
            roles: vec![],
        }
    }

    #[test]
    fn time_window() {
        let c = claims(1_000, 2_000);
        assert_eq!(validate_claims(&c, 1_500, 0), Ok(()));
        assert_eq!(validate_claims(&c, 2_000, 0), Err(TokenValidationError::Expired));
        assert_eq!(validate_claims(&c, 990, 0), Err(TokenValidationError::NotYetValid));
        assert_eq!(validate_claims(&c, 990, 30), Ok(()));
        assert_eq!(
            validate_claims(&claims(2_000, 2_000), 2_000, 0),
            Err(TokenValidationError::InvalidTimeWindow)
        );
    }

    #[test]
    fn optional_claims_are_omitted_from_json() {
        let json = serde_json::to_value(claims(1, 2)).unwrap();
        assert!(json.get("nonce").is_none());
        assert!(json.get("roles").is_none());
        assert_eq!(json["token_use"], "access");
    }
}
