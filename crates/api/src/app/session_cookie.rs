//! Signed login-session cookie.
//!
//! The cookie only names the session; liveness is always re-checked against
//! the session stream when it is used, so logging out elsewhere invalidates
//! it immediately.

use axum::http::{HeaderMap, header};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gatekeep_core::{SessionId, UserId};

pub const SESSION_COOKIE: &str = "gatekeep_session";

#[derive(Debug, Serialize, Deserialize)]
struct CookieClaims {
    sub: Uuid,
    sid: Uuid,
    iat: i64,
    exp: i64,
}

pub struct SessionCookies {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
    secure: bool,
}

impl std::fmt::Debug for SessionCookies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCookies")
            .field("ttl", &self.ttl)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

impl SessionCookies {
    pub fn new(secret: &[u8], ttl: Duration, secure: bool) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
            secure,
        }
    }

    /// `Set-Cookie` value for a freshly started session.
    pub fn issue(
        &self,
        user_id: UserId,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = CookieClaims {
            sub: *user_id.as_uuid(),
            sid: *session_id.as_uuid(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        let value = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;

        let mut cookie = format!(
            "{SESSION_COOKIE}={value}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.ttl.num_seconds()
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        Ok(cookie)
    }

    /// The session named by a valid, unexpired cookie, if any.
    pub fn read(&self, headers: &HeaderMap, now: DateTime<Utc>) -> Option<(UserId, SessionId)> {
        let value = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == SESSION_COOKIE)
            .map(|(_, value)| value)?;

        let mut validation = Validation::new(Algorithm::HS256);
        // expiry is checked below against the engine clock
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        let claims = decode::<CookieClaims>(value, &self.decoding, &validation).ok()?.claims;
        if claims.exp <= now.timestamp() {
            return None;
        }
        Some((UserId::from_uuid(claims.sub), SessionId::from_uuid(claims.sid)))
    }
}
