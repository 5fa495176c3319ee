use gatekeep_core::{SessionId, UserId};
use gatekeep_oauth::TokenClaims;

/// Header carrying the correlation id in and out of the service.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Authenticated end user behind a bearer access token.
///
/// Only tokens minted through the authorization-code flow carry a session,
/// so client-credentials tokens never produce a principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    user_id: UserId,
    session_id: SessionId,
    client_id: String,
    scopes: Vec<String>,
    roles: Vec<String>,
}

impl PrincipalContext {
    pub fn from_claims(claims: &TokenClaims) -> Option<Self> {
        let user_id = claims.sub.parse::<UserId>().ok()?;
        let session_id = claims.sid?;
        Some(Self {
            user_id,
            session_id,
            client_id: claims.aud.clone(),
            scopes: claims.scope.split_whitespace().map(str::to_string).collect(),
            roles: claims.roles.clone(),
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

#[cfg(test)]
mod tests {
    use gatekeep_core::FamilyId;
    use gatekeep_oauth::TokenUse;
    use uuid::Uuid;

    use super::*;

    fn claims(sid: Option<SessionId>) -> TokenClaims {
        TokenClaims {
            iss: "http://localhost:8080".to_string(),
            sub: UserId::new().to_string(),
            aud: "client-1".to_string(),
            exp: 2_000_000_000,
            iat: 1_700_000_000,
            jti: Uuid::now_v7(),
            scope: "openid email".to_string(),
            token_use: TokenUse::Access,
            fid: FamilyId::new(),
            sid,
            nonce: None,
            auth_time: None,
            roles: vec!["admin".to_string()],
        }
    }

    #[test]
    fn principal_requires_a_session() {
        assert!(PrincipalContext::from_claims(&claims(None)).is_none());

        let sid = SessionId::new();
        let principal = PrincipalContext::from_claims(&claims(Some(sid))).unwrap();
        assert_eq!(principal.session_id(), sid);
        assert!(principal.has_scope("email"));
        assert!(!principal.has_scope("profile"));
        assert_eq!(principal.roles(), ["admin".to_string()]);
    }
}
