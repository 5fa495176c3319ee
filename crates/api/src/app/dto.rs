use serde::Deserialize;
use serde_json::json;

use gatekeep_identity::{Client, ClientCredential, ClientType, GrantType, ScopeSet};
use gatekeep_infra::EngineError;
use gatekeep_infra::projections::UserReadModel;
use gatekeep_infra::services::{AuthorizeRequest, ClientRegistration, RegisteredClient, TokenRequest};
use gatekeep_oauth::Session;

// ─────────────────────────────────────────────────────────────────────────────
// OAuth2 endpoints
// ─────────────────────────────────────────────────────────────────────────────

/// Query string of `GET /oauth2/authorize`. Missing parameters become empty
/// strings and are rejected by the engine with the proper error channel.
#[derive(Debug, Deserialize, Default)]
pub struct AuthorizeQuery {
    #[serde(default)]
    pub response_type: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
}

impl From<AuthorizeQuery> for AuthorizeRequest {
    fn from(q: AuthorizeQuery) -> Self {
        AuthorizeRequest {
            response_type: q.response_type,
            client_id: q.client_id,
            redirect_uri: q.redirect_uri,
            scope: q.scope,
            state: q.state,
            code_challenge: q.code_challenge,
            code_challenge_method: q.code_challenge_method,
            nonce: q.nonce,
        }
    }
}

/// `application/x-www-form-urlencoded` body of `POST /oauth2/token`.
#[derive(Debug, Deserialize, Default)]
pub struct TokenForm {
    pub grant_type: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_assertion_type: Option<String>,
    pub client_assertion: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

impl TokenForm {
    pub fn into_request(self, credentials: ClientCredentials) -> Result<TokenRequest, EngineError> {
        let grant_type = self
            .grant_type
            .filter(|g| !g.is_empty())
            .ok_or_else(|| EngineError::invalid_request("grant_type is required"))?;
        Ok(TokenRequest {
            grant_type,
            client_id: credentials.client_id,
            client_secret: credentials.client_secret,
            client_assertion: credentials.client_assertion,
            code: self.code,
            redirect_uri: self.redirect_uri,
            code_verifier: self.code_verifier,
            refresh_token: self.refresh_token,
            scope: self.scope,
        })
    }
}

/// Body of `POST /oauth2/introspect` and `POST /oauth2/revoke`.
#[derive(Debug, Deserialize, Default)]
pub struct TokenHandleForm {
    pub token: Option<String>,
    /// Accepted and ignored: every token is self-describing.
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_assertion_type: Option<String>,
    pub client_assertion: Option<String>,
}

/// Client credentials resolved from HTTP Basic or the form body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
    /// RFC 7523 `private_key_jwt` assertion.
    pub client_assertion: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Account endpoints
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    /// Stable device label; the user agent is used when absent.
    pub device: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterClientRequest {
    pub name: String,
    pub client_type: ClientType,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// Space-delimited scopes the client may request.
    pub scope: String,
    pub grant_types: Vec<GrantType>,
    pub require_pkce: Option<bool>,
    pub access_token_ttl_secs: Option<i64>,
    pub refresh_token_ttl_secs: Option<i64>,
    /// Register a key for `private_key_jwt` instead of receiving a secret.
    pub public_key_pem: Option<String>,
}

impl RegisterClientRequest {
    pub fn into_registration(self) -> Result<ClientRegistration, EngineError> {
        let allowed_scopes = ScopeSet::parse(&self.scope)?;
        Ok(ClientRegistration {
            name: self.name,
            client_type: self.client_type,
            redirect_uris: self.redirect_uris,
            allowed_scopes,
            grant_types: self.grant_types,
            require_pkce: self.require_pkce.unwrap_or(true),
            access_token_ttl_secs: self.access_token_ttl_secs,
            refresh_token_ttl_secs: self.refresh_token_ttl_secs,
            public_key_pem: self.public_key_pem,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON mapping
// ─────────────────────────────────────────────────────────────────────────────

pub fn user_to_json(user: &UserReadModel) -> serde_json::Value {
    json!({
        "user_id": user.user_id.to_string(),
        "email": user.email,
        "roles": user.roles,
        "active": user.active,
        "registered_at": user.registered_at,
    })
}

/// The plaintext secret is included exactly once, in the registration response.
pub fn registered_client_to_json(registered: &RegisteredClient) -> serde_json::Value {
    let client = &registered.client;
    let mut body = json!({
        "client_id": client.id.to_string(),
        "client_type": client.client_type,
        "redirect_uris": client.redirect_uris,
        "scope": client.allowed_scopes.to_string(),
        "grant_types": client.grant_types.iter().map(|g| g.as_str()).collect::<Vec<_>>(),
        "require_pkce": client.require_pkce,
        "token_endpoint_auth_method": token_endpoint_auth_method(client),
    });
    if let Some(secret) = &registered.client_secret {
        body["client_secret"] = json!(secret);
    }
    body
}

fn token_endpoint_auth_method(client: &Client) -> &'static str {
    match &client.credential {
        Some(ClientCredential::PublicKey { .. }) => "private_key_jwt",
        Some(ClientCredential::SecretDigest { .. }) => "client_secret_basic",
        None => "none",
    }
}

pub fn session_to_json(session: &Session, current: bool) -> serde_json::Value {
    json!({
        "session_id": session.session_id.to_string(),
        "device": session.device_fingerprint,
        "created_at": session.created_at,
        "last_seen_at": session.last_seen_at,
        "current": current,
    })
}
