//! Authorization endpoint flow: validate, consent, issue code.
//!
//! Errors split the way RFC 6749 §4.1.2.1 requires: while the client or its
//! redirect URI cannot be trusted the error goes straight back to the user
//! agent; after that it is delivered to the client by redirect.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use url::Url;

use gatekeep_core::{ClientId, RequestId, SessionId, UserId};
use gatekeep_identity::{Client, GrantType, ScopeSet};
use gatekeep_oauth::authorization::{CreateAuthorization, IssueCode, RecordConsent};
use gatekeep_oauth::{
    AuthorizationCode, AuthorizationCommand, AuthorizationEvent, AuthorizationRequest, PkceChallenge,
    PkceMethod,
};

use crate::command_dispatcher::Dispatched;
use crate::context::CallContext;
use crate::error::EngineError;

use super::{ClientService, EngineDeps, SessionManager};

/// Query parameters of `GET /oauth2/authorize`.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeRequest {
    pub response_type: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
}

/// A redirect back to the client: `redirect_uri` plus query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRedirect {
    pub redirect_uri: String,
    pub params: Vec<(String, String)>,
}

impl AuthorizationRedirect {
    fn error(redirect_uri: &str, error: &str, description: Option<String>, state: Option<&str>) -> Self {
        let mut params = vec![("error".to_string(), error.to_string())];
        if let Some(description) = description {
            params.push(("error_description".to_string(), description));
        }
        if let Some(state) = state {
            params.push(("state".to_string(), state.to_string()));
        }
        Self {
            redirect_uri: redirect_uri.to_string(),
            params,
        }
    }

    pub fn to_url(&self) -> Result<Url, EngineError> {
        let mut url = Url::parse(&self.redirect_uri)
            .map_err(|e| EngineError::Internal(format!("stored redirect uri unparsable: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            for (k, v) in &self.params {
                query.append_pair(k, v);
            }
        }
        Ok(url)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum AuthorizeError {
    /// Unknown client or unregistered redirect URI: never redirect.
    Direct(EngineError),
    /// Reported to the client through its redirect URI.
    Redirect(AuthorizationRedirect),
}

impl AuthorizeError {
    fn redirect(req: &AuthorizeRequest, error: &str, description: impl Into<String>) -> Self {
        AuthorizeError::Redirect(AuthorizationRedirect::error(
            &req.redirect_uri,
            error,
            Some(description.into()),
            req.state.as_deref(),
        ))
    }

    fn from_engine(req: &AuthorizeRequest, err: EngineError) -> Self {
        if err.is_server_side() {
            return AuthorizeError::redirect(req, err.oauth_error_code(), "try again later");
        }
        let description = err.public_description().unwrap_or_default();
        AuthorizeError::redirect(req, err.oauth_error_code(), description)
    }
}

/// A freshly issued authorization code, ready to redirect.
#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub request_id: RequestId,
    pub code: String,
    pub redirect_uri: String,
    pub state: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl IssuedCode {
    pub fn redirect(&self) -> AuthorizationRedirect {
        let mut params = vec![("code".to_string(), self.code.clone())];
        if let Some(state) = &self.state {
            params.push(("state".to_string(), state.clone()));
        }
        AuthorizationRedirect {
            redirect_uri: self.redirect_uri.clone(),
            params,
        }
    }
}

#[derive(Clone)]
pub struct AuthorizationService {
    deps: Arc<EngineDeps>,
    clients: ClientService,
    sessions: SessionManager,
}

impl AuthorizationService {
    pub(crate) fn new(deps: Arc<EngineDeps>, clients: ClientService, sessions: SessionManager) -> Self {
        Self {
            deps,
            clients,
            sessions,
        }
    }

    /// Full authorize step for an authenticated user with a live session:
    /// validate, record consent, issue the code.
    #[instrument(
        skip(self, ctx, req),
        fields(correlation_id = %ctx.correlation_id(), client_id = %req.client_id, %user_id),
        err(Debug)
    )]
    pub async fn authorize(
        &self,
        ctx: &CallContext,
        req: &AuthorizeRequest,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<IssuedCode, AuthorizeError> {
        let request_id = self.begin(ctx, req).await?;

        let sessions = self
            .sessions
            .load(ctx, user_id)
            .await
            .map_err(|e| AuthorizeError::from_engine(req, e.into()))?;
        let auth_time = match sessions.ensure_live(&session_id) {
            Ok(session) => session.last_seen_at,
            Err(_) => return Err(AuthorizeError::redirect(req, "login_required", "session is not active")),
        };

        self.consent(ctx, request_id, user_id, Some(session_id), auth_time)
            .await
            .map_err(|e| AuthorizeError::from_engine(req, e))
    }

    /// Validate the request and open an authorization request stream.
    #[instrument(
        skip(self, ctx, req),
        fields(correlation_id = %ctx.correlation_id(), client_id = %req.client_id),
        err(Debug)
    )]
    pub async fn begin(&self, ctx: &CallContext, req: &AuthorizeRequest) -> Result<RequestId, AuthorizeError> {
        let client = self.trusted_client(ctx, req).await?;

        if req.response_type != "code" {
            return Err(AuthorizeError::redirect(
                req,
                "unsupported_response_type",
                "only response_type=code is supported",
            ));
        }
        if !client.allows_grant(GrantType::AuthorizationCode) {
            return Err(AuthorizeError::redirect(
                req,
                "unauthorized_client",
                "client may not use the authorization code grant",
            ));
        }

        let scopes = ScopeSet::parse(req.scope.as_deref().unwrap_or_default())
            .map_err(|_| AuthorizeError::redirect(req, "invalid_scope", "malformed scope"))?;
        if scopes.is_empty() || !scopes.is_subset_of(&client.allowed_scopes) {
            return Err(AuthorizeError::redirect(req, "invalid_scope", "requested scope is not allowed"));
        }

        let pkce = match (&req.code_challenge, req.code_challenge_method.as_deref()) {
            (Some(challenge), method) => {
                let method = PkceMethod::parse(method).map_err(|_| {
                    AuthorizeError::redirect(req, "invalid_request", "unsupported code_challenge_method")
                })?;
                Some(
                    PkceChallenge::new(challenge.clone(), method)
                        .map_err(|_| AuthorizeError::redirect(req, "invalid_request", "malformed code_challenge"))?,
                )
            }
            (None, Some(_)) => {
                return Err(AuthorizeError::redirect(
                    req,
                    "invalid_request",
                    "code_challenge_method without code_challenge",
                ));
            }
            (None, None) => None,
        };

        let request_id = RequestId::new();
        let now = self.deps.now();
        self.deps
            .dispatcher
            .dispatch::<AuthorizationRequest>(
                ctx,
                request_id,
                AuthorizationCommand::Create(CreateAuthorization {
                    request_id,
                    client,
                    redirect_uri: req.redirect_uri.clone(),
                    scopes,
                    pkce,
                    state: req.state.clone(),
                    nonce: req.nonce.clone(),
                    expires_at: now + self.deps.config.authorization_request_ttl,
                    occurred_at: now,
                }),
            )
            .await
            .map_err(|e| AuthorizeError::from_engine(req, e.into()))?;

        info!(%request_id, "authorization request created");
        Ok(request_id)
    }

    /// Record the user's approval and issue a single-use code.
    #[instrument(
        skip(self, ctx),
        fields(correlation_id = %ctx.correlation_id(), %request_id, %user_id),
        err
    )]
    pub async fn consent(
        &self,
        ctx: &CallContext,
        request_id: RequestId,
        user_id: UserId,
        session_id: Option<SessionId>,
        auth_time: DateTime<Utc>,
    ) -> Result<IssuedCode, EngineError> {
        let consented = self
            .transition(
                ctx,
                request_id,
                AuthorizationCommand::Consent(RecordConsent {
                    user_id,
                    session_id,
                    auth_time,
                    occurred_at: self.deps.now(),
                }),
            )
            .await?;
        ensure_not_expired(&consented)?;

        let code = AuthorizationCode::generate(request_id);
        let now = self.deps.now();
        let expires_at = now + self.deps.config.authorization_code_ttl;
        let issued = self
            .transition(
                ctx,
                request_id,
                AuthorizationCommand::IssueCode(IssueCode {
                    code_digest: AuthorizationCode::digest(&code),
                    expires_at,
                    occurred_at: now,
                }),
            )
            .await?;
        ensure_not_expired(&issued)?;

        info!("authorization code issued");
        Ok(IssuedCode {
            request_id,
            code,
            redirect_uri: issued.state.redirect_uri.clone(),
            state: issued.state.state.clone(),
            expires_at,
        })
    }

    /// The user declined. Returns the `access_denied` redirect.
    #[instrument(skip(self, ctx), fields(correlation_id = %ctx.correlation_id(), %request_id), err)]
    pub async fn deny(&self, ctx: &CallContext, request_id: RequestId) -> Result<AuthorizationRedirect, EngineError> {
        let out = self
            .transition(
                ctx,
                request_id,
                AuthorizationCommand::Deny {
                    occurred_at: self.deps.now(),
                },
            )
            .await?;
        Ok(AuthorizationRedirect::error(
            &out.state.redirect_uri,
            "access_denied",
            Some("the user denied the request".to_string()),
            out.state.state.as_deref(),
        ))
    }

    async fn transition(
        &self,
        ctx: &CallContext,
        request_id: RequestId,
        command: AuthorizationCommand,
    ) -> Result<Dispatched<AuthorizationRequest>, EngineError> {
        Ok(self
            .deps
            .dispatcher
            .dispatch::<AuthorizationRequest>(ctx, request_id, command)
            .await?)
    }

    /// Client and redirect URI checks. Failures here must not redirect.
    async fn trusted_client(&self, ctx: &CallContext, req: &AuthorizeRequest) -> Result<Client, AuthorizeError> {
        let client_id = req
            .client_id
            .parse::<ClientId>()
            .map_err(|_| AuthorizeError::Direct(EngineError::InvalidClient))?;
        let client = match self.clients.get(ctx, client_id).await {
            Ok(client) if client.active => client,
            Ok(_) | Err(EngineError::NotFound) => return Err(AuthorizeError::Direct(EngineError::InvalidClient)),
            Err(other) => return Err(AuthorizeError::Direct(other)),
        };
        if !client.allows_redirect(&req.redirect_uri) {
            warn!(client_id = %client.id, "authorize with unregistered redirect_uri");
            return Err(AuthorizeError::Direct(EngineError::invalid_request(
                "redirect_uri is not registered for this client",
            )));
        }
        Ok(client)
    }
}

fn ensure_not_expired(out: &Dispatched<AuthorizationRequest>) -> Result<(), EngineError> {
    match out.events.first() {
        Some(AuthorizationEvent::Expired { .. }) => Err(EngineError::invalid_grant("authorization request expired")),
        _ => Ok(()),
    }
}
