//! Token endpoint, verification, introspection and revocation.
//!
//! Tokens are signed before the family stream records them; a token whose
//! family append never landed simply fails verification. Every revocation
//! check reads the event store directly (family, session, client streams),
//! never a projection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use gatekeep_core::{DomainError, FamilyId, RequestId, UserId};
use gatekeep_events::AuditRecord;
use gatekeep_identity::{Client, GrantType, ScopeSet, User};
use gatekeep_oauth::authorization::RedeemCode;
use gatekeep_oauth::family::{FamilyRevocationReason, TokenFamilyCommand, TokenFamilyEvent};
use gatekeep_oauth::{
    AuthorizationCode, AuthorizationCommand, AuthorizationEvent, AuthorizationRequest, AuthorizationStatus,
    FamilyGrant, IssuedToken, TokenClaims, TokenFamily, TokenUse, TokenValidationError, validate_claims,
};

use crate::command_dispatcher::DispatchError;
use crate::context::{CallContext, Dependency};
use crate::error::{EngineError, VerifyError};

use super::{ClientProof, ClientService, EngineDeps, SessionManager};

/// RFC 6749 §5.1 success body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub scope: String,
}

/// Form parameters of a token endpoint call, client credentials included.
#[derive(Debug, Clone, Default)]
pub struct TokenRequest {
    pub grant_type: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    /// `private_key_jwt` assertion, already checked for the jwt-bearer type.
    pub client_assertion: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

/// RFC 7662 response. Inactive tokens carry nothing but `active: false`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Introspection {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<&'static str>,
}

impl Introspection {
    pub fn inactive() -> Self {
        Self::default()
    }

    fn active(claims: &TokenClaims) -> Self {
        Self {
            active: true,
            scope: Some(claims.scope.clone()),
            client_id: Some(claims.aud.clone()),
            sub: Some(claims.sub.clone()),
            exp: Some(claims.exp),
            iat: Some(claims.iat),
            iss: Some(claims.iss.clone()),
            jti: Some(claims.jti.to_string()),
            token_type: Some(claims.token_use.as_str()),
        }
    }
}

/// Everything a newly minted batch needs besides the family grant.
struct MintRequest<'a> {
    client: &'a Client,
    grant: &'a FamilyGrant,
    family_id: FamilyId,
    include_refresh: bool,
    nonce: Option<String>,
    roles: Vec<String>,
}

struct Minted {
    response: TokenResponse,
    issued: Vec<IssuedToken>,
}

impl Minted {
    fn jtis(&self) -> Vec<Uuid> {
        self.issued.iter().map(|t| t.jti).collect()
    }
}

#[derive(Clone)]
pub struct TokenService {
    deps: Arc<EngineDeps>,
    clients: ClientService,
    sessions: SessionManager,
}

impl TokenService {
    pub(crate) fn new(deps: Arc<EngineDeps>, clients: ClientService, sessions: SessionManager) -> Self {
        Self {
            deps,
            clients,
            sessions,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Grants
    // ─────────────────────────────────────────────────────────────────────────

    /// Token endpoint: authenticate the client, then run the requested grant.
    pub async fn token(&self, ctx: &CallContext, req: &TokenRequest) -> Result<TokenResponse, EngineError> {
        let proof = ClientProof::from_parts(req.client_secret.as_deref(), req.client_assertion.as_deref())?;
        let client = self.clients.authenticate(ctx, &req.client_id, proof).await?;

        match GrantType::parse(&req.grant_type) {
            Some(GrantType::AuthorizationCode) => {
                let code = required(&req.code, "code")?;
                let redirect_uri = required(&req.redirect_uri, "redirect_uri")?;
                self.exchange_code(ctx, &client, code, redirect_uri, req.code_verifier.as_deref())
                    .await
            }
            Some(GrantType::RefreshToken) => {
                let token = required(&req.refresh_token, "refresh_token")?;
                self.refresh(ctx, &client, token, req.scope.as_deref()).await
            }
            Some(GrantType::ClientCredentials) => {
                self.client_credentials(ctx, &client, req.scope.as_deref()).await
            }
            None => Err(EngineError::UnsupportedGrantType(req.grant_type.clone())),
        }
    }

    /// `grant_type=authorization_code`. The client must already be
    /// authenticated by the caller.
    #[instrument(
        skip(self, ctx, client, code, code_verifier),
        fields(correlation_id = %ctx.correlation_id(), client_id = %client.id),
        err
    )]
    pub async fn exchange_code(
        &self,
        ctx: &CallContext,
        client: &Client,
        code: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, EngineError> {
        if !client.allows_grant(GrantType::AuthorizationCode) {
            return Err(EngineError::UnauthorizedClient(
                "client may not use the authorization code grant".to_string(),
            ));
        }
        let request_id = AuthorizationCode::request_id(code)
            .ok_or_else(|| EngineError::invalid_grant("unknown authorization code"))?;

        let family_id = FamilyId::new();
        let redeemed = self
            .deps
            .dispatcher
            .dispatch::<AuthorizationRequest>(
                ctx,
                request_id,
                AuthorizationCommand::Redeem(RedeemCode {
                    code: code.to_string(),
                    client_id: client.id,
                    redirect_uri: redirect_uri.to_string(),
                    code_verifier: code_verifier.map(str::to_string),
                    family_id,
                    occurred_at: self.deps.now(),
                }),
            )
            .await;

        let out = match redeemed {
            Ok(out) => out,
            Err(DispatchError::Domain(DomainError::Revoked(_))) => {
                self.handle_code_replay(ctx, request_id, client).await;
                return Err(EngineError::invalid_grant("authorization code is no longer valid"));
            }
            Err(DispatchError::Domain(_)) => {
                return Err(EngineError::invalid_grant("authorization code is invalid"));
            }
            Err(other) => return Err(other.into()),
        };

        match out.events.first() {
            Some(AuthorizationEvent::Redeemed(_)) => {}
            Some(AuthorizationEvent::Revoked { reason, .. }) => {
                warn!(reason = reason.as_str(), "authorization code rejected and revoked");
                self.deps.audit(
                    AuditRecord::security("authorization_code_rejected", self.deps.now())
                        .with_client(client.id)
                        .with_correlation(ctx.correlation_id())
                        .with_detail(serde_json::json!({ "reason": reason.as_str() })),
                );
                return Err(EngineError::invalid_grant("authorization code is invalid"));
            }
            Some(AuthorizationEvent::Expired { .. }) => {
                return Err(EngineError::invalid_grant("authorization code expired"));
            }
            _ => return Err(EngineError::Internal("redemption emitted no outcome".to_string())),
        }

        self.issue_for_redemption(ctx, client, out.state, family_id).await
    }

    /// Second half of a code exchange: mint, open the family, bind it to the
    /// session. Opening fails if a replay of the code revoked the family in
    /// the meantime, and the minted tokens are never recorded.
    async fn issue_for_redemption(
        &self,
        ctx: &CallContext,
        client: &Client,
        request: AuthorizationRequest,
        family_id: FamilyId,
    ) -> Result<TokenResponse, EngineError> {
        let user_id = request
            .user_id
            .ok_or_else(|| EngineError::Internal("redeemed request has no user".to_string()))?;
        let user = self.active_user(ctx, user_id).await?;

        let grant = FamilyGrant {
            client_id: client.id,
            subject: user_id.to_string(),
            user_id: Some(user_id),
            session_id: request.session_id,
            scopes: request.scopes.clone(),
            auth_time: request.auth_time,
        };
        let minted = self
            .mint(
                ctx,
                MintRequest {
                    client,
                    grant: &grant,
                    family_id,
                    include_refresh: client.allows_grant(GrantType::RefreshToken),
                    nonce: request.nonce.clone(),
                    roles: role_names(&user),
                },
            )
            .await?;

        self.open_family(ctx, family_id, grant.clone(), &minted)
            .await
            .map_err(|err| match err {
                EngineError::InvalidGrant(_) => {
                    warn!(%family_id, "family revoked before issuance; exchange abandoned");
                    EngineError::invalid_grant("authorization code is no longer valid")
                }
                other => other,
            })?;
        self.bind_to_session(ctx, &grant, family_id, &minted).await?;

        info!(%family_id, "authorization code exchanged");
        Ok(minted.response)
    }

    /// `grant_type=client_credentials`: an access token whose subject is the
    /// client itself.
    #[instrument(skip(self, ctx, client), fields(correlation_id = %ctx.correlation_id(), client_id = %client.id), err)]
    pub async fn client_credentials(
        &self,
        ctx: &CallContext,
        client: &Client,
        scope: Option<&str>,
    ) -> Result<TokenResponse, EngineError> {
        if !client.is_confidential() || !client.allows_grant(GrantType::ClientCredentials) {
            return Err(EngineError::UnauthorizedClient(
                "client may not use the client credentials grant".to_string(),
            ));
        }
        let scopes = requested_scopes(scope, &client.allowed_scopes)?;

        let family_id = FamilyId::new();
        let grant = FamilyGrant {
            client_id: client.id,
            subject: client.id.to_string(),
            user_id: None,
            session_id: None,
            scopes,
            auth_time: None,
        };
        let minted = self
            .mint(
                ctx,
                MintRequest {
                    client,
                    grant: &grant,
                    family_id,
                    include_refresh: false,
                    nonce: None,
                    roles: vec![],
                },
            )
            .await?;
        self.open_family(ctx, family_id, grant, &minted).await?;

        Ok(minted.response)
    }

    /// `grant_type=refresh_token`: rotate. Presenting an already rotated
    /// refresh token revokes the whole family.
    #[instrument(
        skip(self, ctx, client, refresh_token),
        fields(correlation_id = %ctx.correlation_id(), client_id = %client.id),
        err
    )]
    pub async fn refresh(
        &self,
        ctx: &CallContext,
        client: &Client,
        refresh_token: &str,
        scope: Option<&str>,
    ) -> Result<TokenResponse, EngineError> {
        if !client.allows_grant(GrantType::RefreshToken) {
            return Err(EngineError::UnauthorizedClient(
                "client may not use the refresh token grant".to_string(),
            ));
        }

        let invalid = || EngineError::invalid_grant("refresh token is invalid");
        let claims = match self.signer_verify(ctx, refresh_token).await {
            Ok(claims) => claims,
            Err(VerifyError::Unavailable(msg)) => return Err(EngineError::Unavailable(msg)),
            Err(_) => return Err(invalid()),
        };
        if claims.token_use != TokenUse::Refresh
            || claims.iss != self.deps.config.issuer
            || claims.aud != client.id.to_string()
        {
            return Err(invalid());
        }

        let family = self
            .deps
            .dispatcher
            .load::<TokenFamily>(ctx, claims.fid)
            .await?;
        let Ok(family_grant) = family.ensure_exists() else {
            return Err(invalid());
        };
        let family_grant = family_grant.clone();

        let user_id = family_grant.user_id.ok_or_else(invalid)?;
        if let Some(session_id) = family_grant.session_id {
            match self.sessions.ensure_live(ctx, user_id, session_id).await {
                Ok(()) => {}
                Err(err @ EngineError::Unavailable(_)) => return Err(err),
                Err(_) => return Err(invalid()),
            }
        }
        let user = self.active_user(ctx, user_id).await?;

        let scopes = requested_scopes(scope, &family_grant.scopes)?;
        let narrowed = FamilyGrant {
            scopes,
            ..family_grant.clone()
        };

        let minted = self
            .mint(
                ctx,
                MintRequest {
                    client,
                    grant: &narrowed,
                    family_id: claims.fid,
                    include_refresh: true,
                    nonce: None,
                    roles: role_names(&user),
                },
            )
            .await?;

        let rotated = self
            .deps
            .dispatcher
            .dispatch::<TokenFamily>(
                ctx,
                claims.fid,
                TokenFamilyCommand::Rotate {
                    presented_jti: claims.jti,
                    tokens: minted.issued.clone(),
                    occurred_at: self.deps.now(),
                },
            )
            .await;

        let out = match rotated {
            Ok(out) => out,
            Err(DispatchError::Domain(_)) => return Err(invalid()),
            Err(other) => return Err(other.into()),
        };

        if out
            .events
            .iter()
            .any(|e| matches!(e, TokenFamilyEvent::RefreshReuseDetected { .. }))
        {
            warn!(family_id = %claims.fid, jti = %claims.jti, "refresh token reuse detected; family revoked");
            self.deps.audit(
                AuditRecord::security("refresh_token_reuse", self.deps.now())
                    .with_subject(&claims.sub)
                    .with_client(client.id)
                    .with_correlation(ctx.correlation_id())
                    .with_detail(serde_json::json!({
                        "family_id": claims.fid,
                        "jti": claims.jti,
                    })),
            );
            return Err(invalid());
        }

        self.bind_to_session(ctx, &family_grant, claims.fid, &minted).await?;
        debug!(family_id = %claims.fid, "refresh token rotated");
        Ok(minted.response)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Verification
    // ─────────────────────────────────────────────────────────────────────────

    /// Signature, issuer, time window, then revocation of the token, its
    /// session and its client, in that order.
    #[instrument(skip(self, ctx, token), fields(correlation_id = %ctx.correlation_id()), err)]
    pub async fn verify(&self, ctx: &CallContext, token: &str) -> Result<TokenClaims, VerifyError> {
        let claims = self.signer_verify(ctx, token).await?;
        if claims.iss != self.deps.config.issuer {
            return Err(VerifyError::Malformed);
        }

        let now = self.deps.now().timestamp();
        let leeway = self.deps.config.clock_skew_leeway.num_seconds();
        validate_claims(&claims, now, leeway).map_err(|e| match e {
            TokenValidationError::Expired => VerifyError::Expired,
            TokenValidationError::NotYetValid | TokenValidationError::InvalidTimeWindow => VerifyError::Malformed,
        })?;

        let family = self
            .deps
            .dispatcher
            .load::<TokenFamily>(ctx, claims.fid)
            .await?;
        if family.check_token(&claims.jti).is_err() {
            return Err(VerifyError::Revoked);
        }
        let grant = family.ensure_exists().map_err(|_| VerifyError::Revoked)?;
        if grant.client_id.to_string() != claims.aud || grant.subject != claims.sub {
            return Err(VerifyError::Malformed);
        }

        if let (Some(user_id), Some(session_id)) = (grant.user_id, grant.session_id) {
            let sessions = self.sessions.load(ctx, user_id).await?;
            if sessions.ensure_live(&session_id).is_err() {
                return Err(VerifyError::Revoked);
            }
        }

        let client = self
            .deps
            .dispatcher
            .load::<gatekeep_identity::Client>(ctx, grant.client_id)
            .await?;
        if !client.registered || !client.active {
            return Err(VerifyError::Revoked);
        }

        Ok(claims)
    }

    /// RFC 7662. A client only ever sees its own tokens as active.
    #[instrument(skip(self, ctx, caller, token), fields(correlation_id = %ctx.correlation_id(), client_id = %caller.id), err)]
    pub async fn introspect(
        &self,
        ctx: &CallContext,
        caller: &Client,
        token: &str,
    ) -> Result<Introspection, EngineError> {
        match self.verify(ctx, token).await {
            Ok(claims) if claims.aud == caller.id.to_string() => Ok(Introspection::active(&claims)),
            Ok(_) => Ok(Introspection::inactive()),
            Err(VerifyError::Unavailable(msg)) => Err(EngineError::Unavailable(msg)),
            Err(_) => Ok(Introspection::inactive()),
        }
    }

    /// RFC 7009. Unknown, malformed or foreign tokens are ignored so the
    /// endpoint cannot be used to discover other clients' tokens.
    #[instrument(skip(self, ctx, caller, token), fields(correlation_id = %ctx.correlation_id(), client_id = %caller.id), err)]
    pub async fn revoke(&self, ctx: &CallContext, caller: &Client, token: &str) -> Result<(), EngineError> {
        let claims = match self.signer_verify(ctx, token).await {
            Ok(claims) => claims,
            Err(VerifyError::Unavailable(msg)) => return Err(EngineError::Unavailable(msg)),
            Err(_) => return Ok(()),
        };
        if claims.aud != caller.id.to_string() {
            debug!("revocation of a token issued to another client ignored");
            return Ok(());
        }

        let result = self
            .deps
            .dispatcher
            .dispatch::<TokenFamily>(
                ctx,
                claims.fid,
                TokenFamilyCommand::Revoke {
                    jti: claims.jti,
                    occurred_at: self.deps.now(),
                },
            )
            .await;
        match result {
            Ok(out) => {
                if !out.events.is_empty() {
                    info!(family_id = %claims.fid, "token revoked");
                }
                Ok(())
            }
            Err(DispatchError::Domain(_)) => Ok(()),
            Err(other) => Err(other.into()),
        }
    }

    /// Resolve the subject of a verified user access token.
    pub async fn authenticated_user(&self, ctx: &CallContext, access_token: &str) -> Result<TokenClaims, VerifyError> {
        let claims = self.verify(ctx, access_token).await?;
        if claims.token_use != TokenUse::Access {
            return Err(VerifyError::Malformed);
        }
        Ok(claims)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internals
    // ─────────────────────────────────────────────────────────────────────────

    async fn signer_verify(&self, ctx: &CallContext, token: &str) -> Result<TokenClaims, VerifyError> {
        let verify = self.deps.signer.verify(token);
        Ok(ctx
            .guard(Dependency::Signer, self.deps.config.timeouts.signer, verify)
            .await??)
    }

    async fn sign(&self, ctx: &CallContext, claims: &TokenClaims) -> Result<String, EngineError> {
        let sign = self.deps.signer.sign(claims);
        Ok(ctx
            .guard(Dependency::Signer, self.deps.config.timeouts.signer, sign)
            .await??)
    }

    async fn mint(&self, ctx: &CallContext, req: MintRequest<'_>) -> Result<Minted, EngineError> {
        let config = &self.deps.config;
        let now = self.deps.now();
        let scope = req.grant.scopes.to_string();

        let base = |token_use: TokenUse, ttl: chrono::Duration| -> Result<(TokenClaims, IssuedToken), EngineError> {
            let expires_at = expiry(now, ttl)?;
            let claims = TokenClaims {
                iss: config.issuer.clone(),
                sub: req.grant.subject.clone(),
                aud: req.client.id.to_string(),
                exp: expires_at.timestamp(),
                iat: now.timestamp(),
                jti: Uuid::now_v7(),
                scope: scope.clone(),
                token_use,
                fid: req.family_id,
                sid: req.grant.session_id,
                nonce: None,
                auth_time: None,
                roles: vec![],
            };
            let issued = IssuedToken {
                jti: claims.jti,
                token_use,
                expires_at,
            };
            Ok((claims, issued))
        };

        let access_ttl = config.access_ttl_for(req.client.access_token_ttl_secs);
        let (access, access_record) = base(TokenUse::Access, access_ttl)?;
        let access = TokenClaims {
            roles: req.roles.clone(),
            ..access
        };
        let mut tokens = vec![access_record];
        let access_token = self.sign(ctx, &access).await?;

        let refresh_token = if req.include_refresh {
            let (refresh, record) = base(TokenUse::Refresh, config.refresh_ttl_for(req.client.refresh_token_ttl_secs))?;
            tokens.push(record);
            Some(self.sign(ctx, &refresh).await?)
        } else {
            None
        };

        let id_token = if req.grant.scopes.requests_openid() && req.grant.user_id.is_some() {
            let (id, record) = base(TokenUse::Id, config.id_token_ttl)?;
            let id = TokenClaims {
                nonce: req.nonce.clone(),
                auth_time: req.grant.auth_time.map(|t| t.timestamp()),
                ..id
            };
            tokens.push(record);
            Some(self.sign(ctx, &id).await?)
        } else {
            None
        };

        Ok(Minted {
            response: TokenResponse {
                access_token,
                token_type: "Bearer",
                expires_in: access_ttl.num_seconds(),
                refresh_token,
                id_token,
                scope,
            },
            issued: tokens,
        })
    }

    async fn open_family(
        &self,
        ctx: &CallContext,
        family_id: FamilyId,
        grant: FamilyGrant,
        minted: &Minted,
    ) -> Result<(), EngineError> {
        self.deps
            .dispatcher
            .dispatch::<TokenFamily>(
                ctx,
                family_id,
                TokenFamilyCommand::Open {
                    grant,
                    tokens: minted.issued.clone(),
                    occurred_at: self.deps.now(),
                },
            )
            .await?;
        Ok(())
    }

    /// Record the new tokens on the session. If the session was revoked in
    /// the meantime the family goes with it.
    async fn bind_to_session(
        &self,
        ctx: &CallContext,
        grant: &FamilyGrant,
        family_id: FamilyId,
        minted: &Minted,
    ) -> Result<(), EngineError> {
        let (Some(user_id), Some(session_id)) = (grant.user_id, grant.session_id) else {
            return Ok(());
        };
        match self
            .sessions
            .bind_tokens(ctx, user_id, session_id, family_id, minted.jtis())
            .await
        {
            Ok(()) => Ok(()),
            Err(EngineError::InvalidGrant(_) | EngineError::NotFound) => {
                self.revoke_family(ctx, family_id, FamilyRevocationReason::SessionRevoked)
                    .await?;
                Err(EngineError::invalid_grant("session is no longer active"))
            }
            Err(other) => Err(other),
        }
    }

    async fn revoke_family(
        &self,
        ctx: &CallContext,
        family_id: FamilyId,
        reason: FamilyRevocationReason,
    ) -> Result<(), EngineError> {
        self.deps
            .dispatcher
            .dispatch::<TokenFamily>(
                ctx,
                family_id,
                TokenFamilyCommand::RevokeFamily {
                    reason,
                    occurred_at: self.deps.now(),
                },
            )
            .await?;
        Ok(())
    }

    /// A redeemed code presented again: whoever holds it is not necessarily
    /// the party that redeemed it, so the tokens it produced are revoked.
    async fn handle_code_replay(&self, ctx: &CallContext, request_id: RequestId, client: &Client) {
        let request = match self
            .deps
            .dispatcher
            .load::<AuthorizationRequest>(ctx, request_id)
            .await
        {
            Ok(request) => request,
            Err(err) => {
                warn!(%request_id, error = %err, "could not load replayed authorization request");
                return;
            }
        };
        let (AuthorizationStatus::Redeemed, Some(family_id)) = (request.status, request.family_id) else {
            return;
        };

        warn!(%request_id, %family_id, "authorization code replay; revoking issued tokens");
        self.deps.audit(
            AuditRecord::security("authorization_code_replay", self.deps.now())
                .with_client(client.id)
                .with_correlation(ctx.correlation_id())
                .with_detail(serde_json::json!({ "request_id": request_id, "family_id": family_id })),
        );
        if let Err(err) = self
            .revoke_family(ctx, family_id, FamilyRevocationReason::CodeReplay)
            .await
        {
            warn!(%family_id, error = %err, "failed to revoke family after code replay");
        }
    }

    async fn active_user(&self, ctx: &CallContext, user_id: UserId) -> Result<User, EngineError> {
        let user = self.deps.dispatcher.load::<User>(ctx, user_id).await?;
        if !user.registered || !user.active {
            return Err(EngineError::invalid_grant("subject is not active"));
        }
        Ok(user)
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, EngineError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| EngineError::invalid_request(format!("missing {name}")))
}

/// Requested scope, defaulting to (and bounded by) `ceiling`.
fn requested_scopes(scope: Option<&str>, ceiling: &ScopeSet) -> Result<ScopeSet, EngineError> {
    let requested = match scope {
        Some(raw) if !raw.trim().is_empty() => {
            ScopeSet::parse(raw).map_err(|_| EngineError::InvalidScope("malformed scope".to_string()))?
        }
        _ => ceiling.clone(),
    };
    if !requested.is_subset_of(ceiling) {
        return Err(EngineError::InvalidScope("requested scope exceeds the grant".to_string()));
    }
    Ok(requested)
}

/// `now + ttl`, refusing lifetimes that leave chrono's representable range.
fn expiry(now: DateTime<Utc>, ttl: chrono::Duration) -> Result<DateTime<Utc>, EngineError> {
    now.checked_add_signed(ttl)
        .filter(|at| *at > now)
        .ok_or_else(|| EngineError::Internal(format!("token lifetime of {}s is out of range", ttl.num_seconds())))
}

fn role_names(user: &User) -> Vec<String> {
    user.roles.iter().map(|r| r.as_str().to_string()).collect()
}
