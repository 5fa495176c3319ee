//! User lifecycle: registration, authentication, credentials, linking, roles.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use gatekeep_core::{AggregateId, DomainError, UserId};
use gatekeep_events::AuditRecord;
use gatekeep_identity::user::{
    AuthenticateUser, ChangePassword, ChangeRole, DeactivateUser, LinkIdentity, RegisterUser,
};
use gatekeep_identity::{
    ClaimCommand, ClaimKind, LinkedIdentity, Role, UniqueClaim, User, UserCommand, UserEvent,
    external_identity_key, normalize_email, verify_password,
};

use crate::command_dispatcher::DispatchError;
use crate::context::{CallContext, Dependency};
use crate::error::EngineError;
use crate::external::VerifierError;

use super::{EngineDeps, SessionManager};

#[derive(Clone)]
pub struct IdentityService {
    deps: Arc<EngineDeps>,
    sessions: SessionManager,
}

impl IdentityService {
    pub(crate) fn new(deps: Arc<EngineDeps>, sessions: SessionManager) -> Self {
        Self { deps, sessions }
    }

    /// Register a user. The email claim is taken before the user stream is
    /// written, so two concurrent registrations of one address cannot both win.
    #[instrument(skip(self, ctx, email, password), fields(correlation_id = %ctx.correlation_id()), err)]
    pub async fn register(&self, ctx: &CallContext, email: &str, password: &str) -> Result<User, EngineError> {
        let email = normalize_email(email)?;
        self.deps.config.password_policy.validate(password)?;
        let password_hash = self.hash(password).await?;

        let user_id = UserId::new();
        let email_claim = ClaimKind::Email.stream_id(&email);
        self.claim(ctx, email_claim, user_id)
            .await
            .map_err(|err| match err {
                EngineError::Conflict(_) => EngineError::invalid_request("email is already registered"),
                other => other,
            })?;

        let registered = self
            .deps
            .dispatcher
            .dispatch::<User>(
                ctx,
                user_id,
                UserCommand::Register(RegisterUser {
                    user_id,
                    email,
                    password_hash,
                    occurred_at: self.deps.now(),
                }),
            )
            .await;

        match registered {
            Ok(out) => {
                info!(%user_id, "user registered");
                Ok(out.state)
            }
            Err(err) => {
                self.release(ctx, email_claim, user_id).await;
                Err(err.into())
            }
        }
    }

    /// Check a password. Unknown emails, wrong passwords and deactivated
    /// accounts are indistinguishable to the caller.
    #[instrument(
        skip(self, ctx, email, password, user_agent),
        fields(correlation_id = %ctx.correlation_id()),
        err
    )]
    pub async fn authenticate(
        &self,
        ctx: &CallContext,
        email: &str,
        password: &str,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<User, EngineError> {
        let owner = match normalize_email(email) {
            Ok(email) => {
                self.deps
                    .dispatcher
                    .load::<UniqueClaim>(ctx, ClaimKind::Email.stream_id(&email))
                    .await?
                    .owner
            }
            Err(_) => None,
        };

        let Some(owner) = owner else {
            // Same hashing cost as a real attempt.
            let dummy = self.deps.dummy_password_hash().to_string();
            let presented = password.to_string();
            let _ = tokio::task::spawn_blocking(move || verify_password(&dummy, &presented)).await;
            warn!("authentication failed for unknown email");
            self.deps.audit(
                AuditRecord::security("authentication_failed", self.deps.now())
                    .with_correlation(ctx.correlation_id())
                    .with_detail(serde_json::json!({ "reason": "unknown_email", "ip": ip })),
            );
            return Err(EngineError::AuthFailed);
        };

        let user_id = UserId::from_uuid(owner);
        let out = self
            .deps
            .dispatcher
            .dispatch_blocking::<User>(
                ctx,
                user_id,
                UserCommand::Authenticate(AuthenticateUser {
                    password: password.to_string(),
                    ip,
                    user_agent,
                    occurred_at: self.deps.now(),
                }),
            )
            .await
            .map_err(auth_failure)?;

        match out.events.first() {
            Some(UserEvent::Authenticated(_)) => Ok(out.state),
            _ => {
                warn!(%user_id, "authentication failed");
                Err(EngineError::AuthFailed)
            }
        }
    }

    /// Requires the current password; the new one must satisfy the policy.
    #[instrument(
        skip(self, ctx, current_password, new_password),
        fields(correlation_id = %ctx.correlation_id(), %user_id),
        err
    )]
    pub async fn change_password(
        &self,
        ctx: &CallContext,
        user_id: UserId,
        current_password: &str,
        new_password: &str,
    ) -> Result<User, EngineError> {
        self.deps.config.password_policy.validate(new_password)?;
        let new_password_hash = self.hash(new_password).await?;

        let result = self
            .deps
            .dispatcher
            .dispatch_blocking::<User>(
                ctx,
                user_id,
                UserCommand::ChangePassword(ChangePassword {
                    current_password: current_password.to_string(),
                    new_password_hash,
                    occurred_at: self.deps.now(),
                }),
            )
            .await;

        match result {
            Ok(out) => Ok(out.state),
            Err(DispatchError::Domain(DomainError::Authentication)) => {
                warn!("password change rejected: current password mismatch");
                self.deps.audit(
                    AuditRecord::security("password_change_failed", self.deps.now())
                        .with_subject(user_id)
                        .with_correlation(ctx.correlation_id()),
                );
                Err(EngineError::AuthFailed)
            }
            Err(err) => Err(auth_failure(err)),
        }
    }

    /// Link an external identity after the provider proof checks out. A
    /// `(provider, external id)` pair belongs to at most one user.
    #[instrument(
        skip(self, ctx, assertion),
        fields(correlation_id = %ctx.correlation_id(), %user_id, provider),
        err
    )]
    pub async fn link_identity(
        &self,
        ctx: &CallContext,
        user_id: UserId,
        provider: &str,
        assertion: &str,
    ) -> Result<User, EngineError> {
        let user = self.get_user(ctx, user_id).await?;
        if !user.active {
            return Err(EngineError::AuthFailed);
        }

        let verify = self.deps.identity_verifier.verify(provider, assertion);
        let external_id = ctx
            .guard(
                Dependency::IdentityProvider,
                self.deps.config.timeouts.identity_provider,
                verify,
            )
            .await?
            .map_err(|err| match err {
                VerifierError::Unavailable(msg) => EngineError::Unavailable(msg),
                VerifierError::Rejected | VerifierError::UnknownProvider(_) => {
                    warn!("external identity proof rejected");
                    self.deps.audit(
                        AuditRecord::security("identity_proof_rejected", self.deps.now())
                            .with_subject(user_id)
                            .with_correlation(ctx.correlation_id())
                            .with_detail(serde_json::json!({ "provider": provider })),
                    );
                    EngineError::AuthFailed
                }
            })?;

        let provider = provider.trim().to_lowercase();
        let claim = ClaimKind::ExternalIdentity.stream_id(&external_identity_key(&provider, &external_id));
        self.claim(ctx, claim, user_id).await.map_err(|err| match err {
            EngineError::Conflict(_) => {
                EngineError::Conflict("identity is already linked to another user".to_string())
            }
            other => other,
        })?;

        let linked = self
            .deps
            .dispatcher
            .dispatch::<User>(
                ctx,
                user_id,
                UserCommand::LinkIdentity(LinkIdentity {
                    identity: LinkedIdentity {
                        provider,
                        external_id,
                    },
                    occurred_at: self.deps.now(),
                }),
            )
            .await;

        match linked {
            Ok(out) => Ok(out.state),
            Err(err) => {
                self.release(ctx, claim, user_id).await;
                Err(err.into())
            }
        }
    }

    /// Idempotent.
    pub async fn assign_role(&self, ctx: &CallContext, user_id: UserId, role: &str) -> Result<User, EngineError> {
        let command = UserCommand::AssignRole(ChangeRole {
            role: Role::new(role.trim().to_string()),
            occurred_at: self.deps.now(),
        });
        let out = self.deps.dispatcher.dispatch::<User>(ctx, user_id, command).await?;
        Ok(out.state)
    }

    /// Idempotent.
    pub async fn revoke_role(&self, ctx: &CallContext, user_id: UserId, role: &str) -> Result<User, EngineError> {
        let command = UserCommand::RevokeRole(ChangeRole {
            role: Role::new(role.trim().to_string()),
            occurred_at: self.deps.now(),
        });
        let out = self.deps.dispatcher.dispatch::<User>(ctx, user_id, command).await?;
        Ok(out.state)
    }

    /// Deactivate the account: release its unique keys and log it out
    /// everywhere.
    #[instrument(skip(self, ctx, reason), fields(correlation_id = %ctx.correlation_id(), %user_id), err)]
    pub async fn deactivate(&self, ctx: &CallContext, user_id: UserId, reason: &str) -> Result<User, EngineError> {
        let out = self
            .deps
            .dispatcher
            .dispatch::<User>(
                ctx,
                user_id,
                UserCommand::Deactivate(DeactivateUser {
                    reason: reason.to_string(),
                    occurred_at: self.deps.now(),
                }),
            )
            .await?;

        if !out.events.is_empty() {
            self.release(ctx, ClaimKind::Email.stream_id(&out.state.email), user_id)
                .await;
            for identity in &out.state.linked_identities {
                let key = external_identity_key(&identity.provider, &identity.external_id);
                self.release(ctx, ClaimKind::ExternalIdentity.stream_id(&key), user_id)
                    .await;
            }
            info!("user deactivated");
        }

        self.sessions.revoke_all(ctx, user_id).await?;
        Ok(out.state)
    }

    /// Strong read of the user stream.
    pub async fn get_user(&self, ctx: &CallContext, user_id: UserId) -> Result<User, EngineError> {
        let user = self.deps.dispatcher.load::<User>(ctx, user_id).await?;
        user.ensure_registered()?;
        Ok(user)
    }

    /// Argon2 on the blocking pool, off the async workers.
    async fn hash(&self, password: &str) -> Result<String, EngineError> {
        let hasher = self.deps.hasher.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| EngineError::Internal(format!("password hashing task failed: {e}")))?
            .map_err(|e| EngineError::Internal(e.to_string()))
    }

    async fn claim(&self, ctx: &CallContext, claim: AggregateId, user_id: UserId) -> Result<(), EngineError> {
        self.deps
            .dispatcher
            .dispatch::<UniqueClaim>(
                ctx,
                claim,
                ClaimCommand::Claim {
                    owner: *user_id.as_uuid(),
                    occurred_at: self.deps.now(),
                },
            )
            .await?;
        Ok(())
    }

    async fn release(&self, ctx: &CallContext, claim: AggregateId, user_id: UserId) {
        let result = self
            .deps
            .dispatcher
            .dispatch::<UniqueClaim>(
                ctx,
                claim,
                ClaimCommand::Release {
                    owner: *user_id.as_uuid(),
                    occurred_at: self.deps.now(),
                },
            )
            .await;
        if let Err(err) = result {
            warn!(%claim, error = %err, "failed to release unique claim");
        }
    }
}

/// A missing or deactivated user looks like bad credentials.
fn auth_failure(err: DispatchError) -> EngineError {
    match err {
        DispatchError::Domain(DomainError::NotFound | DomainError::InvariantViolation(_)) => EngineError::AuthFailed,
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use gatekeep_events::InMemoryAuditSink;

    use super::*;
    use crate::config::EngineConfig;
    use crate::external::StaticIdentityVerifier;
    use crate::services::Engine;

    fn engine() -> (Engine, Arc<InMemoryAuditSink>, Arc<StaticIdentityVerifier>) {
        let audit = Arc::new(InMemoryAuditSink::new());
        let verifier = Arc::new(StaticIdentityVerifier::new());
        let engine = Engine::builder()
            .config(EngineConfig::testing())
            .audit(audit.clone())
            .identity_verifier(verifier.clone())
            .build()
            .unwrap();
        (engine, audit, verifier)
    }

    #[tokio::test]
    async fn register_then_authenticate() {
        let (engine, _, _) = engine();
        let ctx = CallContext::new();

        let user = engine
            .identity
            .register(&ctx, "  Alice@Example.com ", "correct horse")
            .await
            .unwrap();
        assert_eq!(user.email, "alice@example.com");

        let authed = engine
            .identity
            .authenticate(&ctx, "alice@example.com", "correct horse", None, None)
            .await
            .unwrap();
        assert_eq!(authed.id, user.id);
        assert!(authed.last_authenticated_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_email_is_a_validation_error() {
        let (engine, _, _) = engine();
        let ctx = CallContext::new();

        engine.identity.register(&ctx, "bob@example.com", "password-1").await.unwrap();
        let err = engine
            .identity
            .register(&ctx, "BOB@example.com", "password-2")
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::invalid_request("email is already registered"));
        assert_eq!(err.oauth_error_code(), "invalid_request");
    }

    #[tokio::test]
    async fn unknown_email_and_wrong_password_are_indistinguishable() {
        let (engine, audit, _) = engine();
        let ctx = CallContext::new();
        engine.identity.register(&ctx, "carol@example.com", "password-1").await.unwrap();

        let unknown = engine
            .identity
            .authenticate(&ctx, "nobody@example.com", "password-1", None, None)
            .await
            .unwrap_err();
        let wrong = engine
            .identity
            .authenticate(&ctx, "carol@example.com", "password-2", None, None)
            .await
            .unwrap_err();

        assert_eq!(unknown, wrong);
        assert_eq!(unknown.oauth_error_code(), wrong.oauth_error_code());
        assert_eq!(audit.count_kind("authentication_failed"), 1);
    }

    #[tokio::test]
    async fn password_policy_is_enforced_on_change() {
        let (engine, _, _) = engine();
        let ctx = CallContext::new();
        let user = engine.identity.register(&ctx, "dan@example.com", "password-1").await.unwrap();

        let weak = engine
            .identity
            .change_password(&ctx, user.id, "password-1", "short")
            .await
            .unwrap_err();
        assert!(matches!(weak, EngineError::InvalidRequest(_)));

        let wrong_current = engine
            .identity
            .change_password(&ctx, user.id, "not-it", "password-2")
            .await
            .unwrap_err();
        assert_eq!(wrong_current, EngineError::AuthFailed);

        engine
            .identity
            .change_password(&ctx, user.id, "password-1", "password-2")
            .await
            .unwrap();
        engine
            .identity
            .authenticate(&ctx, "dan@example.com", "password-2", None, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn external_identity_links_to_one_user_only() {
        let (engine, _, verifier) = engine();
        let ctx = CallContext::new();
        verifier.register("google", "proof-a", "g-1");
        verifier.register("google", "proof-b", "g-1");

        let erin = engine.identity.register(&ctx, "erin@example.com", "password-1").await.unwrap();
        let frank = engine.identity.register(&ctx, "frank@example.com", "password-1").await.unwrap();

        let linked = engine
            .identity
            .link_identity(&ctx, erin.id, "Google", "proof-a")
            .await
            .unwrap();
        assert_eq!(linked.linked_identities.len(), 1);

        let err = engine
            .identity
            .link_identity(&ctx, frank.id, "google", "proof-b")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        let forged = engine
            .identity
            .link_identity(&ctx, frank.id, "google", "forged")
            .await
            .unwrap_err();
        assert_eq!(forged, EngineError::AuthFailed);
    }

    #[tokio::test]
    async fn deactivation_releases_the_email_and_blocks_login() {
        let (engine, _, _) = engine();
        let ctx = CallContext::new();
        let user = engine.identity.register(&ctx, "gina@example.com", "password-1").await.unwrap();

        engine.identity.deactivate(&ctx, user.id, "requested").await.unwrap();

        let err = engine
            .identity
            .authenticate(&ctx, "gina@example.com", "password-1", None, None)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::AuthFailed);

        // The address is free again.
        engine.identity.register(&ctx, "gina@example.com", "password-1").await.unwrap();
    }

    #[tokio::test]
    async fn role_changes_are_idempotent() {
        let (engine, _, _) = engine();
        let ctx = CallContext::new();
        let user = engine.identity.register(&ctx, "hal@example.com", "password-1").await.unwrap();

        engine.identity.assign_role(&ctx, user.id, "admin").await.unwrap();
        let again = engine.identity.assign_role(&ctx, user.id, "admin").await.unwrap();
        assert!(again.has_role("admin"));
        assert_eq!(again.roles.len(), 1);

        let revoked = engine.identity.revoke_role(&ctx, user.id, "admin").await.unwrap();
        assert!(!revoked.has_role("admin"));
        engine.identity.revoke_role(&ctx, user.id, "admin").await.unwrap();
    }
}
