//! Session manager: per-device sessions and logout.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use gatekeep_core::{DomainError, FamilyId, SessionId, UserId};
use gatekeep_oauth::family::{FamilyRevocationReason, TokenFamily, TokenFamilyCommand};
use gatekeep_oauth::{Session, SessionCommand, SessionEvent, UserSessions, sessions_stream_id};

use crate::command_dispatcher::DispatchError;
use crate::context::CallContext;
use crate::error::EngineError;

use super::EngineDeps;

#[derive(Clone)]
pub struct SessionManager {
    deps: Arc<EngineDeps>,
}

impl SessionManager {
    pub(crate) fn new(deps: Arc<EngineDeps>) -> Self {
        Self { deps }
    }

    /// Create a session for the device, or touch the live one it already has.
    #[instrument(
        skip(self, ctx, device_fingerprint),
        fields(correlation_id = %ctx.correlation_id(), %user_id),
        err
    )]
    pub async fn start_session(
        &self,
        ctx: &CallContext,
        user_id: UserId,
        device_fingerprint: &str,
    ) -> Result<Session, EngineError> {
        let out = self
            .deps
            .dispatcher
            .dispatch::<UserSessions>(
                ctx,
                sessions_stream_id(user_id),
                SessionCommand::Start {
                    user_id,
                    session_id: SessionId::new(),
                    device_fingerprint: device_fingerprint.to_string(),
                    occurred_at: self.deps.now(),
                },
            )
            .await?;

        let session_id = match out.events.first() {
            Some(SessionEvent::SessionCreated { session_id, .. })
            | Some(SessionEvent::SessionTouched { session_id, .. }) => *session_id,
            _ => return Err(EngineError::Internal("session start emitted no event".to_string())),
        };

        out.state
            .session(&session_id)
            .cloned()
            .ok_or_else(|| EngineError::Internal("started session missing from state".to_string()))
    }

    /// Every non-revoked session of the user, read from the event store.
    pub async fn list_sessions(&self, ctx: &CallContext, user_id: UserId) -> Result<Vec<Session>, EngineError> {
        let sessions = self.load(ctx, user_id).await?;
        Ok(sessions.active().cloned().collect())
    }

    /// Revoke one session and every token family bound to it.
    #[instrument(
        skip(self, ctx),
        fields(correlation_id = %ctx.correlation_id(), %user_id, %session_id),
        err
    )]
    pub async fn revoke_session(
        &self,
        ctx: &CallContext,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<(), EngineError> {
        let out = self
            .deps
            .dispatcher
            .dispatch::<UserSessions>(
                ctx,
                sessions_stream_id(user_id),
                SessionCommand::Revoke {
                    session_id,
                    occurred_at: self.deps.now(),
                },
            )
            .await?;

        let families = out
            .state
            .session(&session_id)
            .map(|s| s.families.clone())
            .unwrap_or_default();
        self.revoke_families(ctx, families).await;

        info!("session revoked");
        Ok(())
    }

    /// Log out from all devices. Returns the number of sessions revoked.
    #[instrument(skip(self, ctx), fields(correlation_id = %ctx.correlation_id(), %user_id), err)]
    pub async fn revoke_all(&self, ctx: &CallContext, user_id: UserId) -> Result<usize, EngineError> {
        let out = self
            .deps
            .dispatcher
            .dispatch::<UserSessions>(
                ctx,
                sessions_stream_id(user_id),
                SessionCommand::RevokeAll {
                    occurred_at: self.deps.now(),
                },
            )
            .await?;

        let revoked: Vec<SessionId> = out
            .events
            .iter()
            .flat_map(|e| match e {
                SessionEvent::AllSessionsRevoked { session_ids, .. } => session_ids.clone(),
                _ => vec![],
            })
            .collect();

        let families: BTreeSet<FamilyId> = revoked
            .iter()
            .filter_map(|id| out.state.session(id))
            .flat_map(|s| s.families.iter().copied())
            .collect();
        self.revoke_families(ctx, families).await;

        info!(sessions = revoked.len(), "all sessions revoked");
        Ok(revoked.len())
    }

    /// Strong liveness check used by verification, refresh and authorize.
    pub async fn ensure_live(
        &self,
        ctx: &CallContext,
        user_id: UserId,
        session_id: SessionId,
    ) -> Result<(), EngineError> {
        let sessions = self.load(ctx, user_id).await?;
        sessions.ensure_live(&session_id)?;
        Ok(())
    }

    pub(crate) async fn bind_tokens(
        &self,
        ctx: &CallContext,
        user_id: UserId,
        session_id: SessionId,
        family_id: FamilyId,
        jtis: Vec<Uuid>,
    ) -> Result<(), EngineError> {
        self.deps
            .dispatcher
            .dispatch::<UserSessions>(
                ctx,
                sessions_stream_id(user_id),
                SessionCommand::BindTokens {
                    session_id,
                    family_id,
                    jtis,
                    occurred_at: self.deps.now(),
                },
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn load(&self, ctx: &CallContext, user_id: UserId) -> Result<UserSessions, DispatchError> {
        self.deps
            .dispatcher
            .load::<UserSessions>(ctx, sessions_stream_id(user_id))
            .await
    }

    /// Best effort: verification already fails through the session check, so a
    /// family that cannot be revoked here is logged, not surfaced.
    async fn revoke_families(&self, ctx: &CallContext, families: impl IntoIterator<Item = FamilyId>) {
        for family_id in families {
            let result = self
                .deps
                .dispatcher
                .dispatch::<TokenFamily>(
                    ctx,
                    family_id,
                    TokenFamilyCommand::RevokeFamily {
                        reason: FamilyRevocationReason::SessionRevoked,
                        occurred_at: self.deps.now(),
                    },
                )
                .await;
            match result {
                Ok(_) | Err(DispatchError::Domain(DomainError::NotFound)) => {}
                Err(err) => warn!(%family_id, error = %err, "token family revocation failed"),
            }
        }
    }
}
