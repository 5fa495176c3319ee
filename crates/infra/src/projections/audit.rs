//! Forwards committed events to the audit trail and to outbound email.
//!
//! A side-effect consumer, not a read model: feed it from the live bus only.
//! Replaying history through it would resend every email.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

use gatekeep_core::{Aggregate, UserId};
use gatekeep_events::{AuditRecord, AuditSink, EmailNotifier, EmailTemplate, EventEnvelope, Projection};
use gatekeep_identity::{Client, ClientEvent, User, UserEvent};
use gatekeep_oauth::{
    AuthorizationEvent, AuthorizationRequest, FamilyRevocationReason, RevocationReason, SessionEvent,
    TokenFamily, TokenFamilyEvent, UserSessions,
};

pub struct AuditProjector<A, N> {
    audit: A,
    email: N,
    /// Recipient address per user, learned from `Registered`.
    recipients: HashMap<UserId, String>,
}

impl<A, N> AuditProjector<A, N>
where
    A: AuditSink,
    N: EmailNotifier,
{
    pub fn new(audit: A, email: N) -> Self {
        Self {
            audit,
            email,
            recipients: HashMap::new(),
        }
    }

    pub fn handle(&mut self, envelope: &EventEnvelope<JsonValue>) -> Result<(), anyhow::Error> {
        match envelope.aggregate_type() {
            t if t == User::AGGREGATE_TYPE => self.on_user(envelope, decode(envelope)?),
            t if t == Client::AGGREGATE_TYPE => self.on_client(envelope, decode(envelope)?),
            t if t == TokenFamily::AGGREGATE_TYPE => self.on_family(envelope, decode(envelope)?),
            t if t == AuthorizationRequest::AGGREGATE_TYPE => {
                self.on_authorization(envelope, decode(envelope)?)
            }
            t if t == UserSessions::AGGREGATE_TYPE => self.on_sessions(decode(envelope)?),
            _ => {}
        }
        Ok(())
    }

    fn on_user(&mut self, envelope: &EventEnvelope<JsonValue>, event: UserEvent) {
        let user_id = UserId::from(envelope.aggregate_id());
        let at = envelope.occurred_at();
        let info = |kind: &str| AuditRecord::info(kind, at).with_subject(user_id);

        match event {
            UserEvent::Registered(e) => {
                self.recipients.insert(user_id, e.email);
                self.notify(user_id, EmailTemplate::Welcome);
                self.record(info("user_registered"));
            }
            UserEvent::AuthenticationFailed(e) => self.record(
                AuditRecord::security("user_authentication_failed", at)
                    .with_subject(user_id)
                    .with_detail(json!({ "reason": e.reason, "ip": e.ip })),
            ),
            UserEvent::PasswordChanged(_) => {
                self.notify(user_id, EmailTemplate::PasswordChanged);
                self.record(info("password_changed"));
            }
            UserEvent::IdentityLinked(e) => {
                self.notify(user_id, EmailTemplate::IdentityLinked);
                self.record(info("identity_linked").with_detail(json!({ "provider": e.identity.provider })));
            }
            UserEvent::RoleAssigned(e) => {
                self.record(info("role_assigned").with_detail(json!({ "role": e.role })));
            }
            UserEvent::RoleRevoked(e) => {
                self.record(info("role_revoked").with_detail(json!({ "role": e.role })));
            }
            UserEvent::Deactivated(e) => {
                self.notify(user_id, EmailTemplate::AccountDeactivated);
                self.record(info("user_deactivated").with_detail(json!({ "reason": e.reason })));
            }
            UserEvent::Authenticated(_) => {}
        }
    }

    fn on_client(&mut self, envelope: &EventEnvelope<JsonValue>, event: ClientEvent) {
        let kind = match event {
            ClientEvent::SecretRotated(_) => "client_secret_rotated",
            ClientEvent::Deactivated(_) => "client_deactivated",
            ClientEvent::Registered(_) | ClientEvent::RedirectUrisUpdated(_) => return,
        };
        self.record(AuditRecord::info(kind, envelope.occurred_at()).with_client(envelope.aggregate_id()));
    }

    fn on_family(&mut self, envelope: &EventEnvelope<JsonValue>, event: TokenFamilyEvent) {
        let TokenFamilyEvent::FamilyRevoked { reason, occurred_at } = event else {
            return;
        };
        let record = match reason {
            FamilyRevocationReason::RefreshReuse | FamilyRevocationReason::CodeReplay => {
                AuditRecord::security("token_family_revoked", occurred_at)
            }
            _ => AuditRecord::info("token_family_revoked", occurred_at),
        };
        self.record(record.with_detail(json!({
            "family_id": envelope.aggregate_id(),
            "reason": reason,
        })));
    }

    fn on_authorization(&mut self, envelope: &EventEnvelope<JsonValue>, event: AuthorizationEvent) {
        match event {
            AuthorizationEvent::Revoked { reason, occurred_at } if reason != RevocationReason::Denied => {
                self.record(
                    AuditRecord::security("authorization_code_revoked", occurred_at).with_detail(json!({
                        "request_id": envelope.aggregate_id(),
                        "reason": reason.as_str(),
                    })),
                );
            }
            _ => {}
        }
    }

    fn on_sessions(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::SessionRevoked { session_id, occurred_at } => self.record(
                AuditRecord::info("session_revoked", occurred_at).with_detail(json!({ "session_id": session_id })),
            ),
            SessionEvent::AllSessionsRevoked {
                session_ids,
                occurred_at,
            } => self.record(
                AuditRecord::info("all_sessions_revoked", occurred_at)
                    .with_detail(json!({ "count": session_ids.len() })),
            ),
            _ => {}
        }
    }

    fn record(&self, record: AuditRecord) {
        if let Err(err) = self.audit.record(record) {
            warn!(error = %err, "audit sink rejected record");
        }
    }

    fn notify(&self, user_id: UserId, template: EmailTemplate) {
        let Some(recipient) = self.recipients.get(&user_id) else {
            debug!(%user_id, ?template, "no known recipient; email skipped");
            return;
        };
        if let Err(err) = self.email.send(template, recipient) {
            warn!(%user_id, ?template, error = %err, "email notification failed");
        }
    }
}

impl<A, N> Projection for AuditProjector<A, N>
where
    A: AuditSink,
    N: EmailNotifier,
{
    type Payload = JsonValue;

    fn apply(&mut self, envelope: &EventEnvelope<JsonValue>) {
        if let Err(err) = self.handle(envelope) {
            warn!(
                aggregate_id = %envelope.aggregate_id(),
                event_type = envelope.event_type(),
                error = %err,
                "audit projector skipped an undecodable event"
            );
        }
    }
}

fn decode<E: DeserializeOwned>(envelope: &EventEnvelope<JsonValue>) -> Result<E, serde_json::Error> {
    serde_json::from_value(envelope.payload().clone())
}
