//! User directory read model.
//!
//! Built from `identity.user` envelopes. Lags the event store; anything that
//! must be consistent (authentication, revocation) reads the aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use gatekeep_core::{Aggregate, UserId};
use gatekeep_events::{EventEnvelope, Projection};
use gatekeep_identity::user::{IdentityLinked, RoleChanged, UserDeactivated, UserRegistered};
use gatekeep_identity::{LinkedIdentity, User, UserEvent};

use crate::read_model::ReadStore;

// ─────────────────────────────────────────────────────────────────────────────
// Read Model
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserReadModel {
    pub user_id: UserId,
    pub email: String,
    pub roles: Vec<String>,
    pub linked_identities: Vec<LinkedIdentity>,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub last_authenticated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Projection
// ─────────────────────────────────────────────────────────────────────────────

pub struct UsersProjection<S> {
    store: S,
}

impl<S> UsersProjection<S>
where
    S: ReadStore<UserId, UserReadModel>,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), anyhow::Error> {
        if envelope.aggregate_type() != <User as Aggregate>::AGGREGATE_TYPE {
            return Ok(());
        }

        let event: UserEvent = serde_json::from_value(envelope.payload().clone())?;
        let user_id = UserId::from(envelope.aggregate_id());

        match event {
            UserEvent::Registered(e) => self.apply_registered(e),
            UserEvent::Authenticated(e) => self.update(user_id, e.occurred_at, |m| {
                m.last_authenticated_at = Some(e.occurred_at);
            }),
            UserEvent::IdentityLinked(e) => self.apply_linked(user_id, e),
            UserEvent::RoleAssigned(e) => self.apply_role(user_id, e, true),
            UserEvent::RoleRevoked(e) => self.apply_role(user_id, e, false),
            UserEvent::Deactivated(e) => self.apply_deactivated(user_id, e),
            UserEvent::AuthenticationFailed(_) | UserEvent::PasswordChanged(_) => {}
        }
        Ok(())
    }

    fn apply_registered(&self, e: UserRegistered) {
        self.store.upsert(
            e.user_id,
            UserReadModel {
                user_id: e.user_id,
                email: e.email,
                roles: vec![],
                linked_identities: vec![],
                active: true,
                registered_at: e.occurred_at,
                last_authenticated_at: None,
                updated_at: e.occurred_at,
            },
        );
    }

    fn apply_linked(&self, user_id: UserId, e: IdentityLinked) {
        self.update(user_id, e.occurred_at, |m| {
            if !m.linked_identities.contains(&e.identity) {
                m.linked_identities.push(e.identity.clone());
            }
        });
    }

    fn apply_role(&self, user_id: UserId, e: RoleChanged, assigned: bool) {
        let role = e.role.as_str().to_string();
        self.update(user_id, e.occurred_at, |m| {
            if assigned {
                if !m.roles.contains(&role) {
                    m.roles.push(role.clone());
                }
            } else {
                m.roles.retain(|r| r != &role);
            }
        });
    }

    fn apply_deactivated(&self, user_id: UserId, e: UserDeactivated) {
        self.update(user_id, e.occurred_at, |m| m.active = false);
    }

    fn update(&self, user_id: UserId, at: DateTime<Utc>, f: impl FnOnce(&mut UserReadModel)) {
        if let Some(mut model) = self.store.get(&user_id) {
            f(&mut model);
            model.updated_at = at;
            self.store.upsert(user_id, model);
        }
    }

    pub fn get(&self, user_id: &UserId) -> Option<UserReadModel> {
        self.store.get(user_id)
    }

    pub fn list(&self) -> Vec<UserReadModel> {
        self.store.list()
    }

    /// Lookup by email (linear scan). Directory use only; authentication
    /// resolves emails through the claim stream.
    pub fn get_by_email(&self, email: &str) -> Option<UserReadModel> {
        let normalized = email.trim().to_lowercase();
        self.list().into_iter().find(|u| u.email == normalized)
    }

    pub fn clear(&self) {
        self.store.clear();
    }
}

impl<S> Projection for UsersProjection<S>
where
    S: ReadStore<UserId, UserReadModel>,
{
    type Payload = JsonValue;

    fn apply(&mut self, envelope: &EventEnvelope<JsonValue>) {
        if let Err(err) = self.apply_envelope(envelope) {
            warn!(
                aggregate_id = %envelope.aggregate_id(),
                version = envelope.version(),
                error = %err,
                "users projection skipped an undecodable event"
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
