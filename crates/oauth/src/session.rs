//! Per-user device sessions.
//!
//! One stream per user (id `derive_id("sessions", user_id)`) holds every
//! session of that user, so "log out everywhere" is a single atomic append and
//! a verifier reading this stream never sees a half-revoked state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gatekeep_core::{Aggregate, AggregateId, AggregateRoot, DomainError, FamilyId, SessionId, UserId, derive_id};
use gatekeep_events::Event;

pub fn sessions_stream_id(user_id: UserId) -> AggregateId {
    derive_id("sessions", &user_id.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub device_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub families: BTreeSet<FamilyId>,
    pub active_token_jtis: BTreeSet<Uuid>,
    pub revoked: bool,
}

#[derive(Debug, Clone)]
pub struct UserSessions {
    pub id: AggregateId,
    pub user_id: Option<UserId>,
    pub sessions: BTreeMap<SessionId, Session>,
    pub version: u64,
}

impl UserSessions {
    pub fn active(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values().filter(|s| !s.revoked)
    }

    pub fn session(&self, session_id: &SessionId) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Strong check used by token verification.
    pub fn ensure_live(&self, session_id: &SessionId) -> Result<&Session, DomainError> {
        let session = self.sessions.get(session_id).ok_or(DomainError::NotFound)?;
        if session.revoked {
            return Err(DomainError::revoked("session revoked"));
        }
        Ok(session)
    }

    fn live_by_fingerprint(&self, fingerprint: &str) -> Option<&Session> {
        self.active().find(|s| s.device_fingerprint == fingerprint)
    }
}

impl AggregateRoot for UserSessions {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Create a session for the device, or touch the live one it already has.
    Start {
        user_id: UserId,
        session_id: SessionId,
        device_fingerprint: String,
        occurred_at: DateTime<Utc>,
    },
    BindTokens {
        session_id: SessionId,
        family_id: FamilyId,
        jtis: Vec<Uuid>,
        occurred_at: DateTime<Utc>,
    },
    Revoke {
        session_id: SessionId,
        occurred_at: DateTime<Utc>,
    },
    RevokeAll {
        occurred_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    SessionCreated {
        user_id: UserId,
        session_id: SessionId,
        device_fingerprint: String,
        occurred_at: DateTime<Utc>,
    },
    SessionTouched {
        session_id: SessionId,
        occurred_at: DateTime<Utc>,
    },
    TokensBound {
        session_id: SessionId,
        family_id: FamilyId,
        jtis: Vec<Uuid>,
        occurred_at: DateTime<Utc>,
    },
    SessionRevoked {
        session_id: SessionId,
        occurred_at: DateTime<Utc>,
    },
    AllSessionsRevoked {
        session_ids: Vec<SessionId>,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for SessionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::SessionCreated { .. } => "oauth.sessions.created",
            SessionEvent::SessionTouched { .. } => "oauth.sessions.touched",
            SessionEvent::TokensBound { .. } => "oauth.sessions.tokens_bound",
            SessionEvent::SessionRevoked { .. } => "oauth.sessions.revoked",
            SessionEvent::AllSessionsRevoked { .. } => "oauth.sessions.all_revoked",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SessionEvent::SessionCreated { occurred_at, .. }
            | SessionEvent::SessionTouched { occurred_at, .. }
            | SessionEvent::TokensBound { occurred_at, .. }
            | SessionEvent::SessionRevoked { occurred_at, .. }
            | SessionEvent::AllSessionsRevoked { occurred_at, .. } => *occurred_at,
        }
    }
}

impl Aggregate for UserSessions {
    type Command = SessionCommand;
    type Event = SessionEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "oauth.user_sessions";

    fn empty(id: AggregateId) -> Self {
        Self {
            id,
            user_id: None,
            sessions: BTreeMap::new(),
            version: 0,
        }
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SessionEvent::SessionCreated { user_id, session_id, device_fingerprint, occurred_at } => {
                self.user_id = Some(*user_id);
                self.sessions.insert(
                    *session_id,
                    Session {
                        session_id: *session_id,
                        device_fingerprint: device_fingerprint.clone(),
                        created_at: *occurred_at,
                        last_seen_at: *occurred_at,
                        families: BTreeSet::new(),
                        active_token_jtis: BTreeSet::new(),
                        revoked: false,
                    },
                );
            }
            SessionEvent::SessionTouched { session_id, occurred_at } => {
                if let Some(s) = self.sessions.get_mut(session_id) {
                    s.last_seen_at = *occurred_at;
                }
            }
            SessionEvent::TokensBound { session_id, family_id, jtis, .. } => {
                if let Some(s) = self.sessions.get_mut(session_id) {
                    s.families.insert(*family_id);
                    s.active_token_jtis.extend(jtis.iter().copied());
                }
            }
            SessionEvent::SessionRevoked { session_id, .. } => {
                if let Some(s) = self.sessions.get_mut(session_id) {
                    s.revoked = true;
                }
            }
            SessionEvent::AllSessionsRevoked { session_ids, .. } => {
                for id in session_ids {
                    if let Some(s) = self.sessions.get_mut(id) {
                        s.revoked = true;
                    }
                }
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SessionCommand::Start { user_id, session_id, device_fingerprint, occurred_at } => {
                if self.user_id.is_some_and(|owner| owner != *user_id) {
                    return Err(DomainError::invariant("session stream belongs to another user"));
                }
                let fingerprint = device_fingerprint.trim();
                if fingerprint.is_empty() {
                    return Err(DomainError::validation("device fingerprint is required"));
                }
                if let Some(existing) = self.live_by_fingerprint(fingerprint) {
                    return Ok(vec![SessionEvent::SessionTouched {
                        session_id: existing.session_id,
                        occurred_at: *occurred_at,
                    }]);
                }
                if self.sessions.contains_key(session_id) {
                    return Err(DomainError::conflict("session id already used"));
                }
                Ok(vec![SessionEvent::SessionCreated {
                    user_id: *user_id,
                    session_id: *session_id,
                    device_fingerprint: fingerprint.to_string(),
                    occurred_at: *occurred_at,
                }])
            }
            SessionCommand::BindTokens { session_id, family_id, jtis, occurred_at } => {
                self.ensure_live(session_id)?;
                Ok(vec![SessionEvent::TokensBound {
                    session_id: *session_id,
                    family_id: *family_id,
                    jtis: jtis.clone(),
                    occurred_at: *occurred_at,
                }])
            }
            SessionCommand::Revoke { session_id, occurred_at } => {
                let session = self.sessions.get(session_id).ok_or(DomainError::NotFound)?;
                if session.revoked {
                    return Ok(vec![]);
                }
                Ok(vec![SessionEvent::SessionRevoked {
                    session_id: *session_id,
                    occurred_at: *occurred_at,
                }])
            }
            SessionCommand::RevokeAll { occurred_at } => {
                let session_ids: Vec<SessionId> = self.active().map(|s| s.session_id).collect();
                if session_ids.is_empty() {
                    return Ok(vec![]);
                }
                Ok(vec![SessionEvent::AllSessionsRevoked {
                    session_ids,
                    occurred_at: *occurred_at,
                }])
            }
        }
    }
}
