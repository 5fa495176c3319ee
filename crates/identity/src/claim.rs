//! Uniqueness claims.
//!
//! A claim is a tiny stream whose id is derived from the unique key
//! (`derive_id(kind, key)`). Claiming appends to that stream with
//! `ExpectedVersion` of the observed state, so two racing registrations for the
//! same key cannot both win. The claim stream doubles as the strongly
//! consistent key -> owner lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gatekeep_core::{Aggregate, AggregateId, AggregateRoot, DomainError, derive_id};
use gatekeep_events::Event;

/// Namespaces of unique keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    Email,
    ExternalIdentity,
}

impl ClaimKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimKind::Email => "claim.email",
            ClaimKind::ExternalIdentity => "claim.external_identity",
        }
    }

    /// Stream id of the claim on `key`.
    pub fn stream_id(self, key: &str) -> AggregateId {
        derive_id(self.as_str(), key)
    }
}

/// Key for an external identity claim. Provider is case-insensitive, the
/// subject at the provider is not.
pub fn external_identity_key(provider: &str, external_id: &str) -> String {
    format!("{}\u{1f}{}", provider.trim().to_lowercase(), external_id)
}

#[derive(Debug, Clone)]
pub struct UniqueClaim {
    pub id: AggregateId,
    pub owner: Option<Uuid>,
    pub version: u64,
}

impl AggregateRoot for UniqueClaim {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClaimCommand {
    Claim { owner: Uuid, occurred_at: DateTime<Utc> },
    Release { owner: Uuid, occurred_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimEvent {
    Claimed { owner: Uuid, occurred_at: DateTime<Utc> },
    Released { owner: Uuid, occurred_at: DateTime<Utc> },
}

impl Event for ClaimEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ClaimEvent::Claimed { .. } => "identity.claim.claimed",
            ClaimEvent::Released { .. } => "identity.claim.released",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ClaimEvent::Claimed { occurred_at, .. } | ClaimEvent::Released { occurred_at, .. } => {
                *occurred_at
            }
        }
    }
}

impl Aggregate for UniqueClaim {
    type Command = ClaimCommand;
    type Event = ClaimEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "identity.claim";

    fn empty(id: AggregateId) -> Self {
        Self { id, owner: None, version: 0 }
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ClaimEvent::Claimed { owner, .. } => self.owner = Some(*owner),
            ClaimEvent::Released { .. } => self.owner = None,
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ClaimCommand::Claim { owner, occurred_at } => match self.owner {
                Some(current) if current == *owner => Ok(vec![]),
                Some(_) => Err(DomainError::conflict("key is already claimed")),
                None => Ok(vec![ClaimEvent::Claimed {
                    owner: *owner,
                    occurred_at: *occurred_at,
                }]),
            },
            ClaimCommand::Release { owner, occurred_at } => match self.owner {
                Some(current) if current == *owner => Ok(vec![ClaimEvent::Released {
                    owner: *owner,
                    occurred_at: *occurred_at,
                }]),
                Some(_) => Err(DomainError::Unauthorized),
                None => Ok(vec![]),
            },
        }
    }
}
