//! Token family aggregate.
//!
//! Every token descending from one grant (a code redemption or a
//! client-credentials request) lives in one family stream. Rotation, cascade
//! revocation and refresh-token reuse detection are decided here, so the
//! stream's optimistic concurrency is what makes two concurrent rotations of
//! the same refresh token impossible: the loser re-reads, finds the token
//! already rotated, and is treated as reuse.
//!
//! A family can be revoked before it is opened. The code-replay path knows the
//! family id as soon as the code is redeemed, while the redeeming exchange may
//! still be minting; the tombstone makes that exchange's `Open` fail.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gatekeep_core::{Aggregate, AggregateRoot, ClientId, DomainError, FamilyId, SessionId, UserId};
use gatekeep_events::Event;
use gatekeep_identity::ScopeSet;

use crate::claims::TokenUse;

/// Who a family was granted to. Recorded once, on the first issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyGrant {
    pub client_id: ClientId,
    pub subject: String,
    pub user_id: Option<UserId>,
    pub session_id: Option<SessionId>,
    pub scopes: ScopeSet,
    pub auth_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub jti: Uuid,
    pub token_use: TokenUse,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub jti: Uuid,
    pub token_use: TokenUse,
    pub parent_jti: Option<Uuid>,
    /// Stream version of the issuing event; tokens minted together share it.
    pub batch: u64,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenRevocationReason {
    Rotated,
    Requested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FamilyRevocationReason {
    RefreshReuse,
    CodeReplay,
    SessionRevoked,
    ClientDeactivated,
    Requested,
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TokenFamily {
    pub id: FamilyId,
    pub grant: Option<FamilyGrant>,
    pub tokens: BTreeMap<Uuid, TokenRecord>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl TokenFamily {
    pub fn ensure_exists(&self) -> Result<&FamilyGrant, DomainError> {
        self.grant.as_ref().ok_or(DomainError::NotFound)
    }

    pub fn token(&self, jti: &Uuid) -> Option<&TokenRecord> {
        self.tokens.get(jti)
    }

    /// Strong revocation check for a presented token.
    pub fn check_token(&self, jti: &Uuid) -> Result<&TokenRecord, DomainError> {
        self.ensure_exists()?;
        if self.revoked {
            return Err(DomainError::revoked("token family revoked"));
        }
        let record = self.tokens.get(jti).ok_or(DomainError::NotFound)?;
        if record.revoked {
            return Err(DomainError::revoked("token revoked"));
        }
        Ok(record)
    }

    /// Latest expiry of any token in the family.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.tokens.values().map(|t| t.expires_at).max()
    }

    /// Past its last expiry plus `retention`. A tombstone that never held
    /// tokens ages from its revocation instead.
    pub fn is_collectable(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        match (self.expires_at(), self.revoked_at) {
            (Some(expires_at), _) => now >= expires_at + retention,
            (None, Some(revoked_at)) => now >= revoked_at + retention,
            (None, None) => false,
        }
    }

    /// Not-yet-revoked tokens reachable from `root`: itself, tokens minted in
    /// the same batch when `root` is a refresh token, and everything issued
    /// by rotating any of those.
    fn revocable_chain(&self, root: &Uuid) -> Vec<Uuid> {
        let Some(root_record) = self.tokens.get(root) else {
            return vec![];
        };

        let mut seen = BTreeSet::from([*root]);
        if root_record.token_use == TokenUse::Refresh {
            seen.extend(
                self.tokens
                    .values()
                    .filter(|t| t.batch == root_record.batch)
                    .map(|t| t.jti),
            );
        }

        let mut frontier: Vec<Uuid> = seen.iter().copied().collect();
        while let Some(parent) = frontier.pop() {
            for child in self.tokens.values().filter(|t| t.parent_jti == Some(parent)) {
                if seen.insert(child.jti) {
                    frontier.push(child.jti);
                }
            }
        }

        seen.into_iter()
            .filter(|jti| self.tokens.get(jti).is_some_and(|t| !t.revoked))
            .collect()
    }
}

impl AggregateRoot for TokenFamily {
    type Id = FamilyId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands & Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum TokenFamilyCommand {
    Open {
        grant: FamilyGrant,
        tokens: Vec<IssuedToken>,
        occurred_at: DateTime<Utc>,
    },
    Rotate {
        presented_jti: Uuid,
        tokens: Vec<IssuedToken>,
        occurred_at: DateTime<Utc>,
    },
    Revoke {
        jti: Uuid,
        occurred_at: DateTime<Utc>,
    },
    RevokeFamily {
        reason: FamilyRevocationReason,
        occurred_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenFamilyEvent {
    TokensIssued {
        /// Present only on the first issuance of a family.
        grant: Option<FamilyGrant>,
        parent_jti: Option<Uuid>,
        tokens: Vec<IssuedToken>,
        occurred_at: DateTime<Utc>,
    },
    TokenRevoked {
        jtis: Vec<Uuid>,
        reason: TokenRevocationReason,
        occurred_at: DateTime<Utc>,
    },
    RefreshReuseDetected {
        jti: Uuid,
        occurred_at: DateTime<Utc>,
    },
    FamilyRevoked {
        reason: FamilyRevocationReason,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for TokenFamilyEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TokenFamilyEvent::TokensIssued { .. } => "oauth.family.tokens_issued",
            TokenFamilyEvent::TokenRevoked { .. } => "oauth.family.token_revoked",
            TokenFamilyEvent::RefreshReuseDetected { .. } => "oauth.family.refresh_reuse_detected",
            TokenFamilyEvent::FamilyRevoked { .. } => "oauth.family.revoked",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TokenFamilyEvent::TokensIssued { occurred_at, .. }
            | TokenFamilyEvent::TokenRevoked { occurred_at, .. }
            | TokenFamilyEvent::RefreshReuseDetected { occurred_at, .. }
            | TokenFamilyEvent::FamilyRevoked { occurred_at, .. } => *occurred_at,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate Implementation
// ─────────────────────────────────────────────────────────────────────────────

impl Aggregate for TokenFamily {
    type Command = TokenFamilyCommand;
    type Event = TokenFamilyEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "oauth.token_family";

    fn empty(id: FamilyId) -> Self {
        Self {
            id,
            grant: None,
            tokens: BTreeMap::new(),
            revoked: false,
            revoked_at: None,
            version: 0,
        }
    }

    fn apply(&mut self, event: &Self::Event) {
        self.version += 1;
        match event {
            TokenFamilyEvent::TokensIssued { grant, parent_jti, tokens, occurred_at } => {
                if let Some(grant) = grant {
                    self.grant = Some(grant.clone());
                }
                for t in tokens {
                    self.tokens.insert(
                        t.jti,
                        TokenRecord {
                            jti: t.jti,
                            token_use: t.token_use,
                            parent_jti: *parent_jti,
                            batch: self.version,
                            issued_at: *occurred_at,
                            expires_at: t.expires_at,
                            revoked: false,
                        },
                    );
                }
            }
            TokenFamilyEvent::TokenRevoked { jtis, .. } => {
                for jti in jtis {
                    if let Some(t) = self.tokens.get_mut(jti) {
                        t.revoked = true;
                    }
                }
            }
            TokenFamilyEvent::RefreshReuseDetected { .. } => {}
            TokenFamilyEvent::FamilyRevoked { occurred_at, .. } => {
                self.revoked = true;
                self.revoked_at = Some(*occurred_at);
                for t in self.tokens.values_mut() {
                    t.revoked = true;
                }
            }
        }
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            TokenFamilyCommand::Open { grant, tokens, occurred_at } => {
                if self.revoked {
                    return Err(DomainError::revoked("token family revoked before issuance"));
                }
                if self.grant.is_some() {
                    return Err(DomainError::conflict("token family already exists"));
                }
                validate_batch(tokens, *occurred_at)?;
                Ok(vec![TokenFamilyEvent::TokensIssued {
                    grant: Some(grant.clone()),
                    parent_jti: None,
                    tokens: tokens.clone(),
                    occurred_at: *occurred_at,
                }])
            }
            TokenFamilyCommand::Rotate { presented_jti, tokens, occurred_at } => {
                self.handle_rotate(*presented_jti, tokens, *occurred_at)
            }
            TokenFamilyCommand::Revoke { jti, occurred_at } => {
                self.ensure_exists()?;
                let jtis = self.revocable_chain(jti);
                if jtis.is_empty() {
                    return Ok(vec![]);
                }
                Ok(vec![TokenFamilyEvent::TokenRevoked {
                    jtis,
                    reason: TokenRevocationReason::Requested,
                    occurred_at: *occurred_at,
                }])
            }
            // Also valid on an unopened family: it leaves a tombstone.
            TokenFamilyCommand::RevokeFamily { reason, occurred_at } => {
                if self.revoked {
                    return Ok(vec![]);
                }
                Ok(vec![TokenFamilyEvent::FamilyRevoked {
                    reason: *reason,
                    occurred_at: *occurred_at,
                }])
            }
        }
    }
}

fn validate_batch(tokens: &[IssuedToken], now: DateTime<Utc>) -> Result<(), DomainError> {
    if tokens.is_empty() {
        return Err(DomainError::validation("at least one token must be issued"));
    }
    if tokens.iter().any(|t| t.expires_at <= now) {
        return Err(DomainError::validation("token expiry must be in the future"));
    }
    Ok(())
}

impl TokenFamily {
    fn handle_rotate(
        &self,
        presented: Uuid,
        tokens: &[IssuedToken],
        now: DateTime<Utc>,
    ) -> Result<Vec<TokenFamilyEvent>, DomainError> {
        self.ensure_exists()?;
        if self.revoked {
            return Err(DomainError::revoked("token family revoked"));
        }

        let record = self.tokens.get(&presented).ok_or(DomainError::NotFound)?;
        if record.token_use != TokenUse::Refresh {
            return Err(DomainError::validation("not a refresh token"));
        }

        // A rotated (or otherwise revoked) refresh token showing up again means
        // two parties hold it. Kill the whole family; the caller reports failure.
        if record.revoked {
            return Ok(vec![
                TokenFamilyEvent::RefreshReuseDetected {
                    jti: presented,
                    occurred_at: now,
                },
                TokenFamilyEvent::FamilyRevoked {
                    reason: FamilyRevocationReason::RefreshReuse,
                    occurred_at: now,
                },
            ]);
        }

        if now >= record.expires_at {
            return Err(DomainError::expired("refresh token expired"));
        }
        validate_batch(tokens, now)?;

        Ok(vec![
            TokenFamilyEvent::TokenRevoked {
                jtis: vec![presented],
                reason: TokenRevocationReason::Rotated,
                occurred_at: now,
            },
            TokenFamilyEvent::TokensIssued {
                grant: None,
                parent_jti: Some(presented),
                tokens: tokens.to_vec(),
                occurred_at: now,
            },
        ])
    }
}
