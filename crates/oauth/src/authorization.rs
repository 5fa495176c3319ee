//! Authorization request aggregate (authorization-code grant).
//!
//! `Created -> Consented -> CodeIssued -> {Redeemed | Expired | Revoked}`.
//! `Created` and `Consented` may also end in `Revoked` (denied) or `Expired`.
//! Terminal states accept no further transitions.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use gatekeep_core::{
    Aggregate, AggregateRoot, ClientId, DomainError, FamilyId, RequestId, SessionId, UserId,
};
use gatekeep_events::Event;
use gatekeep_identity::{Client, GrantType, ScopeSet};

use crate::pkce::PkceChallenge;

// ─────────────────────────────────────────────────────────────────────────────
// Authorization codes
// ─────────────────────────────────────────────────────────────────────────────

const CODE_ENTROPY_BYTES: usize = 32;

/// Opaque authorization code: `base64url(request_id ‖ 32 random bytes)`.
///
/// The embedded request id routes redemption to its stream; only the SHA-256
/// of the whole code is ever stored.
pub struct AuthorizationCode;

impl AuthorizationCode {
    pub fn generate(request_id: RequestId) -> String {
        let mut raw = Vec::with_capacity(16 + CODE_ENTROPY_BYTES);
        raw.extend_from_slice(request_id.as_uuid().as_bytes());
        let mut entropy = [0u8; CODE_ENTROPY_BYTES];
        OsRng.fill_bytes(&mut entropy);
        raw.extend_from_slice(&entropy);
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Extract the request id. `None` for anything that is not a well-formed code.
    pub fn request_id(code: &str) -> Option<RequestId> {
        let raw = URL_SAFE_NO_PAD.decode(code).ok()?;
        if raw.len() != 16 + CODE_ENTROPY_BYTES {
            return None;
        }
        let uuid = Uuid::from_slice(&raw[..16]).ok()?;
        Some(RequestId::from_uuid(uuid))
    }

    pub fn digest(code: &str) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(code.as_bytes()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationStatus {
    /// Stream does not exist yet.
    New,
    Created,
    Consented,
    CodeIssued,
    Redeemed,
    Expired,
    Revoked,
}

impl AuthorizationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AuthorizationStatus::Redeemed | AuthorizationStatus::Expired | AuthorizationStatus::Revoked
        )
    }
}

#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub id: RequestId,
    pub status: AuthorizationStatus,
    pub client_id: Option<ClientId>,
    pub user_id: Option<UserId>,
    pub session_id: Option<SessionId>,
    pub redirect_uri: String,
    pub scopes: ScopeSet,
    pub pkce: Option<PkceChallenge>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub auth_time: Option<DateTime<Utc>>,
    pub code_digest: Option<String>,
    pub family_id: Option<FamilyId>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

impl AuthorizationRequest {
    fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Eligible for physical deletion: finished or expired, and past the audit
    /// retention window.
    pub fn is_collectable(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        let finished = self.status.is_terminal() || self.is_past_expiry(now);
        finished && now >= self.expires_at + retention
    }
}

impl AggregateRoot for AuthorizationRequest {
    type Id = RequestId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CreateAuthorization {
    pub request_id: RequestId,
    /// Current client state, read from its stream by the caller.
    pub client: Client,
    pub redirect_uri: String,
    pub scopes: ScopeSet,
    pub pkce: Option<PkceChallenge>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RecordConsent {
    pub user_id: UserId,
    pub session_id: Option<SessionId>,
    pub auth_time: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IssueCode {
    pub code_digest: String,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RedeemCode {
    pub code: String,
    pub client_id: ClientId,
    pub redirect_uri: String,
    pub code_verifier: Option<String>,
    /// Family the issued tokens will belong to.
    pub family_id: FamilyId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum AuthorizationCommand {
    Create(CreateAuthorization),
    Consent(RecordConsent),
    IssueCode(IssueCode),
    Redeem(RedeemCode),
    Deny { occurred_at: DateTime<Utc> },
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCreated {
    pub request_id: RequestId,
    pub client_id: ClientId,
    pub redirect_uri: String,
    pub scopes: ScopeSet,
    pub pkce: Option<PkceChallenge>,
    pub state: Option<String>,
    pub nonce: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationConsented {
    pub user_id: UserId,
    pub session_id: Option<SessionId>,
    pub auth_time: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeIssued {
    pub code_digest: String,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRedeemed {
    pub family_id: FamilyId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Denied,
    UnknownCode,
    ClientMismatch,
    RedirectMismatch,
    PkceFailed,
}

impl RevocationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RevocationReason::Denied => "denied",
            RevocationReason::UnknownCode => "unknown_code",
            RevocationReason::ClientMismatch => "client_mismatch",
            RevocationReason::RedirectMismatch => "redirect_mismatch",
            RevocationReason::PkceFailed => "pkce_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationEvent {
    Created(AuthorizationCreated),
    Consented(AuthorizationConsented),
    CodeIssued(CodeIssued),
    Redeemed(CodeRedeemed),
    Expired { occurred_at: DateTime<Utc> },
    Revoked { reason: RevocationReason, occurred_at: DateTime<Utc> },
}

impl Event for AuthorizationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AuthorizationEvent::Created(_) => "oauth.authorization.created",
            AuthorizationEvent::Consented(_) => "oauth.authorization.consented",
            AuthorizationEvent::CodeIssued(_) => "oauth.authorization.code_issued",
            AuthorizationEvent::Redeemed(_) => "oauth.authorization.redeemed",
            AuthorizationEvent::Expired { .. } => "oauth.authorization.expired",
            AuthorizationEvent::Revoked { .. } => "oauth.authorization.revoked",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AuthorizationEvent::Created(e) => e.occurred_at,
            AuthorizationEvent::Consented(e) => e.occurred_at,
            AuthorizationEvent::CodeIssued(e) => e.occurred_at,
            AuthorizationEvent::Redeemed(e) => e.occurred_at,
            AuthorizationEvent::Expired { occurred_at } => *occurred_at,
            AuthorizationEvent::Revoked { occurred_at, .. } => *occurred_at,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate Implementation
// ─────────────────────────────────────────────────────────────────────────────

impl Aggregate for AuthorizationRequest {
    type Command = AuthorizationCommand;
    type Event = AuthorizationEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "oauth.authorization";

    fn empty(id: RequestId) -> Self {
        Self {
            id,
            status: AuthorizationStatus::New,
            client_id: None,
            user_id: None,
            session_id: None,
            redirect_uri: String::new(),
            scopes: ScopeSet::default(),
            pkce: None,
            state: None,
            nonce: None,
            auth_time: None,
            code_digest: None,
            family_id: None,
            expires_at: DateTime::<Utc>::MIN_UTC,
            version: 0,
        }
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AuthorizationEvent::Created(e) => {
                self.id = e.request_id;
                self.client_id = Some(e.client_id);
                self.redirect_uri = e.redirect_uri.clone();
                self.scopes = e.scopes.clone();
                self.pkce = e.pkce.clone();
                self.state = e.state.clone();
                self.nonce = e.nonce.clone();
                self.expires_at = e.expires_at;
                self.status = AuthorizationStatus::Created;
            }
            AuthorizationEvent::Consented(e) => {
                self.user_id = Some(e.user_id);
                self.session_id = e.session_id;
                self.auth_time = Some(e.auth_time);
                self.status = AuthorizationStatus::Consented;
            }
            AuthorizationEvent::CodeIssued(e) => {
                self.code_digest = Some(e.code_digest.clone());
                self.expires_at = e.expires_at;
                self.status = AuthorizationStatus::CodeIssued;
            }
            AuthorizationEvent::Redeemed(e) => {
                self.family_id = Some(e.family_id);
                self.status = AuthorizationStatus::Redeemed;
            }
            AuthorizationEvent::Expired { .. } => {
                self.status = AuthorizationStatus::Expired;
            }
            AuthorizationEvent::Revoked { .. } => {
                self.status = AuthorizationStatus::Revoked;
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            AuthorizationCommand::Create(cmd) => self.handle_create(cmd),
            other => self.handle_transition(other),
        }
    }
}

fn command_time(command: &AuthorizationCommand) -> DateTime<Utc> {
    match command {
        AuthorizationCommand::Create(c) => c.occurred_at,
        AuthorizationCommand::Consent(c) => c.occurred_at,
        AuthorizationCommand::IssueCode(c) => c.occurred_at,
        AuthorizationCommand::Redeem(c) => c.occurred_at,
        AuthorizationCommand::Deny { occurred_at } => *occurred_at,
    }
}

impl AuthorizationRequest {
    // ─────────────────────────────────────────────────────────────────────────
    // Command Handlers
    // ─────────────────────────────────────────────────────────────────────────

    fn handle_create(&self, cmd: &CreateAuthorization) -> Result<Vec<AuthorizationEvent>, DomainError> {
        if self.status != AuthorizationStatus::New {
            return Err(DomainError::conflict("authorization request already exists"));
        }

        let client = &cmd.client;
        client.ensure_usable()?;
        if !client.allows_grant(GrantType::AuthorizationCode) {
            return Err(DomainError::Unauthorized);
        }
        if !client.allows_redirect(&cmd.redirect_uri) {
            return Err(DomainError::validation("redirect_uri is not registered"));
        }
        if cmd.scopes.is_empty() {
            return Err(DomainError::validation("scope is required"));
        }
        if !cmd.scopes.is_subset_of(&client.allowed_scopes) {
            return Err(DomainError::validation("requested scope exceeds client allowance"));
        }
        if client.require_pkce && cmd.pkce.is_none() {
            return Err(DomainError::validation("code_challenge is required"));
        }
        if cmd.expires_at <= cmd.occurred_at {
            return Err(DomainError::validation("expiry must be in the future"));
        }

        Ok(vec![AuthorizationEvent::Created(AuthorizationCreated {
            request_id: cmd.request_id,
            client_id: client.id,
            redirect_uri: cmd.redirect_uri.clone(),
            scopes: cmd.scopes.clone(),
            pkce: cmd.pkce.clone(),
            state: cmd.state.clone(),
            nonce: cmd.nonce.clone(),
            expires_at: cmd.expires_at,
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Every non-creating command: terminal states refuse, an elapsed deadline
    /// expires the request before anything else is considered.
    fn handle_transition(
        &self,
        command: &AuthorizationCommand,
    ) -> Result<Vec<AuthorizationEvent>, DomainError> {
        match self.status {
            AuthorizationStatus::New => return Err(DomainError::NotFound),
            AuthorizationStatus::Redeemed => {
                return Err(DomainError::revoked("authorization code already redeemed"));
            }
            AuthorizationStatus::Expired => {
                return Err(DomainError::expired("authorization request expired"));
            }
            AuthorizationStatus::Revoked => {
                return Err(DomainError::revoked("authorization request revoked"));
            }
            _ => {}
        }

        let now = command_time(command);
        if self.is_past_expiry(now) {
            return Ok(vec![AuthorizationEvent::Expired { occurred_at: now }]);
        }

        match command {
            AuthorizationCommand::Create(_) => {
                Err(DomainError::conflict("authorization request already exists"))
            }
            AuthorizationCommand::Consent(cmd) => self.handle_consent(cmd),
            AuthorizationCommand::IssueCode(cmd) => self.handle_issue_code(cmd),
            AuthorizationCommand::Redeem(cmd) => self.handle_redeem(cmd),
            AuthorizationCommand::Deny { occurred_at } => Ok(vec![AuthorizationEvent::Revoked {
                reason: RevocationReason::Denied,
                occurred_at: *occurred_at,
            }]),
        }
    }

    fn handle_consent(&self, cmd: &RecordConsent) -> Result<Vec<AuthorizationEvent>, DomainError> {
        if self.status != AuthorizationStatus::Created {
            return Err(DomainError::invariant("consent already recorded"));
        }

        Ok(vec![AuthorizationEvent::Consented(AuthorizationConsented {
            user_id: cmd.user_id,
            session_id: cmd.session_id,
            auth_time: cmd.auth_time,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_issue_code(&self, cmd: &IssueCode) -> Result<Vec<AuthorizationEvent>, DomainError> {
        if self.status != AuthorizationStatus::Consented {
            return Err(DomainError::invariant("code can only be issued after consent"));
        }
        if cmd.expires_at <= cmd.occurred_at {
            return Err(DomainError::validation("code expiry must be in the future"));
        }

        Ok(vec![AuthorizationEvent::CodeIssued(CodeIssued {
            code_digest: cmd.code_digest.clone(),
            expires_at: cmd.expires_at,
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Any mismatch revokes the code on the spot; the caller sees a `Revoked`
    /// event instead of `Redeemed` and reports `invalid_grant`.
    fn handle_redeem(&self, cmd: &RedeemCode) -> Result<Vec<AuthorizationEvent>, DomainError> {
        if self.status != AuthorizationStatus::CodeIssued {
            return Err(DomainError::invariant("no code has been issued"));
        }

        let revoke = |reason| {
            Ok(vec![AuthorizationEvent::Revoked {
                reason,
                occurred_at: cmd.occurred_at,
            }])
        };

        let presented = AuthorizationCode::digest(&cmd.code);
        let code_matches = self
            .code_digest
            .as_deref()
            .is_some_and(|stored| bool::from(stored.as_bytes().ct_eq(presented.as_bytes())));
        if !code_matches {
            return revoke(RevocationReason::UnknownCode);
        }
        if self.client_id != Some(cmd.client_id) {
            return revoke(RevocationReason::ClientMismatch);
        }
        if self.redirect_uri != cmd.redirect_uri {
            return revoke(RevocationReason::RedirectMismatch);
        }
        match (&self.pkce, cmd.code_verifier.as_deref()) {
            (Some(challenge), Some(verifier)) if challenge.verify(verifier) => {}
            (None, None) => {}
            _ => return revoke(RevocationReason::PkceFailed),
        }

        Ok(vec![AuthorizationEvent::Redeemed(CodeRedeemed {
            family_id: cmd.family_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkce::{PkceMethod, s256};
    use gatekeep_identity::client::{ClientType, RegisterClient};
    use gatekeep_identity::ClientCommand;

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
    const REDIRECT: &str = "https://app.example.com/cb";

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn public_client() -> Client {
        let cmd = RegisterClient {
            client_id: ClientId::new(),
            name: "spa".to_string(),
            client_type: ClientType::Public,
            credential: None,
            redirect_uris: vec![REDIRECT.to_string()],
            allowed_scopes: ScopeSet::parse("openid profile offline_access").unwrap(),
            grant_types: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
            require_pkce: true,
            access_token_ttl_secs: None,
            refresh_token_ttl_secs: None,
            occurred_at: t0(),
        };
        let mut client = Client::empty(cmd.client_id);
        for e in client.handle(&ClientCommand::Register(cmd)).unwrap() {
            client.apply(&e);
        }
        client
    }

    fn execute(req: &mut AuthorizationRequest, cmd: AuthorizationCommand) -> Vec<AuthorizationEvent> {
        let events = req.handle(&cmd).unwrap();
        for e in &events {
            req.apply(e);
        }
        events
    }

    /// Drive a request to `CodeIssued`; returns it with the raw code.
    fn issued(client: &Client) -> (AuthorizationRequest, String) {
        let request_id = RequestId::new();
        let mut req = AuthorizationRequest::empty(request_id);
        execute(
            &mut req,
            AuthorizationCommand::Create(CreateAuthorization {
                request_id,
                client: client.clone(),
                redirect_uri: REDIRECT.to_string(),
                scopes: ScopeSet::parse("openid profile").unwrap(),
                pkce: Some(PkceChallenge::new(s256(VERIFIER), PkceMethod::S256).unwrap()),
                state: Some("xyz".to_string()),
                nonce: Some("n-0S6".to_string()),
                expires_at: t0() + Duration::minutes(10),
                occurred_at: t0(),
            }),
        );
        execute(
            &mut req,
            AuthorizationCommand::Consent(RecordConsent {
                user_id: UserId::new(),
                session_id: None,
                auth_time: t0(),
                occurred_at: t0(),
            }),
        );
        let code = AuthorizationCode::generate(request_id);
        execute(
            &mut req,
            AuthorizationCommand::IssueCode(IssueCode {
                code_digest: AuthorizationCode::digest(&code),
                expires_at: t0() + Duration::minutes(1),
                occurred_at: t0(),
            }),
        );
        (req, code)
    }

    fn redeem(client: &Client, code: &str, verifier: &str, at: DateTime<Utc>) -> AuthorizationCommand {
        AuthorizationCommand::Redeem(RedeemCode {
            code: code.to_string(),
            client_id: client.id,
            redirect_uri: REDIRECT.to_string(),
            code_verifier: Some(verifier.to_string()),
            family_id: FamilyId::new(),
            occurred_at: at,
        })
    }

    #[test]
    fn code_embeds_request_id() {
        let id = RequestId::new();
        let code = AuthorizationCode::generate(id);
        assert_eq!(AuthorizationCode::request_id(&code), Some(id));
        assert_ne!(AuthorizationCode::generate(id), code);
        assert_eq!(AuthorizationCode::request_id("abc123"), None);
    }

    #[test]
    fn happy_path_redeems_once() {
        let client = public_client();
        let (mut req, code) = issued(&client);

        let events = execute(&mut req, redeem(&client, &code, VERIFIER, t0()));
        assert!(matches!(events[0], AuthorizationEvent::Redeemed(_)));
        assert_eq!(req.status, AuthorizationStatus::Redeemed);

        let again = req.handle(&redeem(&client, &code, VERIFIER, t0()));
        assert!(matches!(again, Err(DomainError::Revoked(_))));
    }

    #[test]
    fn wrong_verifier_revokes_code() {
        let client = public_client();
        let (mut req, code) = issued(&client);

        let events = execute(&mut req, redeem(&client, &code, &"x".repeat(43), t0()));
        assert_eq!(
            events[0],
            AuthorizationEvent::Revoked {
                reason: RevocationReason::PkceFailed,
                occurred_at: t0()
            }
        );

        // Even the right verifier is now useless.
        assert!(req.handle(&redeem(&client, &code, VERIFIER, t0())).is_err());
    }

    #[test]
    fn redirect_must_match_exactly() {
        let client = public_client();
        let (req, code) = issued(&client);
        let cmd = AuthorizationCommand::Redeem(RedeemCode {
            code,
            client_id: client.id,
            redirect_uri: format!("{REDIRECT}/"),
            code_verifier: Some(VERIFIER.to_string()),
            family_id: FamilyId::new(),
            occurred_at: t0(),
        });
        let events = req.handle(&cmd).unwrap();
        assert!(matches!(
            events[0],
            AuthorizationEvent::Revoked { reason: RevocationReason::RedirectMismatch, .. }
        ));
    }

    #[test]
    fn expired_code_is_expired_lazily() {
        let client = public_client();
        let (mut req, code) = issued(&client);

        let late = t0() + Duration::minutes(2);
        let events = execute(&mut req, redeem(&client, &code, VERIFIER, late));
        assert!(matches!(events[0], AuthorizationEvent::Expired { .. }));
        assert!(matches!(
            req.handle(&redeem(&client, &code, VERIFIER, late)),
            Err(DomainError::Expired(_))
        ));
    }

    #[test]
    fn create_validates_against_client() {
        let client = public_client();
        let base = CreateAuthorization {
            request_id: RequestId::new(),
            client: client.clone(),
            redirect_uri: REDIRECT.to_string(),
            scopes: ScopeSet::parse("openid").unwrap(),
            pkce: Some(PkceChallenge::new(s256(VERIFIER), PkceMethod::S256).unwrap()),
            state: None,
            nonce: None,
            expires_at: t0() + Duration::minutes(10),
            occurred_at: t0(),
        };
        let empty = AuthorizationRequest::empty(base.request_id);

        let mut wrong_redirect = base.clone();
        wrong_redirect.redirect_uri = "https://evil.example.com/cb".to_string();
        assert!(empty.handle(&AuthorizationCommand::Create(wrong_redirect)).is_err());

        let mut wide_scope = base.clone();
        wide_scope.scopes = ScopeSet::parse("openid admin").unwrap();
        assert!(empty.handle(&AuthorizationCommand::Create(wide_scope)).is_err());

        let mut no_pkce = base.clone();
        no_pkce.pkce = None;
        assert!(empty.handle(&AuthorizationCommand::Create(no_pkce)).is_err());

        assert!(empty.handle(&AuthorizationCommand::Create(base)).is_ok());
    }

    #[test]
    fn deny_is_terminal() {
        let client = public_client();
        let (mut req, _code) = issued(&client);
        execute(&mut req, AuthorizationCommand::Deny { occurred_at: t0() });
        assert_eq!(req.status, AuthorizationStatus::Revoked);
        assert!(req.handle(&AuthorizationCommand::Deny { occurred_at: t0() }).is_err());
    }

    #[test]
    fn collectable_after_retention() {
        let client = public_client();
        let (req, _code) = issued(&client);
        let retention = Duration::hours(1);
        assert!(!req.is_collectable(t0(), retention));
        assert!(!req.is_collectable(t0() + Duration::minutes(30), retention));
        assert!(req.is_collectable(t0() + Duration::minutes(61), retention));
    }
}
