//! OAuth client registration aggregate.
//!
//! Confidential clients authenticate with a secret, of which only the SHA-256
//! digest is persisted, or with a registered public key (`private_key_jwt`).
//! Public clients hold no credential and must use PKCE.

use std::collections::BTreeSet;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use url::Url;

use gatekeep_core::{Aggregate, AggregateRoot, ClientId, DomainError};
use gatekeep_events::Event;

use crate::scope::ScopeSet;

// ─────────────────────────────────────────────────────────────────────────────
// Value types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Confidential,
    Public,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
    ClientCredentials,
}

impl GrantType {
    pub fn as_str(self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
            GrantType::ClientCredentials => "client_credentials",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "authorization_code" => Some(GrantType::AuthorizationCode),
            "refresh_token" => Some(GrantType::RefreshToken),
            "client_credentials" => Some(GrantType::ClientCredentials),
            _ => None,
        }
    }
}

/// Upper bound for a per-client token lifetime override: one leap year.
pub const MAX_TOKEN_TTL_SECS: i64 = 366 * 24 * 60 * 60;

/// How a confidential client proves its identity at the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientCredential {
    /// Output of [`digest_secret`]; the secret itself is never stored.
    SecretDigest { digest: String },
    /// PEM-encoded RSA public key verifying `private_key_jwt` assertions.
    PublicKey { pem: String },
}

impl ClientCredential {
    pub fn secret(secret: &str) -> Self {
        ClientCredential::SecretDigest {
            digest: digest_secret(secret),
        }
    }

    fn validate(&self) -> Result<(), DomainError> {
        match self {
            ClientCredential::SecretDigest { digest } if digest.is_empty() => {
                Err(DomainError::validation("secret digest cannot be empty"))
            }
            ClientCredential::PublicKey { pem }
                if !(pem.contains("-----BEGIN") && pem.contains("PUBLIC KEY-----")) =>
            {
                Err(DomainError::validation("client public key must be a PEM public key"))
            }
            _ => Ok(()),
        }
    }
}

/// Digest a raw client secret for storage: base64url(SHA-256(secret)).
pub fn digest_secret(secret: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(secret.as_bytes()))
}

/// Validate a redirect URI for registration.
///
/// Absolute, no fragment, and either `https` or `http` on a loopback host.
pub fn validate_redirect_uri(raw: &str) -> Result<Url, DomainError> {
    let url = Url::parse(raw)
        .map_err(|_| DomainError::validation(format!("redirect uri is not absolute: {raw}")))?;

    if url.fragment().is_some() {
        return Err(DomainError::validation("redirect uri must not contain a fragment"));
    }

    match url.scheme() {
        "https" => Ok(url),
        "http" if is_loopback(&url) => Ok(url),
        _ => Err(DomainError::validation(format!(
            "redirect uri must use https (or http on loopback): {raw}"
        ))),
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(d)) => d.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client Aggregate
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    pub client_type: ClientType,
    pub credential: Option<ClientCredential>,
    pub redirect_uris: BTreeSet<String>,
    pub allowed_scopes: ScopeSet,
    pub grant_types: BTreeSet<GrantType>,
    pub require_pkce: bool,
    /// Per-client overrides of the engine defaults.
    pub access_token_ttl_secs: Option<i64>,
    pub refresh_token_ttl_secs: Option<i64>,
    pub active: bool,
    pub version: u64,
    pub registered: bool,
}

impl Client {
    pub fn ensure_registered(&self) -> Result<(), DomainError> {
        if !self.registered {
            return Err(DomainError::NotFound);
        }
        Ok(())
    }

    /// Usable for new authorizations and token exchanges.
    pub fn ensure_usable(&self) -> Result<(), DomainError> {
        self.ensure_registered()?;
        if !self.active {
            return Err(DomainError::revoked("client is deactivated"));
        }
        Ok(())
    }

    pub fn is_confidential(&self) -> bool {
        self.client_type == ClientType::Confidential
    }

    /// Exact string comparison against the registered set.
    pub fn allows_redirect(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.contains(redirect_uri)
    }

    pub fn allows_grant(&self, grant: GrantType) -> bool {
        self.grant_types.contains(&grant)
    }

    /// Constant-time secret check. Public clients and key-holding clients
    /// never verify.
    pub fn verify_secret(&self, presented: &str) -> bool {
        match &self.credential {
            Some(ClientCredential::SecretDigest { digest }) => {
                let candidate = digest_secret(presented);
                bool::from(digest.as_bytes().ct_eq(candidate.as_bytes()))
            }
            _ => false,
        }
    }

    /// Key for `private_key_jwt` assertions, if the client registered one.
    pub fn public_key_pem(&self) -> Option<&str> {
        match &self.credential {
            Some(ClientCredential::PublicKey { pem }) => Some(pem),
            _ => None,
        }
    }
}

impl AggregateRoot for Client {
    type Id = ClientId;

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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterClient {
    pub client_id: ClientId,
    pub name: String,
    pub client_type: ClientType,
    /// Required iff confidential.
    pub credential: Option<ClientCredential>,
    pub redirect_uris: Vec<String>,
    pub allowed_scopes: ScopeSet,
    pub grant_types: Vec<GrantType>,
    pub require_pkce: bool,
    pub access_token_ttl_secs: Option<i64>,
    pub refresh_token_ttl_secs: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateClientSecret {
    pub secret_digest: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRedirectUris {
    pub redirect_uris: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeactivateClient {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ClientCommand {
    Register(RegisterClient),
    RotateSecret(RotateClientSecret),
    UpdateRedirectUris(UpdateRedirectUris),
    Deactivate(DeactivateClient),
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistered {
    pub client_id: ClientId,
    pub name: String,
    pub client_type: ClientType,
    pub credential: Option<ClientCredential>,
    pub redirect_uris: BTreeSet<String>,
    pub allowed_scopes: ScopeSet,
    pub grant_types: BTreeSet<GrantType>,
    pub require_pkce: bool,
    #[serde(default)]
    pub access_token_ttl_secs: Option<i64>,
    #[serde(default)]
    pub refresh_token_ttl_secs: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSecretRotated {
    pub secret_digest: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectUrisUpdated {
    pub redirect_uris: BTreeSet<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDeactivated {
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientEvent {
    Registered(ClientRegistered),
    SecretRotated(ClientSecretRotated),
    RedirectUrisUpdated(RedirectUrisUpdated),
    Deactivated(ClientDeactivated),
}

impl Event for ClientEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::Registered(_) => "identity.client.registered",
            ClientEvent::SecretRotated(_) => "identity.client.secret_rotated",
            ClientEvent::RedirectUrisUpdated(_) => "identity.client.redirect_uris_updated",
            ClientEvent::Deactivated(_) => "identity.client.deactivated",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ClientEvent::Registered(e) => e.occurred_at,
            ClientEvent::SecretRotated(e) => e.occurred_at,
            ClientEvent::RedirectUrisUpdated(e) => e.occurred_at,
            ClientEvent::Deactivated(e) => e.occurred_at,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate Implementation
// ─────────────────────────────────────────────────────────────────────────────

impl Aggregate for Client {
    type Command = ClientCommand;
    type Event = ClientEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "identity.client";

    fn empty(id: ClientId) -> Self {
        Self {
            id,
            name: String::new(),
            client_type: ClientType::Public,
            credential: None,
            redirect_uris: BTreeSet::new(),
            allowed_scopes: ScopeSet::default(),
            grant_types: BTreeSet::new(),
            require_pkce: true,
            access_token_ttl_secs: None,
            refresh_token_ttl_secs: None,
            active: false,
            version: 0,
            registered: false,
        }
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ClientEvent::Registered(e) => {
                self.id = e.client_id;
                self.name = e.name.clone();
                self.client_type = e.client_type;
                self.credential = e.credential.clone();
                self.redirect_uris = e.redirect_uris.clone();
                self.allowed_scopes = e.allowed_scopes.clone();
                self.grant_types = e.grant_types.clone();
                self.require_pkce = e.require_pkce;
                self.access_token_ttl_secs = e.access_token_ttl_secs;
                self.refresh_token_ttl_secs = e.refresh_token_ttl_secs;
                self.active = true;
                self.registered = true;
            }
            ClientEvent::SecretRotated(e) => {
                self.credential = Some(ClientCredential::SecretDigest {
                    digest: e.secret_digest.clone(),
                });
            }
            ClientEvent::RedirectUrisUpdated(e) => {
                self.redirect_uris = e.redirect_uris.clone();
            }
            ClientEvent::Deactivated(_) => {
                self.active = false;
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ClientCommand::Register(cmd) => self.handle_register(cmd),
            ClientCommand::RotateSecret(cmd) => self.handle_rotate_secret(cmd),
            ClientCommand::UpdateRedirectUris(cmd) => self.handle_update_redirects(cmd),
            ClientCommand::Deactivate(cmd) => self.handle_deactivate(cmd),
        }
    }
}

fn validated_redirects(raw: &[String]) -> Result<BTreeSet<String>, DomainError> {
    if raw.is_empty() {
        return Err(DomainError::validation("at least one redirect uri is required"));
    }
    raw.iter()
        .map(|uri| validate_redirect_uri(uri).map(|_| uri.clone()))
        .collect()
}

impl Client {
    // ─────────────────────────────────────────────────────────────────────────
    // Command Handlers
    // ─────────────────────────────────────────────────────────────────────────

    fn handle_register(&self, cmd: &RegisterClient) -> Result<Vec<ClientEvent>, DomainError> {
        if self.registered {
            return Err(DomainError::conflict("client already exists"));
        }
        let name = cmd.name.trim();
        if name.is_empty() {
            return Err(DomainError::validation("client name cannot be empty"));
        }

        let grant_types: BTreeSet<GrantType> = cmd.grant_types.iter().copied().collect();
        if grant_types.is_empty() {
            return Err(DomainError::validation("at least one grant type is required"));
        }
        if grant_types.contains(&GrantType::RefreshToken)
            && !grant_types.contains(&GrantType::AuthorizationCode)
        {
            return Err(DomainError::validation(
                "refresh_token grant requires authorization_code",
            ));
        }
        if grant_types.contains(&GrantType::ClientCredentials) && cmd.client_type == ClientType::Public {
            return Err(DomainError::validation("public clients cannot use client_credentials"));
        }

        let redirect_uris = if grant_types.contains(&GrantType::AuthorizationCode) {
            validated_redirects(&cmd.redirect_uris)?
        } else {
            BTreeSet::new()
        };

        for ttl in [cmd.access_token_ttl_secs, cmd.refresh_token_ttl_secs].into_iter().flatten() {
            if !(1..=MAX_TOKEN_TTL_SECS).contains(&ttl) {
                return Err(DomainError::validation(format!(
                    "token ttl must be between 1 and {MAX_TOKEN_TTL_SECS} seconds"
                )));
            }
        }

        match (cmd.client_type, &cmd.credential) {
            (ClientType::Confidential, None) => {
                return Err(DomainError::validation(
                    "confidential clients require a secret or a public key",
                ));
            }
            (ClientType::Confidential, Some(credential)) => credential.validate()?,
            (ClientType::Public, Some(_)) => {
                return Err(DomainError::validation("public clients cannot hold a credential"));
            }
            (ClientType::Public, None) if !cmd.require_pkce => {
                return Err(DomainError::validation("public clients must require PKCE"));
            }
            (ClientType::Public, None) => {}
        }

        Ok(vec![ClientEvent::Registered(ClientRegistered {
            client_id: cmd.client_id,
            name: name.to_string(),
            client_type: cmd.client_type,
            credential: cmd.credential.clone(),
            redirect_uris,
            allowed_scopes: cmd.allowed_scopes.clone(),
            grant_types,
            require_pkce: cmd.require_pkce,
            access_token_ttl_secs: cmd.access_token_ttl_secs,
            refresh_token_ttl_secs: cmd.refresh_token_ttl_secs,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_rotate_secret(&self, cmd: &RotateClientSecret) -> Result<Vec<ClientEvent>, DomainError> {
        self.ensure_usable()?;
        if !self.is_confidential() {
            return Err(DomainError::invariant("public clients have no secret"));
        }
        if self.public_key_pem().is_some() {
            return Err(DomainError::invariant("client authenticates with a public key"));
        }

        Ok(vec![ClientEvent::SecretRotated(ClientSecretRotated {
            secret_digest: cmd.secret_digest.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_update_redirects(&self, cmd: &UpdateRedirectUris) -> Result<Vec<ClientEvent>, DomainError> {
        self.ensure_usable()?;
        let redirect_uris = validated_redirects(&cmd.redirect_uris)?;
        if redirect_uris == self.redirect_uris {
            return Ok(vec![]);
        }

        Ok(vec![ClientEvent::RedirectUrisUpdated(RedirectUrisUpdated {
            redirect_uris,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_deactivate(&self, cmd: &DeactivateClient) -> Result<Vec<ClientEvent>, DomainError> {
        self.ensure_registered()?;
        if !self.active {
            return Ok(vec![]);
        }

        Ok(vec![ClientEvent::Deactivated(ClientDeactivated {
            occurred_at: cmd.occurred_at,
        })])
    }
}
