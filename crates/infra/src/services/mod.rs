//! Engine services: the operations the protocol surface calls.
//!
//! Each service is a thin orchestration layer over the aggregates. Decisions
//! stay in the aggregates; services supply randomness, hashing, time and
//! signing, dispatch commands, and map outcomes to [`EngineError`]. Every
//! dependency arrives through [`EngineDeps`]; nothing is ambient.

pub mod authorization;
pub mod clients;
pub mod identity;
pub mod sessions;
pub mod tokens;

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::{info, warn};

use gatekeep_core::{Clock, SystemClock};
use gatekeep_events::{AuditRecord, AuditSink, TracingAuditSink};
use gatekeep_identity::PasswordHasher;

use crate::command_dispatcher::CommandDispatcher;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::event_store::{EventStore, InMemoryEventStore};
use crate::external::{ExternalIdentityVerifier, StaticIdentityVerifier};
use crate::signer::{JwtSigner, Signer};

pub use authorization::{
    AuthorizationRedirect, AuthorizationService, AuthorizeError, AuthorizeRequest, IssuedCode,
};
pub use clients::{
    CLIENT_ASSERTION_TYPE, ClientProof, ClientRegistration, ClientService, RegisteredClient,
};
pub use identity::IdentityService;
pub use sessions::SessionManager;
pub use tokens::{Introspection, TokenRequest, TokenResponse, TokenService};

/// Explicit handles to every collaborator the services use.
pub struct EngineDeps {
    pub dispatcher: CommandDispatcher<Arc<dyn EventStore>>,
    pub signer: Arc<dyn Signer>,
    pub identity_verifier: Arc<dyn ExternalIdentityVerifier>,
    pub clock: Arc<dyn Clock>,
    pub audit: Arc<dyn AuditSink>,
    pub hasher: PasswordHasher,
    pub config: EngineConfig,
    /// Verified against when an email is unknown, so both paths cost one hash.
    dummy_password_hash: String,
}

impl EngineDeps {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        self.dispatcher.store()
    }

    /// Record directly to the audit sink. Used for security failures that do
    /// not produce an event (unknown email, bad client secret).
    pub(crate) fn audit(&self, record: AuditRecord) {
        if let Err(err) = self.audit.record(record) {
            warn!(error = %err, "audit sink rejected record");
        }
    }

    pub(crate) fn dummy_password_hash(&self) -> &str {
        &self.dummy_password_hash
    }
}

/// 32 bytes from the OS RNG, base64url without padding.
pub(crate) fn random_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// The assembled engine. Cloning is cheap; all services share one set of deps.
#[derive(Clone)]
pub struct Engine {
    pub identity: IdentityService,
    pub clients: ClientService,
    pub authorization: AuthorizationService,
    pub tokens: TokenService,
    pub sessions: SessionManager,
    deps: Arc<EngineDeps>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn deps(&self) -> &Arc<EngineDeps> {
        &self.deps
    }

    pub fn config(&self) -> &EngineConfig {
        &self.deps.config
    }

    pub fn signer(&self) -> &Arc<dyn Signer> {
        &self.deps.signer
    }
}

#[derive(Default)]
pub struct EngineBuilder {
    store: Option<Arc<dyn EventStore>>,
    signer: Option<Arc<dyn Signer>>,
    identity_verifier: Option<Arc<dyn ExternalIdentityVerifier>>,
    clock: Option<Arc<dyn Clock>>,
    audit: Option<Arc<dyn AuditSink>>,
    config: Option<EngineConfig>,
}

impl EngineBuilder {
    pub fn store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn identity_verifier(mut self, verifier: Arc<dyn ExternalIdentityVerifier>) -> Self {
        self.identity_verifier = Some(verifier);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Fill unset collaborators with in-process defaults and wire the services.
    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryEventStore::new()));
        let signer = match self.signer {
            Some(signer) => signer,
            None => {
                warn!("no signer configured; using an ephemeral HS256 key");
                Arc::new(JwtSigner::hs256(random_token().as_bytes(), "ephemeral"))
            }
        };

        let hasher = PasswordHasher::new(config.password_hashing)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let dummy_password_hash = hasher
            .hash(&random_token())
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        let dispatcher = CommandDispatcher::new(store)
            .with_max_conflict_retries(config.max_conflict_retries)
            .with_timeouts(config.timeouts);

        info!(
            issuer = %config.issuer,
            signing_alg = signer.algorithm(),
            kid = signer.key_id(),
            "engine initialised"
        );

        let deps = Arc::new(EngineDeps {
            dispatcher,
            signer,
            identity_verifier: self
                .identity_verifier
                .unwrap_or_else(|| Arc::new(StaticIdentityVerifier::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
            hasher,
            config,
            dummy_password_hash,
        });

        let sessions = SessionManager::new(deps.clone());
        let clients = ClientService::new(deps.clone());
        let identity = IdentityService::new(deps.clone(), sessions.clone());
        let authorization = AuthorizationService::new(deps.clone(), clients.clone(), sessions.clone());
        let tokens = TokenService::new(deps.clone(), clients.clone(), sessions.clone());

        Ok(Engine {
            identity,
            clients,
            authorization,
            tokens,
            sessions,
            deps,
        })
    }
}
