//! Process wiring: event store, bus, engine, background projections.

use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use serde_json::Value as JsonValue;
use tracing::info;

use gatekeep_core::UserId;
use gatekeep_events::{EventEnvelope, InMemoryEventBus, TracingAuditSink, TracingEmailNotifier};
use gatekeep_infra::event_store::{EventStore, InMemoryEventStore, PublishingEventStore};
use gatekeep_infra::projections::{AuditProjector, UserReadModel, UsersProjection};
use gatekeep_infra::read_model::InMemoryReadStore;
use gatekeep_infra::workers::{WorkerHandle, spawn_projection};
use gatekeep_infra::{CallContext, Engine, EngineError};

use crate::app::session_cookie::SessionCookies;
use crate::config::ApiConfig;

pub type EnvelopeBus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
pub type UserDirectory = UsersProjection<Arc<InMemoryReadStore<UserId, UserReadModel>>>;

/// Everything a handler can reach. Shared behind an `Arc` extension.
pub struct AppServices {
    pub engine: Engine,
    /// Eventually consistent user directory fed by the bus.
    pub users: UserDirectory,
    pub cookies: SessionCookies,
    pub config: ApiConfig,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl AppServices {
    /// Directory entry if the projection has caught up, otherwise the
    /// aggregate itself.
    pub async fn user_profile(&self, ctx: &CallContext, user_id: UserId) -> Result<UserReadModel, EngineError> {
        if let Some(user) = self.users.get(&user_id) {
            return Ok(user);
        }
        let user = self.engine.identity.get_user(ctx, user_id).await?;
        let registered_at = user
            .registered_at
            .ok_or_else(|| EngineError::Internal("registered user without registration time".to_string()))?;
        Ok(UserReadModel {
            user_id: user.id,
            email: user.email,
            roles: user.roles.iter().map(|r| r.as_str().to_string()).collect(),
            linked_identities: user.linked_identities.into_iter().collect(),
            active: user.active,
            registered_at,
            last_authenticated_at: user.last_authenticated_at,
            updated_at: user.last_authenticated_at.unwrap_or(registered_at),
        })
    }

    /// Stop the projection workers. Called once on graceful shutdown.
    pub fn shutdown(&self) {
        let handles: Vec<WorkerHandle> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => return,
        };
        for handle in handles {
            handle.shutdown();
        }
        info!("projection workers stopped");
    }
}

pub fn build_services(config: ApiConfig) -> anyhow::Result<AppServices> {
    let bus: EnvelopeBus = Arc::new(InMemoryEventBus::new());
    let store: Arc<dyn EventStore> = Arc::new(PublishingEventStore::new(InMemoryEventStore::new(), bus.clone()));

    let signer = config.signing.signer().context("loading token signing key")?;
    let engine = Engine::builder()
        .store(store)
        .signer(signer)
        .audit(Arc::new(TracingAuditSink))
        .config(config.engine.clone())
        .build()
        .context("assembling engine")?;

    let directory = Arc::new(InMemoryReadStore::new());
    let users_worker = spawn_projection("users-projection", &bus, UsersProjection::new(directory.clone()))
        .context("spawning users projection")?;
    let audit_worker = spawn_projection(
        "audit-projector",
        &bus,
        AuditProjector::new(TracingAuditSink, TracingEmailNotifier),
    )
    .context("spawning audit projector")?;

    let cookies = SessionCookies::new(
        config.session_secret.as_bytes(),
        config.session_ttl,
        config.secure_cookies,
    );

    Ok(AppServices {
        engine,
        users: UsersProjection::new(directory),
        cookies,
        config,
        workers: Mutex::new(vec![users_worker, audit_worker]),
    })
}
