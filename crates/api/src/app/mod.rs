//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: event store, bus, engine and background projections
//! - `routes/`: handlers, one file per endpoint group
//! - `dto.rs`: request DTOs and JSON mapping helpers
//! - `errors.rs`: OAuth2 and plain JSON error responses
//! - `session_cookie.rs`: the signed login-session cookie

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use crate::config::ApiConfig;
use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;
pub mod session_cookie;

use services::AppServices;

/// Build the full HTTP router from configuration.
pub fn build_app(config: ApiConfig) -> anyhow::Result<Router> {
    let services = Arc::new(services::build_services(config)?);
    Ok(router(services))
}

/// Router over already assembled services.
pub fn router(services: Arc<AppServices>) -> Router {
    let protected = routes::protected_router().layer(axum::middleware::from_fn_with_state(
        services.clone(),
        middleware::auth_middleware,
    ));

    Router::new()
        .merge(routes::public_router())
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(middleware::request_context))
                .layer(Extension(services)),
        )
}
