use axum::{
    Router,
    routing::{delete, get, post},
};

pub mod account;
pub mod clients;
pub mod discovery;
pub mod oauth;
pub mod system;

/// Endpoints reachable without a bearer token.
pub fn public_router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/.well-known/openid_configuration", get(discovery::openid_configuration))
        .route("/.well-known/openid-configuration", get(discovery::openid_configuration))
        .route("/jwks", get(discovery::jwks))
        .nest("/oauth2", oauth::router())
        .route("/users", post(account::register_user))
        .route("/login", post(account::login))
        .route("/clients", post(clients::register_client))
}

/// Endpoints acting on behalf of the user behind a bearer access token.
pub fn protected_router() -> Router {
    Router::new()
        .route("/userinfo", get(account::userinfo))
        .route("/sessions", get(account::list_sessions))
        .route("/sessions/:session_id", delete(account::revoke_session))
        .route("/logout/all", post(account::logout_all))
}
