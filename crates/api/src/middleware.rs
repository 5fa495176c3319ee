use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{Instrument, debug, info_span};
use uuid::Uuid;

use gatekeep_infra::{CallContext, VerifyError};

use crate::app::errors::json_error;
use crate::app::services::AppServices;
use crate::context::{PrincipalContext, REQUEST_ID_HEADER};

/// Upper bound on the engine work a single request may trigger.
const REQUEST_DEADLINE: Duration = Duration::from_secs(10);

/// Attach a [`CallContext`] to every request and echo its correlation id.
///
/// A caller-supplied `x-request-id` is honoured when it is a UUID.
pub async fn request_context(mut req: axum::http::Request<axum::body::Body>, next: Next) -> Response {
    let correlation_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .unwrap_or_else(Uuid::now_v7);

    let span = info_span!(
        "http_request",
        method = %req.method(),
        path = %req.uri().path(),
        %correlation_id
    );
    req.extensions_mut().insert(
        CallContext::new()
            .with_correlation_id(correlation_id)
            .with_timeout(REQUEST_DEADLINE),
    );

    let mut response = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Require a live user access token and insert its [`PrincipalContext`].
pub async fn auth_middleware(
    State(services): State<Arc<AppServices>>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Ok(token) = extract_bearer(req.headers()).map(str::to_string) else {
        return bearer_challenge(None);
    };
    let ctx = req.extensions().get::<CallContext>().cloned().unwrap_or_default();

    let claims = match services.engine.tokens.authenticated_user(&ctx, &token).await {
        Ok(claims) => claims,
        Err(VerifyError::Unavailable(reason)) => {
            debug!(%reason, "bearer verification unavailable");
            return json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "temporarily_unavailable",
                "try again later",
            );
        }
        Err(err) => {
            debug!(error = %err, "bearer token rejected");
            return bearer_challenge(Some("invalid_token"));
        }
    };
    let Some(principal) = PrincipalContext::from_claims(&claims) else {
        return bearer_challenge(Some("invalid_token"));
    };

    req.extensions_mut().insert(principal);
    next.run(req).await
}

/// RFC 6750 §3 challenge.
fn bearer_challenge(error: Option<&'static str>) -> Response {
    let challenge = match error {
        Some(error) => format!("Bearer realm=\"gatekeep\", error=\"{error}\""),
        None => "Bearer realm=\"gatekeep\"".to_string(),
    };
    let mut response = json_error(
        StatusCode::UNAUTHORIZED,
        error.unwrap_or("invalid_request"),
        "a valid bearer access token is required",
    )
    .into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

pub(crate) fn extract_bearer(headers: &HeaderMap) -> Result<&str, StatusCode> {
    let header = headers
        .get(header::AUTHORIZATION)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let header = header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = header.trim();
    if token.is_empty() {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(token)
}
