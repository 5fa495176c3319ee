use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use gatekeep_infra::{CallContext, EngineError};

/// OAuth2 error body (RFC 6749 §5.2) with the matching status.
///
/// Server-side failures are logged with the correlation id and surfaced
/// without detail.
pub fn oauth_error(ctx: &CallContext, err: &EngineError) -> Response {
    let status = match err {
        EngineError::InvalidClient => StatusCode::UNAUTHORIZED,
        EngineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    if err.is_server_side() {
        error!(correlation_id = %ctx.correlation_id(), error = %err, "request failed");
    }

    let body = match err.public_description() {
        Some(description) => json!({ "error": err.oauth_error_code(), "error_description": description }),
        None => json!({ "error": err.oauth_error_code() }),
    };
    let mut response = (status, axum::Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if matches!(err, EngineError::InvalidClient) {
        headers.insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"gatekeep\""),
        );
    }
    response
}

/// Map engine failures on the account endpoints (registration, login,
/// sessions) to plain JSON errors.
pub fn engine_error_to_response(ctx: &CallContext, err: EngineError) -> Response {
    match err {
        EngineError::InvalidRequest(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_request", msg),
        EngineError::InvalidScope(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_scope", msg),
        EngineError::UnauthorizedClient(msg) => json_error(StatusCode::BAD_REQUEST, "unauthorized_client", msg),
        EngineError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        EngineError::AuthFailed | EngineError::InvalidGrant(_) | EngineError::InvalidClient => json_error(
            StatusCode::UNAUTHORIZED,
            "invalid_credentials",
            "the provided credentials are invalid",
        ),
        EngineError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        EngineError::UnsupportedGrantType(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_request", msg),
        EngineError::Unavailable(ref msg) => {
            error!(correlation_id = %ctx.correlation_id(), error = %msg, "dependency unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "temporarily_unavailable", "try again later")
        }
        EngineError::Internal(ref msg) => {
            error!(correlation_id = %ctx.correlation_id(), error = %msg, "request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", "internal error")
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_errors_use_protocol_statuses() {
        let ctx = CallContext::new();
        assert_eq!(oauth_error(&ctx, &EngineError::InvalidClient).status(), StatusCode::UNAUTHORIZED);
        assert!(
            oauth_error(&ctx, &EngineError::InvalidClient)
                .headers()
                .contains_key(header::WWW_AUTHENTICATE)
        );
        assert_eq!(
            oauth_error(&ctx, &EngineError::invalid_grant("used")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            oauth_error(&ctx, &EngineError::Unavailable("store".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            oauth_error(&ctx, &EngineError::Internal("boom".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn account_errors_do_not_leak_auth_detail() {
        let ctx = CallContext::new();
        assert_eq!(
            engine_error_to_response(&ctx, EngineError::AuthFailed).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            engine_error_to_response(&ctx, EngineError::NotFound).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            engine_error_to_response(&ctx, EngineError::Conflict("email taken".into())).status(),
            StatusCode::CONFLICT
        );
    }
}
