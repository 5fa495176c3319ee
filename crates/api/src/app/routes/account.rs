//! Registration, login and session management.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{error, info};

use gatekeep_core::SessionId;
use gatekeep_infra::CallContext;

use crate::app::dto::{LoginRequest, RegisterUserRequest, session_to_json, user_to_json};
use crate::app::errors::{engine_error_to_response, json_error};
use crate::app::services::AppServices;
use crate::context::PrincipalContext;

pub async fn register_user(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<CallContext>,
    Json(body): Json<RegisterUserRequest>,
) -> Response {
    match services.engine.identity.register(&ctx, &body.email, &body.password).await {
        Ok(user) => (
            StatusCode::CREATED,
            Json(json!({ "user_id": user.id.to_string(), "email": user.email })),
        )
            .into_response(),
        Err(err) => engine_error_to_response(&ctx, err),
    }
}

/// Authenticate, start (or touch) a session for this device and hand the
/// browser a signed session cookie.
pub async fn login(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<CallContext>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Response {
    let user_agent = header_str(&headers, header::USER_AGENT.as_str());
    let ip = header_str(&headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_string()));

    let user = match services
        .engine
        .identity
        .authenticate(&ctx, &body.email, &body.password, ip, user_agent.clone())
        .await
    {
        Ok(user) => user,
        Err(err) => return engine_error_to_response(&ctx, err),
    };

    let device = body
        .device
        .or(user_agent)
        .unwrap_or_else(|| "unknown".to_string());
    let session = match services.engine.sessions.start_session(&ctx, user.id, &device).await {
        Ok(session) => session,
        Err(err) => return engine_error_to_response(&ctx, err),
    };

    let now = services.engine.deps().now();
    let cookie = match services
        .cookies
        .issue(user.id, session.session_id, now)
        .map_err(|e| e.to_string())
        .and_then(|c| HeaderValue::from_str(&c).map_err(|e| e.to_string()))
    {
        Ok(cookie) => cookie,
        Err(reason) => {
            error!(correlation_id = %ctx.correlation_id(), %reason, "session cookie encoding failed");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", "internal error");
        }
    };

    info!(user_id = %user.id, session_id = %session.session_id, "user logged in");
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(json!({
            "user_id": user.id.to_string(),
            "session_id": session.session_id.to_string(),
            "expires_at": now + services.config.session_ttl,
        })),
    )
        .into_response()
}

/// OIDC UserInfo. `email` is released only with the `email` scope.
pub async fn userinfo(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<CallContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> Response {
    if !principal.has_scope("openid") {
        return json_error(StatusCode::FORBIDDEN, "insufficient_scope", "the openid scope is required");
    }
    let user = match services.user_profile(&ctx, principal.user_id()).await {
        Ok(user) => user,
        Err(err) => return engine_error_to_response(&ctx, err),
    };

    let mut body = user_to_json(&user);
    body["sub"] = json!(user.user_id.to_string());
    if let Some(obj) = body.as_object_mut() {
        obj.remove("user_id");
        if !principal.has_scope("email") {
            obj.remove("email");
        }
    }
    Json(body).into_response()
}

pub async fn list_sessions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<CallContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> Response {
    match services.engine.sessions.list_sessions(&ctx, principal.user_id()).await {
        Ok(sessions) => {
            let items: Vec<_> = sessions
                .iter()
                .map(|s| session_to_json(s, s.session_id == principal.session_id()))
                .collect();
            Json(json!({ "items": items })).into_response()
        }
        Err(err) => engine_error_to_response(&ctx, err),
    }
}

pub async fn revoke_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<CallContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(session_id): Path<String>,
) -> Response {
    let Ok(session_id) = session_id.parse::<SessionId>() else {
        return json_error(StatusCode::BAD_REQUEST, "invalid_request", "malformed session id");
    };
    match services
        .engine
        .sessions
        .revoke_session(&ctx, principal.user_id(), session_id)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => engine_error_to_response(&ctx, err),
    }
}

/// Log out everywhere: every session of the caller and every token bound
/// to them.
pub async fn logout_all(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<CallContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> Response {
    match services.engine.sessions.revoke_all(&ctx, principal.user_id()).await {
        Ok(revoked) => Json(json!({ "revoked_sessions": revoked })).into_response(),
        Err(err) => engine_error_to_response(&ctx, err),
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
