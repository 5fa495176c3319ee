use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use gatekeep_infra::CallContext;

use crate::app::dto::{RegisterClientRequest, registered_client_to_json};
use crate::app::errors::engine_error_to_response;
use crate::app::services::AppServices;

/// Register a client. A confidential client's secret appears in this
/// response and nowhere else.
pub async fn register_client(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<CallContext>,
    Json(body): Json<RegisterClientRequest>,
) -> Response {
    let registration = match body.into_registration() {
        Ok(registration) => registration,
        Err(err) => return engine_error_to_response(&ctx, err),
    };
    match services.engine.clients.register(&ctx, registration).await {
        Ok(registered) => (StatusCode::CREATED, Json(registered_client_to_json(&registered))).into_response(),
        Err(err) => engine_error_to_response(&ctx, err),
    }
}
