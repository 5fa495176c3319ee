//! OAuth2 protocol endpoints: authorize, token, introspect, revoke.

use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::{Extension, Query, rejection::FormRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use gatekeep_infra::services::{
    AuthorizationRedirect, AuthorizeError, AuthorizeRequest, CLIENT_ASSERTION_TYPE, ClientProof,
};
use gatekeep_infra::{CallContext, EngineError};

use crate::app::dto::{AuthorizeQuery, ClientCredentials, TokenForm, TokenHandleForm};
use crate::app::errors::{json_error, oauth_error};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/authorize", get(authorize))
        .route("/token", post(token))
        .route("/introspect", post(introspect))
        .route("/revoke", post(revoke))
}

/// Needs a login session cookie; consent is implicit for a signed-in user.
pub async fn authorize(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<CallContext>,
    headers: HeaderMap,
    Query(query): Query<AuthorizeQuery>,
) -> Response {
    let req: AuthorizeRequest = query.into();
    let now = services.engine.deps().now();

    let Some((user_id, session_id)) = services.cookies.read(&headers, now) else {
        return json_error(
            StatusCode::UNAUTHORIZED,
            "login_required",
            "sign in with POST /login before authorizing",
        );
    };

    match services.engine.authorization.authorize(&ctx, &req, user_id, session_id).await {
        Ok(issued) => redirect(&ctx, issued.redirect()),
        Err(AuthorizeError::Redirect(redirect_to)) => redirect(&ctx, redirect_to),
        Err(AuthorizeError::Direct(err)) => oauth_error(&ctx, &err),
    }
}

fn redirect(ctx: &CallContext, to: AuthorizationRedirect) -> Response {
    let url = match to.to_url() {
        Ok(url) => url,
        Err(err) => return oauth_error(ctx, &err),
    };
    match HeaderValue::from_str(url.as_str()) {
        Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
        Err(_) => oauth_error(ctx, &EngineError::Internal("redirect target not a valid header".to_string())),
    }
}

pub async fn token(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<CallContext>,
    headers: HeaderMap,
    form: Result<Form<TokenForm>, FormRejection>,
) -> Response {
    let Ok(Form(form)) = form else {
        return oauth_error(&ctx, &EngineError::invalid_request("expected a form-encoded body"));
    };
    let result = async {
        let credentials = client_credentials(&headers, form.client_id.clone(), form.client_secret.clone())?;
        let credentials = with_assertion(
            credentials,
            form.client_assertion_type.as_deref(),
            form.client_assertion.clone(),
        )?;
        let req = form.into_request(credentials)?;
        services.engine.tokens.token(&ctx, &req).await
    }
    .await;

    match result {
        Ok(tokens) => no_store((StatusCode::OK, Json(tokens)).into_response()),
        Err(err) => oauth_error(&ctx, &err),
    }
}

/// RFC 7662. Callers authenticate as clients and only see their own tokens.
pub async fn introspect(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<CallContext>,
    headers: HeaderMap,
    form: Result<Form<TokenHandleForm>, FormRejection>,
) -> Response {
    let Ok(Form(form)) = form else {
        return oauth_error(&ctx, &EngineError::invalid_request("expected a form-encoded body"));
    };
    let result = async {
        let caller = authenticate(&services, &ctx, &headers, &form).await?;
        let token = required_token(&form)?;
        services.engine.tokens.introspect(&ctx, &caller, token).await
    }
    .await;

    match result {
        Ok(introspection) => no_store((StatusCode::OK, Json(introspection)).into_response()),
        Err(err) => oauth_error(&ctx, &err),
    }
}

/// RFC 7009. Answers 200 whether or not the token existed.
pub async fn revoke(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<CallContext>,
    headers: HeaderMap,
    form: Result<Form<TokenHandleForm>, FormRejection>,
) -> Response {
    let Ok(Form(form)) = form else {
        return oauth_error(&ctx, &EngineError::invalid_request("expected a form-encoded body"));
    };
    let result = async {
        let caller = authenticate(&services, &ctx, &headers, &form).await?;
        let token = required_token(&form)?;
        services.engine.tokens.revoke(&ctx, &caller, token).await
    }
    .await;

    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => oauth_error(&ctx, &err),
    }
}

async fn authenticate(
    services: &AppServices,
    ctx: &CallContext,
    headers: &HeaderMap,
    form: &TokenHandleForm,
) -> Result<gatekeep_identity::Client, EngineError> {
    let credentials = client_credentials(headers, form.client_id.clone(), form.client_secret.clone())?;
    let credentials = with_assertion(
        credentials,
        form.client_assertion_type.as_deref(),
        form.client_assertion.clone(),
    )?;
    let proof = ClientProof::from_parts(
        credentials.client_secret.as_deref(),
        credentials.client_assertion.as_deref(),
    )?;
    services
        .engine
        .clients
        .authenticate(ctx, &credentials.client_id, proof)
        .await
}

fn required_token(form: &TokenHandleForm) -> Result<&str, EngineError> {
    form.token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| EngineError::invalid_request("token is required"))
}

fn no_store(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

/// Resolve client credentials per RFC 6749 §2.3.1: HTTP Basic or form
/// fields, never both.
pub(crate) fn client_credentials(
    headers: &HeaderMap,
    form_client_id: Option<String>,
    form_client_secret: Option<String>,
) -> Result<ClientCredentials, EngineError> {
    if let Some(basic) = basic_credentials(headers)? {
        if form_client_secret.is_some() {
            return Err(EngineError::invalid_request(
                "client credentials supplied by more than one method",
            ));
        }
        if form_client_id.as_deref().is_some_and(|id| id != basic.client_id) {
            return Err(EngineError::invalid_request("client_id does not match the Authorization header"));
        }
        return Ok(basic);
    }

    let client_id = form_client_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| EngineError::invalid_request("client_id is required"))?;
    Ok(ClientCredentials {
        client_id,
        client_secret: form_client_secret.filter(|s| !s.is_empty()),
        client_assertion: None,
    })
}

/// Attach a `private_key_jwt` assertion (RFC 7523 §2.2). Type and assertion
/// travel together, and exclude a secret.
pub(crate) fn with_assertion(
    mut credentials: ClientCredentials,
    assertion_type: Option<&str>,
    assertion: Option<String>,
) -> Result<ClientCredentials, EngineError> {
    let assertion = assertion.filter(|a| !a.is_empty());
    match (assertion_type.filter(|t| !t.is_empty()), assertion) {
        (None, None) => Ok(credentials),
        (Some(CLIENT_ASSERTION_TYPE), Some(assertion)) => {
            if credentials.client_secret.is_some() {
                return Err(EngineError::invalid_request(
                    "client credentials supplied by more than one method",
                ));
            }
            credentials.client_assertion = Some(assertion);
            Ok(credentials)
        }
        (Some(other), Some(_)) => Err(EngineError::invalid_request(format!(
            "unsupported client_assertion_type {other}"
        ))),
        _ => Err(EngineError::invalid_request(
            "client_assertion and client_assertion_type must be sent together",
        )),
    }
}

fn basic_credentials(headers: &HeaderMap) -> Result<Option<ClientCredentials>, EngineError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let Some(encoded) = value.to_str().ok().and_then(|v| v.strip_prefix("Basic ")) else {
        return Ok(None);
    };

    let decoded = STANDARD.decode(encoded.trim()).map_err(|_| {
        debug!("undecodable basic credentials");
        EngineError::InvalidClient
    })?;
    let decoded = String::from_utf8(decoded).map_err(|_| EngineError::InvalidClient)?;
    let (id, secret) = decoded.split_once(':').ok_or(EngineError::InvalidClient)?;

    let client_id = urlencoding::decode(id).map_err(|_| EngineError::InvalidClient)?.into_owned();
    let client_secret = urlencoding::decode(secret).map_err(|_| EngineError::InvalidClient)?.into_owned();
    Ok(Some(ClientCredentials {
        client_id,
        client_secret: (!client_secret.is_empty()).then_some(client_secret),
        client_assertion: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(id: &str, secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let value = format!("Basic {}", STANDARD.encode(format!("{id}:{secret}")));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        headers
    }

    #[test]
    fn basic_credentials_are_url_decoded() {
        let creds = client_credentials(&basic("client%3A1", "s%2Bcret"), None, None).unwrap();
        assert_eq!(creds.client_id, "client:1");
        assert_eq!(creds.client_secret.as_deref(), Some("s+cret"));
    }

    #[test]
    fn form_credentials_are_used_without_basic() {
        let creds = client_credentials(&HeaderMap::new(), Some("c1".into()), Some("s".into())).unwrap();
        assert_eq!(
            creds,
            ClientCredentials {
                client_id: "c1".into(),
                client_secret: Some("s".into()),
                client_assertion: None,
            }
        );

        let public = client_credentials(&HeaderMap::new(), Some("c1".into()), None).unwrap();
        assert_eq!(public.client_secret, None);
    }

    #[test]
    fn mixing_methods_or_omitting_the_client_is_rejected() {
        let err = client_credentials(&basic("c1", "s"), None, Some("s".into())).unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_request");

        let err = client_credentials(&basic("c1", "s"), Some("c2".into()), None).unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_request");

        let err = client_credentials(&HeaderMap::new(), None, None).unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_request");
    }

    #[test]
    fn assertions_need_the_jwt_bearer_type_and_no_secret() {
        let public = || client_credentials(&HeaderMap::new(), Some("c1".into()), None).unwrap();

        let creds = with_assertion(public(), Some(CLIENT_ASSERTION_TYPE), Some("a.b.c".into())).unwrap();
        assert_eq!(creds.client_assertion.as_deref(), Some("a.b.c"));
        assert_eq!(with_assertion(public(), None, None).unwrap(), public());

        for (kind, assertion) in [
            (Some("urn:example:saml"), Some("a.b.c")),
            (Some(CLIENT_ASSERTION_TYPE), None),
            (None, Some("a.b.c")),
        ] {
            let err = with_assertion(public(), kind, assertion.map(str::to_string)).unwrap_err();
            assert_eq!(err.oauth_error_code(), "invalid_request");
        }

        let err = with_assertion(
            client_credentials(&basic("c1", "s"), None, None).unwrap(),
            Some(CLIENT_ASSERTION_TYPE),
            Some("a.b.c".into()),
        )
        .unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_request");
    }

    #[test]
    fn garbage_basic_header_is_invalid_client() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic ***"));
        assert_eq!(client_credentials(&headers, None, None), Err(EngineError::InvalidClient));
    }
}
