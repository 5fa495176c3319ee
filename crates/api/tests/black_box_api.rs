use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::{StatusCode, header};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use gatekeep_api::config::{ApiConfig, SigningConfig};

const PRIVATE_PEM: &str = include_str!("../../infra/tests/fixtures/rsa_private.pem");
const PUBLIC_PEM: &str = include_str!("../../infra/tests/fixtures/rsa_public.pem");
const REDIRECT: &str = "https://app/cb";
const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
const PASSWORD: &str = "correct horse battery staple";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let mut config = ApiConfig::testing();
        config.signing = SigningConfig::Rs256 {
            private_key_pem: PRIVATE_PEM.to_string(),
            public_key_pem: PUBLIC_PEM.to_string(),
            kid: Some("test-rsa".to_string()),
        };

        // Same router as prod, bound to an ephemeral port.
        let app = gatekeep_api::app::build_app(config).expect("failed to build app");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn http() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

fn challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

async fn register_user(server: &TestServer, client: &reqwest::Client, email: &str) -> String {
    let res = client
        .post(server.url("/users"))
        .json(&json!({ "email": email, "password": PASSWORD }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: Value = res.json().await.unwrap();
    body["user_id"].as_str().unwrap().to_string()
}

async fn register_public_client(server: &TestServer, client: &reqwest::Client) -> String {
    let res = client
        .post(server.url("/clients"))
        .json(&json!({
            "name": "spa",
            "client_type": "public",
            "redirect_uris": [REDIRECT],
            "scope": "openid email",
            "grant_types": ["authorization_code", "refresh_token"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: Value = res.json().await.unwrap();
    assert!(body.get("client_secret").is_none());
    body["client_id"].as_str().unwrap().to_string()
}

/// `name=value` of the session cookie set by `/login`.
async fn login(server: &TestServer, client: &reqwest::Client, email: &str, device: &str) -> String {
    let res = client
        .post(server.url("/login"))
        .json(&json!({ "email": email, "password": PASSWORD, "device": device }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let set_cookie = res
        .headers()
        .get(header::SET_COOKIE)
        .expect("login sets a session cookie")
        .to_str()
        .unwrap();
    set_cookie.split(';').next().unwrap().to_string()
}

async fn authorize(server: &TestServer, client: &reqwest::Client, cookie: &str, client_id: &str) -> String {
    authorize_with_method(server, client, cookie, client_id, "S256").await
}

/// Code flow for [`VERIFIER`] under the given PKCE method.
async fn authorize_with_method(
    server: &TestServer,
    client: &reqwest::Client,
    cookie: &str,
    client_id: &str,
    method: &str,
) -> String {
    let code_challenge = match method {
        "plain" => VERIFIER.to_string(),
        _ => challenge(VERIFIER),
    };
    let res = client
        .get(server.url("/oauth2/authorize"))
        .header(header::COOKIE, cookie)
        .query(&[
            ("response_type", "code"),
            ("client_id", client_id),
            ("redirect_uri", REDIRECT),
            ("scope", "openid email"),
            ("state", "xyz"),
            ("code_challenge", code_challenge.as_str()),
            ("code_challenge_method", method),
            ("nonce", "n-0S6"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FOUND);

    let location = res.headers().get(header::LOCATION).unwrap().to_str().unwrap();
    let location = url::Url::parse(location).unwrap();
    assert!(location.as_str().starts_with(REDIRECT));
    let param = |name: &str| {
        location
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };
    assert_eq!(param("state").as_deref(), Some("xyz"));
    param("code").expect("redirect carries a code")
}

async fn exchange(server: &TestServer, client: &reqwest::Client, client_id: &str, code: &str) -> reqwest::Response {
    client
        .post(server.url("/oauth2/token"))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", REDIRECT),
            ("client_id", client_id),
            ("code_verifier", VERIFIER),
        ])
        .send()
        .await
        .unwrap()
}

/// Register, log in and run the code flow; returns the token response.
async fn signed_in(server: &TestServer, client: &reqwest::Client, email: &str) -> (String, String, Value) {
    let user_id = register_user(server, client, email).await;
    let client_id = register_public_client(server, client).await;
    let cookie = login(server, client, email, "laptop").await;
    let code = authorize(server, client, &cookie, &client_id).await;
    let res = exchange(server, client, &client_id, &code).await;
    assert_eq!(res.status(), StatusCode::OK);
    (user_id, client_id, res.json().await.unwrap())
}

#[tokio::test]
async fn health_echoes_request_id() {
    let server = TestServer::spawn().await;
    let request_id = "0190f3c2-6c1e-7cc0-8d5e-3f2a1b4c5d6e";
    let res = http()
        .get(server.url("/health"))
        .header("x-request-id", request_id)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers().get("x-request-id").unwrap(), request_id);
}

#[tokio::test]
async fn discovery_documents_and_jwks() {
    let server = TestServer::spawn().await;
    let client = http();

    for path in ["/.well-known/openid_configuration", "/.well-known/openid-configuration"] {
        let doc: Value = client.get(server.url(path)).send().await.unwrap().json().await.unwrap();
        assert_eq!(doc["issuer"], "http://localhost:8080");
        assert_eq!(doc["token_endpoint"], "http://localhost:8080/oauth2/token");
        assert_eq!(doc["id_token_signing_alg_values_supported"], json!(["RS256"]));
        assert_eq!(doc["code_challenge_methods_supported"], json!(["S256", "plain"]));
        assert!(doc["token_endpoint_auth_methods_supported"]
            .as_array()
            .unwrap()
            .contains(&json!("private_key_jwt")));
    }

    let jwks: Value = client.get(server.url("/jwks")).send().await.unwrap().json().await.unwrap();
    let keys = jwks["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["kid"], "test-rsa");
    assert_eq!(keys[0]["kty"], "RSA");
}

#[tokio::test]
async fn every_advertised_pkce_method_completes_the_code_flow() {
    let server = TestServer::spawn().await;
    let client = http();

    let doc: Value = client
        .get(server.url("/.well-known/openid-configuration"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let methods = doc["code_challenge_methods_supported"].as_array().unwrap().clone();

    register_user(&server, &client, "pkce@example.com").await;
    let client_id = register_public_client(&server, &client).await;
    let cookie = login(&server, &client, "pkce@example.com", "laptop").await;
    for method in methods {
        let method = method.as_str().unwrap();
        let code = authorize_with_method(&server, &client, &cookie, &client_id, method).await;
        let res = exchange(&server, &client, &client_id, &code).await;
        assert_eq!(res.status(), StatusCode::OK, "pkce method {method}");
    }
}

#[tokio::test]
async fn authorization_code_flow_end_to_end() {
    let server = TestServer::spawn().await;
    let client = http();

    let user_id = register_user(&server, &client, "ada@example.com").await;
    let client_id = register_public_client(&server, &client).await;
    let cookie = login(&server, &client, "ada@example.com", "laptop").await;
    let code = authorize(&server, &client, &cookie, &client_id).await;

    let res = exchange(&server, &client, &client_id, &code).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");
    let tokens: Value = res.json().await.unwrap();
    assert_eq!(tokens["token_type"], "Bearer");
    assert!(tokens["expires_in"].as_i64().unwrap() > 0);
    assert!(tokens["refresh_token"].is_string());
    assert!(tokens["id_token"].is_string());

    let access_token = tokens["access_token"].as_str().unwrap();
    let header = jsonwebtoken::decode_header(access_token).unwrap();
    assert_eq!(header.kid.as_deref(), Some("test-rsa"));

    // a redeemed code never works twice
    let replay = exchange(&server, &client, &client_id, &code).await;
    assert_eq!(replay.status(), StatusCode::BAD_REQUEST);
    let body: Value = replay.json().await.unwrap();
    assert_eq!(body["error"], "invalid_grant");

    // and the replay took the first issuance down with it
    let res = client
        .get(server.url("/userinfo"))
        .bearer_auth(access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert!(res.headers().contains_key(header::WWW_AUTHENTICATE));

    // nor can it reach session management
    let sessions = client
        .get(server.url("/sessions"))
        .bearer_auth(access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(sessions.status(), StatusCode::UNAUTHORIZED);
    assert!(!user_id.is_empty());
}

#[tokio::test]
async fn userinfo_introspection_and_revocation() {
    let server = TestServer::spawn().await;
    let client = http();
    let (user_id, client_id, tokens) = signed_in(&server, &client, "grace@example.com").await;
    let access_token = tokens["access_token"].as_str().unwrap();

    let info: Value = client
        .get(server.url("/userinfo"))
        .bearer_auth(access_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["sub"], user_id.as_str());
    assert_eq!(info["email"], "grace@example.com");

    let introspection: Value = client
        .post(server.url("/oauth2/introspect"))
        .form(&[("token", access_token), ("client_id", client_id.as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(introspection["active"], true);
    assert_eq!(introspection["client_id"], client_id.as_str());
    assert_eq!(introspection["sub"], user_id.as_str());

    let res = client
        .post(server.url("/oauth2/revoke"))
        .form(&[("token", access_token), ("client_id", client_id.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let introspection: Value = client
        .post(server.url("/oauth2/introspect"))
        .form(&[("token", access_token), ("client_id", client_id.as_str())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(introspection, json!({ "active": false }));

    // unknown tokens are accepted silently
    let res = client
        .post(server.url("/oauth2/revoke"))
        .form(&[("token", "not-a-token"), ("client_id", client_id.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn refresh_rotation_and_reuse_detection() {
    let server = TestServer::spawn().await;
    let client = http();
    let (_, client_id, tokens) = signed_in(&server, &client, "linus@example.com").await;
    let r0 = tokens["refresh_token"].as_str().unwrap().to_string();

    let refresh = |token: String| {
        let client = client.clone();
        let url = server.url("/oauth2/token");
        let client_id = client_id.clone();
        async move {
            client
                .post(url)
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", token.as_str()),
                    ("client_id", client_id.as_str()),
                ])
                .send()
                .await
                .unwrap()
        }
    };

    let res = refresh(r0.clone()).await;
    assert_eq!(res.status(), StatusCode::OK);
    let rotated: Value = res.json().await.unwrap();
    let r1 = rotated["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(r0, r1);

    let reuse = refresh(r0).await;
    assert_eq!(reuse.status(), StatusCode::BAD_REQUEST);
    let body: Value = reuse.json().await.unwrap();
    assert_eq!(body["error"], "invalid_grant");

    // the whole family is gone, including the newest refresh token
    let res = refresh(r1).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sessions_listing_and_logout_everywhere() {
    let server = TestServer::spawn().await;
    let client = http();
    let (_, _, tokens) = signed_in(&server, &client, "barbara@example.com").await;
    let access_token = tokens["access_token"].as_str().unwrap();

    // a second device
    login(&server, &client, "barbara@example.com", "phone").await;

    let sessions: Value = client
        .get(server.url("/sessions"))
        .bearer_auth(access_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let items = sessions["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items.iter().filter(|s| s["current"] == true).count(), 1);

    let res = client
        .post(server.url("/logout/all"))
        .bearer_auth(access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["revoked_sessions"], 2);

    let res = client
        .get(server.url("/sessions"))
        .bearer_auth(access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn single_session_revocation_kills_its_tokens() {
    let server = TestServer::spawn().await;
    let client = http();
    let (_, _, tokens) = signed_in(&server, &client, "edsger@example.com").await;
    let access_token = tokens["access_token"].as_str().unwrap();

    let sessions: Value = client
        .get(server.url("/sessions"))
        .bearer_auth(access_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = sessions["items"][0]["session_id"].as_str().unwrap().to_string();

    let res = client
        .delete(server.url(&format!("/sessions/{session_id}")))
        .bearer_auth(access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    let res = client
        .get(server.url("/userinfo"))
        .bearer_auth(access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn authorize_requires_login_and_a_registered_redirect() {
    let server = TestServer::spawn().await;
    let client = http();
    register_user(&server, &client, "alan@example.com").await;
    let client_id = register_public_client(&server, &client).await;

    let res = client
        .get(server.url("/oauth2/authorize"))
        .query(&[("response_type", "code"), ("client_id", client_id.as_str()), ("redirect_uri", REDIRECT)])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "login_required");

    let cookie = login(&server, &client, "alan@example.com", "laptop").await;
    let res = client
        .get(server.url("/oauth2/authorize"))
        .header(header::COOKIE, &cookie)
        .query(&[
            ("response_type", "code"),
            ("client_id", client_id.as_str()),
            ("redirect_uri", "https://evil.example/cb"),
            ("scope", "openid"),
            ("code_challenge", challenge(VERIFIER).as_str()),
            ("code_challenge_method", "S256"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(res.headers().get(header::LOCATION).is_none());

    // errors after the redirect is trusted go back to the client
    let res = client
        .get(server.url("/oauth2/authorize"))
        .header(header::COOKIE, &cookie)
        .query(&[
            ("response_type", "code"),
            ("client_id", client_id.as_str()),
            ("redirect_uri", REDIRECT),
            ("scope", "openid"),
            ("state", "s1"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FOUND);
    let location = res.headers().get(header::LOCATION).unwrap().to_str().unwrap();
    assert!(location.starts_with(REDIRECT));
    assert!(location.contains("error="));
    assert!(location.contains("state=s1"));
}

#[tokio::test]
async fn confidential_client_credentials_grant() {
    let server = TestServer::spawn().await;
    let client = http();

    let res = client
        .post(server.url("/clients"))
        .json(&json!({
            "name": "reporting",
            "client_type": "confidential",
            "scope": "reports:read",
            "grant_types": ["client_credentials"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let registered: Value = res.json().await.unwrap();
    let client_id = registered["client_id"].as_str().unwrap().to_string();
    let secret = registered["client_secret"].as_str().unwrap().to_string();

    let res = client
        .post(server.url("/oauth2/token"))
        .basic_auth(&client_id, Some("wrong"))
        .form(&[("grant_type", "client_credentials")])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert!(res.headers().contains_key(header::WWW_AUTHENTICATE));
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_client");

    let res = client
        .post(server.url("/oauth2/token"))
        .basic_auth(&client_id, Some(&secret))
        .form(&[("grant_type", "client_credentials"), ("scope", "reports:read")])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let tokens: Value = res.json().await.unwrap();
    assert!(tokens.get("refresh_token").is_none());
    assert_eq!(tokens["scope"], "reports:read");
    let access_token = tokens["access_token"].as_str().unwrap();

    // machine tokens carry no user session
    let res = client
        .get(server.url("/userinfo"))
        .bearer_auth(access_token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let introspection: Value = client
        .post(server.url("/oauth2/introspect"))
        .form(&[
            ("token", access_token),
            ("client_id", client_id.as_str()),
            ("client_secret", secret.as_str()),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(introspection["active"], true);
    assert_eq!(introspection["sub"], client_id.as_str());

    let res = client
        .post(server.url("/oauth2/token"))
        .basic_auth(&client_id, Some(&secret))
        .form(&[("grant_type", "password")])
        .send()
        .await
        .unwrap();
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unsupported_grant_type");
}

#[tokio::test]
async fn key_registered_client_authenticates_with_private_key_jwt() {
    let server = TestServer::spawn().await;
    let client = http();

    let res = client
        .post(server.url("/clients"))
        .json(&json!({
            "name": "exporter",
            "client_type": "confidential",
            "scope": "reports:read",
            "grant_types": ["client_credentials"],
            "public_key_pem": PUBLIC_PEM,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let registered: Value = res.json().await.unwrap();
    assert!(registered.get("client_secret").is_none());
    assert_eq!(registered["token_endpoint_auth_method"], "private_key_jwt");
    let client_id = registered["client_id"].as_str().unwrap().to_string();

    let key = jsonwebtoken::EncodingKey::from_rsa_pem(PRIVATE_PEM.as_bytes()).unwrap();
    let exp = chrono::Utc::now().timestamp() + 120;
    let assertion = jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
        &json!({
            "iss": client_id,
            "sub": client_id,
            "aud": "http://localhost:8080/oauth2/token",
            "exp": exp,
        }),
        &key,
    )
    .unwrap();
    let assertion_type = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

    let res = client
        .post(server.url("/oauth2/token"))
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", client_id.as_str()),
            ("client_assertion_type", assertion_type),
            ("client_assertion", assertion.as_str()),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let tokens: Value = res.json().await.unwrap();
    let access_token = tokens["access_token"].as_str().unwrap();

    let introspection: Value = client
        .post(server.url("/oauth2/introspect"))
        .form(&[
            ("token", access_token),
            ("client_id", client_id.as_str()),
            ("client_assertion_type", assertion_type),
            ("client_assertion", assertion.as_str()),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(introspection["active"], true);

    let res = client
        .post(server.url("/oauth2/token"))
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", client_id.as_str()),
            ("client_secret", "guess"),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn account_errors() {
    let server = TestServer::spawn().await;
    let client = http();
    register_user(&server, &client, "hopper@example.com").await;

    let res = client
        .post(server.url("/users"))
        .json(&json!({ "email": "HOPPER@example.com", "password": PASSWORD }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_request");
    assert_eq!(body["message"], "email is already registered");

    let res = client
        .post(server.url("/login"))
        .json(&json!({ "email": "hopper@example.com", "password": "wrong password entirely" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert!(res.headers().get(header::SET_COOKIE).is_none());

    let unknown = client
        .post(server.url("/login"))
        .json(&json!({ "email": "nobody@example.com", "password": PASSWORD }))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::UNAUTHORIZED);
    let body: Value = unknown.json().await.unwrap();
    assert_eq!(body["error"], "invalid_credentials");
}
