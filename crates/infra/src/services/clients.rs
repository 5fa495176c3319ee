//! Client registry operations and client authentication.
//!
//! Clients authenticate with a shared secret (`client_secret_basic`,
//! `client_secret_post`), with an RS256 assertion signed by a registered key
//! (`private_key_jwt`, RFC 7523), or not at all when public.

use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use gatekeep_core::ClientId;
use gatekeep_events::AuditRecord;
use gatekeep_identity::client::{DeactivateClient, RotateClientSecret, UpdateRedirectUris};
use gatekeep_identity::{
    Client, ClientCommand, ClientCredential, ClientType, GrantType, RegisterClient, ScopeSet,
    digest_secret,
};

use crate::context::CallContext;
use crate::error::EngineError;

use super::{EngineDeps, random_token};

/// What an operator supplies to register a client.
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub name: String,
    pub client_type: ClientType,
    pub redirect_uris: Vec<String>,
    pub allowed_scopes: ScopeSet,
    pub grant_types: Vec<GrantType>,
    pub require_pkce: bool,
    pub access_token_ttl_secs: Option<i64>,
    pub refresh_token_ttl_secs: Option<i64>,
    /// Confidential clients only: authenticate with `private_key_jwt` against
    /// this RSA key instead of receiving a secret.
    pub public_key_pem: Option<String>,
}

/// `client_assertion_type` of an RFC 7523 client assertion.
pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// What a caller presented besides its `client_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProof<'a> {
    None,
    Secret(&'a str),
    Assertion(&'a str),
}

impl<'a> ClientProof<'a> {
    /// At most one authentication method per request (RFC 6749 §2.3).
    pub fn from_parts(secret: Option<&'a str>, assertion: Option<&'a str>) -> Result<Self, EngineError> {
        match (secret, assertion) {
            (Some(_), Some(_)) => Err(EngineError::invalid_request(
                "client credentials supplied by more than one method",
            )),
            (Some(secret), None) => Ok(ClientProof::Secret(secret)),
            (None, Some(assertion)) => Ok(ClientProof::Assertion(assertion)),
            (None, None) => Ok(ClientProof::None),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    exp: i64,
}

/// A freshly registered client. The plaintext secret exists only here.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub client: Client,
    pub client_secret: Option<String>,
}

#[derive(Clone)]
pub struct ClientService {
    deps: Arc<EngineDeps>,
}

impl ClientService {
    pub(crate) fn new(deps: Arc<EngineDeps>) -> Self {
        Self { deps }
    }

    #[instrument(
        skip(self, ctx, registration),
        fields(correlation_id = %ctx.correlation_id(), name = %registration.name),
        err
    )]
    pub async fn register(
        &self,
        ctx: &CallContext,
        registration: ClientRegistration,
    ) -> Result<RegisteredClient, EngineError> {
        let client_id = ClientId::new();
        let (credential, client_secret) = match (registration.client_type, registration.public_key_pem) {
            (ClientType::Confidential, Some(pem)) => {
                DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|_| EngineError::invalid_request("public_key_pem is not an RSA public key"))?;
                (Some(ClientCredential::PublicKey { pem }), None)
            }
            (ClientType::Confidential, None) => {
                let secret = random_token();
                (Some(ClientCredential::secret(&secret)), Some(secret))
            }
            (ClientType::Public, Some(_)) => {
                return Err(EngineError::invalid_request("public clients cannot register a key"));
            }
            (ClientType::Public, None) => (None, None),
        };

        let out = self
            .deps
            .dispatcher
            .dispatch::<Client>(
                ctx,
                client_id,
                ClientCommand::Register(RegisterClient {
                    client_id,
                    name: registration.name,
                    client_type: registration.client_type,
                    credential,
                    redirect_uris: registration.redirect_uris,
                    allowed_scopes: registration.allowed_scopes,
                    grant_types: registration.grant_types,
                    require_pkce: registration.require_pkce,
                    access_token_ttl_secs: registration.access_token_ttl_secs,
                    refresh_token_ttl_secs: registration.refresh_token_ttl_secs,
                    occurred_at: self.deps.now(),
                }),
            )
            .await?;

        info!(%client_id, "client registered");
        Ok(RegisteredClient {
            client: out.state,
            client_secret,
        })
    }

    /// Issue a new secret. The previous one stops verifying immediately.
    #[instrument(skip(self, ctx), fields(correlation_id = %ctx.correlation_id(), %client_id), err)]
    pub async fn rotate_secret(&self, ctx: &CallContext, client_id: ClientId) -> Result<String, EngineError> {
        let secret = random_token();
        self.deps
            .dispatcher
            .dispatch::<Client>(
                ctx,
                client_id,
                ClientCommand::RotateSecret(RotateClientSecret {
                    secret_digest: digest_secret(&secret),
                    occurred_at: self.deps.now(),
                }),
            )
            .await?;
        info!("client secret rotated");
        Ok(secret)
    }

    #[instrument(skip(self, ctx, redirect_uris), fields(correlation_id = %ctx.correlation_id(), %client_id), err)]
    pub async fn update_redirect_uris(
        &self,
        ctx: &CallContext,
        client_id: ClientId,
        redirect_uris: Vec<String>,
    ) -> Result<Client, EngineError> {
        let out = self
            .deps
            .dispatcher
            .dispatch::<Client>(
                ctx,
                client_id,
                ClientCommand::UpdateRedirectUris(UpdateRedirectUris {
                    redirect_uris,
                    occurred_at: self.deps.now(),
                }),
            )
            .await?;
        Ok(out.state)
    }

    /// Tokens already issued to the client stop verifying: verification reads
    /// the client stream on every call.
    #[instrument(skip(self, ctx), fields(correlation_id = %ctx.correlation_id(), %client_id), err)]
    pub async fn deactivate(&self, ctx: &CallContext, client_id: ClientId) -> Result<Client, EngineError> {
        let out = self
            .deps
            .dispatcher
            .dispatch::<Client>(
                ctx,
                client_id,
                ClientCommand::Deactivate(DeactivateClient {
                    occurred_at: self.deps.now(),
                }),
            )
            .await?;
        info!("client deactivated");
        Ok(out.state)
    }

    pub async fn get(&self, ctx: &CallContext, client_id: ClientId) -> Result<Client, EngineError> {
        let client = self.deps.dispatcher.load::<Client>(ctx, client_id).await?;
        client.ensure_registered()?;
        Ok(client)
    }

    /// Secret-or-nothing authentication; see [`ClientService::authenticate`].
    pub async fn authenticate_client(
        &self,
        ctx: &CallContext,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> Result<Client, EngineError> {
        let proof = client_secret.map_or(ClientProof::None, ClientProof::Secret);
        self.authenticate(ctx, client_id, proof).await
    }

    /// Authenticate a client at the token, introspection or revocation
    /// endpoint. Every failure is the same `InvalidClient`.
    #[instrument(skip(self, ctx, proof), fields(correlation_id = %ctx.correlation_id()), err)]
    pub async fn authenticate(
        &self,
        ctx: &CallContext,
        client_id: &str,
        proof: ClientProof<'_>,
    ) -> Result<Client, EngineError> {
        let reject = |reason: &'static str| {
            warn!(client_id, reason, "client authentication failed");
            self.deps.audit(
                AuditRecord::security("client_authentication_failed", self.deps.now())
                    .with_client(client_id)
                    .with_correlation(ctx.correlation_id()),
            );
            EngineError::InvalidClient
        };

        let Ok(id) = client_id.parse::<ClientId>() else {
            return Err(reject("malformed client id"));
        };
        let client = self.deps.dispatcher.load::<Client>(ctx, id).await?;
        if !client.registered || !client.active {
            return Err(reject("unknown or inactive client"));
        }

        let verdict = match proof {
            ClientProof::Secret(secret) if client.verify_secret(secret) => Ok(()),
            ClientProof::None if !client.is_confidential() => Ok(()),
            ClientProof::Assertion(assertion) => match client.public_key_pem() {
                Some(pem) => self.verify_assertion(client_id, pem, assertion),
                None => Err("client has no registered key"),
            },
            _ => Err("bad credentials"),
        };
        if let Err(reason) = verdict {
            return Err(reject(reason));
        }
        Ok(client)
    }

    /// RFC 7523 §3: RS256 over the registered key, `iss` and `sub` both the
    /// client, `aud` the issuer or its token endpoint, `exp` not passed.
    fn verify_assertion(&self, client_id: &str, pem: &str, assertion: &str) -> Result<(), &'static str> {
        let key = DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|_| "registered key is unusable")?;
        let issuer = self.deps.config.issuer.trim_end_matches('/');

        let mut validation = Validation::new(Algorithm::RS256);
        // Expiry is checked against the engine clock below.
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "aud", "iss", "sub"]);
        validation.set_audience(&[issuer.to_string(), format!("{issuer}/oauth2/token")]);

        let claims = jsonwebtoken::decode::<AssertionClaims>(assertion, &key, &validation)
            .map_err(|_| "invalid client assertion")?
            .claims;
        if claims.iss != client_id || claims.sub != client_id {
            return Err("client assertion names another client");
        }
        let leeway = self.deps.config.clock_skew_leeway.num_seconds();
        if claims.exp.saturating_add(leeway) <= self.deps.now().timestamp() {
            return Err("client assertion expired");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use gatekeep_events::InMemoryAuditSink;
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::services::Engine;

    fn confidential() -> ClientRegistration {
        ClientRegistration {
            name: "Reporting backend".to_string(),
            client_type: ClientType::Confidential,
            redirect_uris: vec![],
            allowed_scopes: ScopeSet::parse("reports.read").unwrap(),
            grant_types: vec![GrantType::ClientCredentials],
            require_pkce: false,
            access_token_ttl_secs: None,
            refresh_token_ttl_secs: None,
            public_key_pem: None,
        }
    }

    const PRIVATE_PEM: &str = include_str!("../../tests/fixtures/rsa_private.pem");
    const PUBLIC_PEM: &str = include_str!("../../tests/fixtures/rsa_public.pem");

    fn assertion(iss: &str, sub: &str, aud: &str, exp: i64) -> String {
        let key = EncodingKey::from_rsa_pem(PRIVATE_PEM.as_bytes()).unwrap();
        let claims = json!({ "iss": iss, "sub": sub, "aud": aud, "exp": exp, "jti": "a-1" });
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key).unwrap()
    }

    #[tokio::test]
    async fn huge_token_ttl_override_is_a_validation_error() {
        let engine = Engine::builder().config(EngineConfig::testing()).build().unwrap();
        let ctx = CallContext::new();

        for ttl in [100_000_000_000_000, i64::MAX, 0] {
            let err = engine
                .clients
                .register(
                    &ctx,
                    ClientRegistration {
                        access_token_ttl_secs: Some(ttl),
                        ..confidential()
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidRequest(_)), "ttl {ttl}: {err:?}");
        }
    }

    #[tokio::test]
    async fn key_holding_client_authenticates_with_a_signed_assertion() {
        let audit = Arc::new(InMemoryAuditSink::new());
        let engine = Engine::builder()
            .config(EngineConfig::testing())
            .audit(audit.clone())
            .build()
            .unwrap();
        let ctx = CallContext::new();
        let registered = engine
            .clients
            .register(
                &ctx,
                ClientRegistration {
                    public_key_pem: Some(PUBLIC_PEM.to_string()),
                    ..confidential()
                },
            )
            .await
            .unwrap();
        assert!(registered.client_secret.is_none());
        assert_eq!(registered.client.public_key_pem(), Some(PUBLIC_PEM));

        let id = registered.client.id.to_string();
        let issuer = engine.config().issuer.clone();
        let exp = engine.deps().now().timestamp() + 60;

        let client = engine
            .clients
            .authenticate(
                &ctx,
                &id,
                ClientProof::Assertion(&assertion(&id, &id, &format!("{issuer}/oauth2/token"), exp)),
            )
            .await
            .unwrap();
        assert_eq!(client.id, registered.client.id);
        engine
            .clients
            .authenticate(&ctx, &id, ClientProof::Assertion(&assertion(&id, &id, &issuer, exp)))
            .await
            .unwrap();

        let other = ClientId::new().to_string();
        for bad in [
            assertion(&id, &id, "https://elsewhere.example", exp),
            assertion(&other, &id, &issuer, exp),
            assertion(&id, &id, &issuer, exp - 3600),
            "not.a.jwt".to_string(),
        ] {
            let err = engine
                .clients
                .authenticate(&ctx, &id, ClientProof::Assertion(&bad))
                .await
                .unwrap_err();
            assert_eq!(err, EngineError::InvalidClient);
        }

        // No secret was issued, so neither a secret nor nothing authenticates.
        for proof in [ClientProof::Secret(""), ClientProof::Secret("guess"), ClientProof::None] {
            let err = engine.clients.authenticate(&ctx, &id, proof).await.unwrap_err();
            assert_eq!(err, EngineError::InvalidClient);
        }
        assert_eq!(audit.count_kind("client_authentication_failed"), 7);
    }

    #[tokio::test]
    async fn secret_client_cannot_use_an_assertion() {
        let engine = Engine::builder().config(EngineConfig::testing()).build().unwrap();
        let ctx = CallContext::new();
        let registered = engine.clients.register(&ctx, confidential()).await.unwrap();
        let id = registered.client.id.to_string();
        let signed = assertion(&id, &id, &engine.config().issuer, engine.deps().now().timestamp() + 60);

        let err = engine
            .clients
            .authenticate(&ctx, &id, ClientProof::Assertion(&signed))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::InvalidClient);
    }

    #[tokio::test]
    async fn registered_keys_must_parse_and_belong_to_confidential_clients() {
        let engine = Engine::builder().config(EngineConfig::testing()).build().unwrap();
        let ctx = CallContext::new();

        let garbage = engine
            .clients
            .register(
                &ctx,
                ClientRegistration {
                    public_key_pem: Some("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n".to_string()),
                    ..confidential()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(garbage, EngineError::InvalidRequest(_)));

        let public = engine
            .clients
            .register(
                &ctx,
                ClientRegistration {
                    client_type: ClientType::Public,
                    grant_types: vec![GrantType::AuthorizationCode],
                    redirect_uris: vec!["https://app.example.com/cb".to_string()],
                    require_pkce: true,
                    public_key_pem: Some(PUBLIC_PEM.to_string()),
                    ..confidential()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(public, EngineError::InvalidRequest(_)));
    }

    #[test]
    fn one_authentication_method_per_request() {
        assert_eq!(ClientProof::from_parts(None, None).unwrap(), ClientProof::None);
        assert_eq!(ClientProof::from_parts(Some("s"), None).unwrap(), ClientProof::Secret("s"));
        assert_eq!(ClientProof::from_parts(None, Some("jwt")).unwrap(), ClientProof::Assertion("jwt"));
        let err = ClientProof::from_parts(Some("s"), Some("jwt")).unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_request");
    }

    #[tokio::test]
    async fn rotated_secret_replaces_the_old_one_immediately() {
        let audit = Arc::new(InMemoryAuditSink::new());
        let engine = Engine::builder()
            .config(EngineConfig::testing())
            .audit(audit.clone())
            .build()
            .unwrap();
        let ctx = CallContext::new();

        let registered = engine.clients.register(&ctx, confidential()).await.unwrap();
        let id = registered.client.id.to_string();
        let original = registered.client_secret.unwrap();

        engine
            .clients
            .authenticate_client(&ctx, &id, Some(&original))
            .await
            .unwrap();

        let rotated = engine.clients.rotate_secret(&ctx, registered.client.id).await.unwrap();
        let err = engine
            .clients
            .authenticate_client(&ctx, &id, Some(&original))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::InvalidClient);
        engine
            .clients
            .authenticate_client(&ctx, &id, Some(&rotated))
            .await
            .unwrap();

        assert_eq!(audit.count_kind("client_authentication_failed"), 1);
    }

    #[tokio::test]
    async fn unknown_and_deactivated_clients_fail_identically() {
        let engine = Engine::builder().config(EngineConfig::testing()).build().unwrap();
        let ctx = CallContext::new();

        let registered = engine.clients.register(&ctx, confidential()).await.unwrap();
        let secret = registered.client_secret.clone().unwrap();
        engine.clients.deactivate(&ctx, registered.client.id).await.unwrap();

        let deactivated = engine
            .clients
            .authenticate_client(&ctx, &registered.client.id.to_string(), Some(&secret))
            .await
            .unwrap_err();
        let unknown = engine
            .clients
            .authenticate_client(&ctx, &ClientId::new().to_string(), Some(&secret))
            .await
            .unwrap_err();
        let garbage = engine
            .clients
            .authenticate_client(&ctx, "not-a-client", None)
            .await
            .unwrap_err();

        assert_eq!(deactivated, unknown);
        assert_eq!(unknown, garbage);
    }
}
