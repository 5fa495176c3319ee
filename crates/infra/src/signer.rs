//! Token signing.
//!
//! The engine only sees the [`Signer`] contract; key material stays inside the
//! implementation. [`JwtSigner`] signs with `jsonwebtoken` (HS256 for
//! development, RS256 for anything a third party must verify) and publishes
//! its public half as a JWKS.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use gatekeep_oauth::TokenClaims;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignerError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    SignatureInvalid,
    #[error("signing key error: {0}")]
    Key(String),
    #[error("signer unavailable: {0}")]
    Unavailable(String),
}

/// One entry of a JSON Web Key Set (RFC 7517).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    pub kid: String,
    pub n: String,
    pub e: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Signs and verifies token claims. Possibly remote (KMS/HSM), hence async.
///
/// `verify` checks the signature and the claim shape only; time window and
/// revocation are the token service's job.
#[async_trait]
pub trait Signer: Send + Sync {
    /// `kid` placed in the header of every token.
    fn key_id(&self) -> &str;

    /// JWS algorithm name (`HS256`, `RS256`).
    fn algorithm(&self) -> &'static str;

    /// Public verification keys. Empty for symmetric signers.
    fn jwks(&self) -> Jwks;

    async fn sign(&self, claims: &TokenClaims) -> Result<String, SignerError>;

    async fn verify(&self, token: &str) -> Result<TokenClaims, SignerError>;
}

#[derive(Debug, Clone)]
struct RsaComponents {
    n: String,
    e: String,
}

/// `jsonwebtoken`-backed signer.
pub struct JwtSigner {
    algorithm: Algorithm,
    key_id: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    rsa: Option<RsaComponents>,
}

impl std::fmt::Debug for JwtSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSigner")
            .field("algorithm", &self.algorithm)
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl JwtSigner {
    /// HS256 with a shared secret. Tokens are only verifiable by this server.
    pub fn hs256(secret: &[u8], key_id: impl Into<String>) -> Self {
        let key_id = key_id.into();
        info!(kid = %key_id, "token signer initialised with HS256");
        Self {
            algorithm: Algorithm::HS256,
            key_id,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            rsa: None,
        }
    }

    /// RS256 from a PEM key pair. The `kid` defaults to a digest of the public
    /// key so that rotating keys rotates the id.
    pub fn rs256(private_key_pem: &str, public_key_pem: &str, key_id: Option<String>) -> Result<Self, SignerError> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .map_err(|e| SignerError::Key(format!("invalid RSA private key: {e}")))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| SignerError::Key(format!("invalid RSA public key: {e}")))?;
        let rsa = rsa_components(public_key_pem)?;
        let key_id = key_id.unwrap_or_else(|| derive_key_id(public_key_pem));

        info!(kid = %key_id, "token signer initialised with RS256");

        Ok(Self {
            algorithm: Algorithm::RS256,
            key_id,
            encoding_key,
            decoding_key,
            rsa: Some(rsa),
        })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(self.algorithm);
        // Time window is checked against the injected clock by the caller.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation
    }
}

fn derive_key_id(public_key_pem: &str) -> String {
    let digest = Sha256::digest(public_key_pem.trim().as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..12])
}

fn rsa_components(public_key_pem: &str) -> Result<RsaComponents, SignerError> {
    use rsa::RsaPublicKey;
    use rsa::pkcs1::DecodeRsaPublicKey;
    use rsa::pkcs8::DecodePublicKey;
    use rsa::traits::PublicKeyParts;

    let key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(public_key_pem))
        .map_err(|e| SignerError::Key(format!("failed to parse RSA public key: {e}")))?;

    Ok(RsaComponents {
        n: URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
    })
}

#[async_trait]
impl Signer for JwtSigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn algorithm(&self) -> &'static str {
        match self.algorithm {
            Algorithm::RS256 => "RS256",
            _ => "HS256",
        }
    }

    fn jwks(&self) -> Jwks {
        let keys = self
            .rsa
            .as_ref()
            .map(|rsa| Jwk {
                kty: "RSA".to_string(),
                use_: "sig".to_string(),
                alg: "RS256".to_string(),
                kid: self.key_id.clone(),
                n: rsa.n.clone(),
                e: rsa.e.clone(),
            })
            .into_iter()
            .collect();
        Jwks { keys }
    }

    async fn sign(&self, claims: &TokenClaims) -> Result<String, SignerError> {
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.key_id.clone());
        encode(&header, claims, &self.encoding_key).map_err(|e| SignerError::Key(e.to_string()))
    }

    async fn verify(&self, token: &str) -> Result<TokenClaims, SignerError> {
        let header = decode_header(token).map_err(|_| SignerError::Malformed)?;
        if header.alg != self.algorithm {
            return Err(SignerError::SignatureInvalid);
        }
        if header.kid.as_deref() != Some(self.key_id.as_str()) {
            return Err(SignerError::SignatureInvalid);
        }

        decode::<TokenClaims>(token, &self.decoding_key, &self.validation())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => SignerError::SignatureInvalid,
                _ => SignerError::Malformed,
            })
    }
}

#[cfg(test)]
mod tests {
    use gatekeep_core::FamilyId;
    use gatekeep_oauth::TokenUse;
    use uuid::Uuid;

    use super::*;

    const PRIVATE_PEM: &str = include_str!("../tests/fixtures/rsa_private.pem");
    const PUBLIC_PEM: &str = include_str!("../tests/fixtures/rsa_public.pem");

    fn claims() -> TokenClaims {
        TokenClaims {
            iss: "https://id.example.com".to_string(),
            sub: "user-1".to_string(),
            aud: "client-1".to_string(),
            exp: 2_000_000_000,
            iat: 1_700_000_000,
            jti: Uuid::new_v4(),
            scope: "openid".to_string(),
            token_use: TokenUse::Access,
            fid: FamilyId::new(),
            sid: None,
            nonce: None,
            auth_time: None,
            roles: vec!["admin".to_string()],
        }
    }

    #[tokio::test]
    async fn hs256_round_trip_and_tamper_detection() {
        let signer = JwtSigner::hs256(b"0123456789abcdef0123456789abcdef", "dev");
        let c = claims();
        let token = signer.sign(&c).await.unwrap();
        assert_eq!(signer.verify(&token).await.unwrap(), c);

        let other = JwtSigner::hs256(b"another-secret-another-secret-xx", "dev");
        assert_eq!(other.verify(&token).await, Err(SignerError::SignatureInvalid));
        assert_eq!(signer.verify("not.a.jwt").await, Err(SignerError::Malformed));
        assert!(signer.jwks().keys.is_empty());
    }

    #[tokio::test]
    async fn expired_claims_still_verify_signature() {
        let signer = JwtSigner::hs256(b"0123456789abcdef0123456789abcdef", "dev");
        let mut c = claims();
        c.iat = 10;
        c.exp = 20;
        let token = signer.sign(&c).await.unwrap();
        assert_eq!(signer.verify(&token).await.unwrap().exp, 20);
    }

    #[tokio::test]
    async fn rs256_header_kid_matches_jwks() {
        let signer = JwtSigner::rs256(PRIVATE_PEM, PUBLIC_PEM, None).unwrap();
        let token = signer.sign(&claims()).await.unwrap();

        let header = decode_header(&token).unwrap();
        let jwks = signer.jwks();
        assert_eq!(jwks.keys.len(), 1);
        assert_eq!(header.kid.as_deref(), Some(jwks.keys[0].kid.as_str()));
        assert_eq!(jwks.keys[0].e, "AQAB");

        // A third party can verify from the published components alone.
        let key = DecodingKey::from_rsa_components(&jwks.keys[0].n, &jwks.keys[0].e).unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        let decoded = decode::<TokenClaims>(&token, &key, &validation).unwrap();
        assert_eq!(decoded.claims.sub, "user-1");
    }

    #[tokio::test]
    async fn foreign_kid_is_rejected() {
        let signer = JwtSigner::hs256(b"0123456789abcdef0123456789abcdef", "one");
        let rotated = JwtSigner::hs256(b"0123456789abcdef0123456789abcdef", "two");
        let token = signer.sign(&claims()).await.unwrap();
        assert_eq!(rotated.verify(&token).await, Err(SignerError::SignatureInvalid));
    }
}
