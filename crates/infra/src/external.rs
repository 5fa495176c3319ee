//! Federated identity proof checking.
//!
//! Real adapters (OIDC providers, SAML) live outside the engine; it only needs
//! "does this assertion prove subject X at provider P".

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifierError {
    #[error("assertion rejected")]
    Rejected,
    #[error("unknown identity provider: {0}")]
    UnknownProvider(String),
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ExternalIdentityVerifier: Send + Sync {
    /// Returns the subject identifier at `provider` proven by `assertion`.
    async fn verify(&self, provider: &str, assertion: &str) -> Result<String, VerifierError>;
}

#[async_trait]
impl<V> ExternalIdentityVerifier for std::sync::Arc<V>
where
    V: ExternalIdentityVerifier + ?Sized,
{
    async fn verify(&self, provider: &str, assertion: &str) -> Result<String, VerifierError> {
        (**self).verify(provider, assertion).await
    }
}

/// Table-driven verifier for tests and local development.
///
/// Maps `(provider, assertion)` to an external id. Providers are matched
/// case-insensitively.
#[derive(Debug, Default)]
pub struct StaticIdentityVerifier {
    assertions: RwLock<HashMap<(String, String), String>>,
}

impl StaticIdentityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: &str, assertion: &str, external_id: &str) {
        if let Ok(mut map) = self.assertions.write() {
            map.insert(
                (provider.to_lowercase(), assertion.to_string()),
                external_id.to_string(),
            );
        }
    }

    fn knows_provider(map: &HashMap<(String, String), String>, provider: &str) -> bool {
        map.keys().any(|(p, _)| p == provider)
    }
}

#[async_trait]
impl ExternalIdentityVerifier for StaticIdentityVerifier {
    async fn verify(&self, provider: &str, assertion: &str) -> Result<String, VerifierError> {
        let map = self
            .assertions
            .read()
            .map_err(|_| VerifierError::Unavailable("lock poisoned".to_string()))?;
        let provider = provider.to_lowercase();
        if !Self::knows_provider(&map, &provider) {
            return Err(VerifierError::UnknownProvider(provider));
        }
        map.get(&(provider, assertion.to_string()))
            .cloned()
            .ok_or(VerifierError::Rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_assertions_resolve() {
        let verifier = StaticIdentityVerifier::new();
        verifier.register("Google", "proof-1", "g-123");

        assert_eq!(verifier.verify("google", "proof-1").await.unwrap(), "g-123");
        assert_eq!(verifier.verify("google", "forged").await, Err(VerifierError::Rejected));
        assert!(matches!(
            verifier.verify("saml", "proof-1").await,
            Err(VerifierError::UnknownProvider(_))
        ));
    }
}
