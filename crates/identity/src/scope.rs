//! OAuth2 scopes (RFC 6749 §3.3).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use gatekeep_core::DomainError;

pub const OPENID: &str = "openid";

/// A set of scope tokens; rendered space-delimited on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a space-delimited scope string. Empty input gives an empty set.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let mut set = BTreeSet::new();
        for token in raw.split(' ').filter(|t| !t.is_empty()) {
            if !token.bytes().all(is_scope_char) {
                return Err(DomainError::validation(format!("invalid scope token '{token}'")));
            }
            set.insert(token.to_string());
        }
        Ok(Self(set))
    }

    pub fn from_tokens<I, S>(tokens: I) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = tokens
            .into_iter()
            .map(|t| t.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        Self::parse(&joined)
    }

    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(scope)
    }

    pub fn is_subset_of(&self, other: &ScopeSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn requests_openid(&self) -> bool {
        self.contains(OPENID)
    }
}

impl core::fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let joined = self.0.iter().map(String::as_str).collect::<Vec<_>>().join(" ");
        f.write_str(&joined)
    }
}

// scope-token = 1*( %x21 / %x23-5B / %x5D-7E )
fn is_scope_char(b: u8) -> bool {
    b == 0x21 || (0x23..=0x5B).contains(&b) || (0x5D..=0x7E).contains(&b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_space_delimited_and_dedups() {
        let scopes = ScopeSet::parse("openid  profile openid").unwrap();
        assert_eq!(scopes.len(), 2);
        assert!(scopes.requests_openid());
        assert_eq!(scopes.to_string(), "openid profile");
    }

    #[test]
    fn rejects_quotes_and_backslashes() {
        assert!(ScopeSet::parse("read \"write\"").is_err());
        assert!(ScopeSet::parse("a\\b").is_err());
    }

    #[test]
    fn subset_check() {
        let allowed = ScopeSet::parse("openid profile email").unwrap();
        assert!(ScopeSet::parse("openid email").unwrap().is_subset_of(&allowed));
        assert!(!ScopeSet::parse("admin").unwrap().is_subset_of(&allowed));
    }
}
