//! Password policy and Argon2id hashing.
//!
//! Hashing needs a random salt, so it happens *before* a command is built;
//! verification is deterministic and runs inside the aggregate.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use gatekeep_core::DomainError;

/// Password complexity rules. All thresholds are configuration inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub max_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_digit: bool,
    pub require_special: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 12,
            max_length: 128,
            require_uppercase: true,
            require_lowercase: true,
            require_digit: true,
            require_special: true,
        }
    }
}

impl PasswordPolicy {
    /// Length-only policy for development and tests.
    pub fn lenient() -> Self {
        Self {
            min_length: 8,
            max_length: 128,
            require_uppercase: false,
            require_lowercase: false,
            require_digit: false,
            require_special: false,
        }
    }

    pub fn validate(&self, password: &str) -> Result<(), DomainError> {
        let mut problems = Vec::new();
        let length = password.chars().count();

        if length < self.min_length {
            problems.push(format!("must be at least {} characters", self.min_length));
        }
        if length > self.max_length {
            problems.push(format!("must be at most {} characters", self.max_length));
        }
        if self.require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
            problems.push("must contain an uppercase letter".to_string());
        }
        if self.require_lowercase && !password.chars().any(|c| c.is_lowercase()) {
            problems.push("must contain a lowercase letter".to_string());
        }
        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            problems.push("must contain a digit".to_string());
        }
        if self.require_special && !password.chars().any(|c| !c.is_alphanumeric()) {
            problems.push("must contain a special character".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DomainError::validation(format!("password {}", problems.join(", "))))
        }
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordHashing {
    /// Memory cost in KiB.
    pub memory_cost: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for PasswordHashing {
    fn default() -> Self {
        Self {
            memory_cost: 19 * 1024,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

impl PasswordHashing {
    /// Minimal cost, for tests only.
    pub fn testing() -> Self {
        Self {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

/// Produces PHC-formatted Argon2id hashes.
#[derive(Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl core::fmt::Debug for PasswordHasher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PasswordHasher").finish_non_exhaustive()
    }
}

impl PasswordHasher {
    pub fn new(config: PasswordHashing) -> Result<Self, DomainError> {
        let params = Params::new(config.memory_cost, config.time_cost, config.parallelism, None)
            .map_err(|e| DomainError::invariant(format!("invalid argon2 parameters: {e}")))?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    pub fn hash(&self, password: &str) -> Result<String, DomainError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| DomainError::invariant(format!("password hashing failed: {e}")))
    }
}

/// Check a password against a stored PHC hash.
///
/// Cost parameters are read from the hash itself. The final digest comparison
/// inside argon2 is constant time; a malformed stored hash never verifies.
pub fn verify_password(stored_hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_reports_every_problem() {
        let err = PasswordPolicy::default().validate("short").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("at least 12"));
        assert!(msg.contains("uppercase"));
        assert!(msg.contains("digit"));
        assert!(msg.contains("special"));
    }

    #[test]
    fn default_policy_accepts_strong_password() {
        assert!(PasswordPolicy::default().validate("Correct-Horse-9").is_ok());
    }

    #[test]
    fn lenient_policy_only_checks_length() {
        assert!(PasswordPolicy::lenient().validate("abcdefgh").is_ok());
        assert!(PasswordPolicy::lenient().validate("abc").is_err());
    }

    #[test]
    fn hash_then_verify() {
        let hasher = PasswordHasher::new(PasswordHashing::testing()).unwrap();
        let hash = hasher.hash("s3cret-pass").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password(&hash, "s3cret-pass"));
        assert!(!verify_password(&hash, "s3cret-pasS"));
        assert!(!verify_password("not-a-phc-string", "s3cret-pass"));
    }
}
