//! Identity (user) aggregate, event-sourced.
//!
//! Registration, password authentication, password change, external identity
//! linking, role assignment and deactivation. Cross-aggregate rules (email
//! uniqueness, one owner per external identity) are enforced by
//! [`crate::claim::UniqueClaim`] streams *before* the user events are appended.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gatekeep_core::{Aggregate, AggregateRoot, DomainError, UserId};
use gatekeep_events::Event;

use crate::Role;
use crate::password::verify_password;

// ─────────────────────────────────────────────────────────────────────────────
// Value types
// ─────────────────────────────────────────────────────────────────────────────

/// An identity at an external provider linked to a local user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkedIdentity {
    pub provider: String,
    pub external_id: String,
}

/// Normalise and validate an email address.
///
/// Deliberately shallow: one `@`, non-empty local part, a dotted domain, no
/// whitespace. Deliverability is the mailer's problem.
pub fn normalize_email(raw: &str) -> Result<String, DomainError> {
    let email = raw.trim().to_lowercase();
    let malformed = || DomainError::validation("invalid email format");

    if email.is_empty() || email.len() > 254 || email.chars().any(char::is_whitespace) {
        return Err(malformed());
    }
    let (local, domain) = email.split_once('@').ok_or_else(malformed)?;
    if local.is_empty() || domain.contains('@') {
        return Err(malformed());
    }
    if !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(malformed());
    }
    Ok(email)
}

// ─────────────────────────────────────────────────────────────────────────────
// User Aggregate
// ─────────────────────────────────────────────────────────────────────────────

/// User aggregate.
///
/// # Invariants
/// - Created by exactly one `UserRegistered`; never deleted.
/// - A deactivated user cannot authenticate, change password or link identities.
/// - Role assignment/revocation is idempotent and emits nothing when it would
///   not change the role set.
#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub password_hash: String,
    pub roles: BTreeSet<Role>,
    pub linked_identities: BTreeSet<LinkedIdentity>,
    pub active: bool,
    pub registered_at: Option<DateTime<Utc>>,
    pub last_authenticated_at: Option<DateTime<Utc>>,
    pub failed_attempts: u32,
    pub version: u64,
    pub registered: bool,
}

impl User {
    pub fn ensure_registered(&self) -> Result<(), DomainError> {
        if !self.registered {
            return Err(DomainError::NotFound);
        }
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), DomainError> {
        self.ensure_registered()?;
        if !self.active {
            return Err(DomainError::invariant("user is deactivated"));
        }
        Ok(())
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.as_str() == role)
    }
}

impl AggregateRoot for User {
    type Id = UserId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterUser {
    pub user_id: UserId,
    pub email: String,
    /// PHC hash, computed by the caller after the password policy passed.
    pub password_hash: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuthenticateUser {
    pub password: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChangePassword {
    pub current_password: String,
    pub new_password_hash: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkIdentity {
    /// Already verified by the external identity verifier.
    pub identity: LinkedIdentity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRole {
    pub role: Role,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeactivateUser {
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum UserCommand {
    Register(RegisterUser),
    Authenticate(AuthenticateUser),
    ChangePassword(ChangePassword),
    LinkIdentity(LinkIdentity),
    AssignRole(ChangeRole),
    RevokeRole(ChangeRole),
    Deactivate(DeactivateUser),
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistered {
    pub user_id: UserId,
    pub email: String,
    pub password_hash: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAuthenticated {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailureReason {
    BadCredentials,
    Deactivated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationFailed {
    pub reason: AuthFailureReason,
    pub ip: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordChanged {
    pub password_hash: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityLinked {
    pub identity: LinkedIdentity,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleChanged {
    pub role: Role,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDeactivated {
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// All user events. Closed set: an unknown variant in a stored stream fails
/// rehydration instead of being skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserEvent {
    Registered(UserRegistered),
    Authenticated(UserAuthenticated),
    AuthenticationFailed(AuthenticationFailed),
    PasswordChanged(PasswordChanged),
    IdentityLinked(IdentityLinked),
    RoleAssigned(RoleChanged),
    RoleRevoked(RoleChanged),
    Deactivated(UserDeactivated),
}

impl Event for UserEvent {
    fn event_type(&self) -> &'static str {
        match self {
            UserEvent::Registered(_) => "identity.user.registered",
            UserEvent::Authenticated(_) => "identity.user.authenticated",
            UserEvent::AuthenticationFailed(_) => "identity.user.authentication_failed",
            UserEvent::PasswordChanged(_) => "identity.user.password_changed",
            UserEvent::IdentityLinked(_) => "identity.user.identity_linked",
            UserEvent::RoleAssigned(_) => "identity.user.role_assigned",
            UserEvent::RoleRevoked(_) => "identity.user.role_revoked",
            UserEvent::Deactivated(_) => "identity.user.deactivated",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            UserEvent::Registered(e) => e.occurred_at,
            UserEvent::Authenticated(e) => e.occurred_at,
            UserEvent::AuthenticationFailed(e) => e.occurred_at,
            UserEvent::PasswordChanged(e) => e.occurred_at,
            UserEvent::IdentityLinked(e) => e.occurred_at,
            UserEvent::RoleAssigned(e) => e.occurred_at,
            UserEvent::RoleRevoked(e) => e.occurred_at,
            UserEvent::Deactivated(e) => e.occurred_at,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Aggregate Implementation
// ─────────────────────────────────────────────────────────────────────────────

impl Aggregate for User {
    type Command = UserCommand;
    type Event = UserEvent;
    type Error = DomainError;

    const AGGREGATE_TYPE: &'static str = "identity.user";

    fn empty(id: UserId) -> Self {
        Self {
            id,
            email: String::new(),
            password_hash: String::new(),
            roles: BTreeSet::new(),
            linked_identities: BTreeSet::new(),
            active: false,
            registered_at: None,
            last_authenticated_at: None,
            failed_attempts: 0,
            version: 0,
            registered: false,
        }
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            UserEvent::Registered(e) => {
                self.id = e.user_id;
                self.email = e.email.clone();
                self.password_hash = e.password_hash.clone();
                self.active = true;
                self.registered = true;
                self.registered_at = Some(e.occurred_at);
            }
            UserEvent::Authenticated(e) => {
                self.last_authenticated_at = Some(e.occurred_at);
                self.failed_attempts = 0;
            }
            UserEvent::AuthenticationFailed(_) => {
                self.failed_attempts = self.failed_attempts.saturating_add(1);
            }
            UserEvent::PasswordChanged(e) => {
                self.password_hash = e.password_hash.clone();
                self.failed_attempts = 0;
            }
            UserEvent::IdentityLinked(e) => {
                self.linked_identities.insert(e.identity.clone());
            }
            UserEvent::RoleAssigned(e) => {
                self.roles.insert(e.role.clone());
            }
            UserEvent::RoleRevoked(e) => {
                self.roles.remove(&e.role);
            }
            UserEvent::Deactivated(_) => {
                self.active = false;
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            UserCommand::Register(cmd) => self.handle_register(cmd),
            UserCommand::Authenticate(cmd) => self.handle_authenticate(cmd),
            UserCommand::ChangePassword(cmd) => self.handle_change_password(cmd),
            UserCommand::LinkIdentity(cmd) => self.handle_link_identity(cmd),
            UserCommand::AssignRole(cmd) => self.handle_assign_role(cmd),
            UserCommand::RevokeRole(cmd) => self.handle_revoke_role(cmd),
            UserCommand::Deactivate(cmd) => self.handle_deactivate(cmd),
        }
    }
}

impl User {
    // ─────────────────────────────────────────────────────────────────────────
    // Command Handlers
    // ─────────────────────────────────────────────────────────────────────────

    fn handle_register(&self, cmd: &RegisterUser) -> Result<Vec<UserEvent>, DomainError> {
        if self.registered {
            return Err(DomainError::conflict("user already exists"));
        }
        let email = normalize_email(&cmd.email)?;
        if cmd.password_hash.is_empty() {
            return Err(DomainError::validation("password hash is required"));
        }

        Ok(vec![UserEvent::Registered(UserRegistered {
            user_id: cmd.user_id,
            email,
            password_hash: cmd.password_hash.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Always emits exactly one event: success or failure are both facts.
    fn handle_authenticate(&self, cmd: &AuthenticateUser) -> Result<Vec<UserEvent>, DomainError> {
        self.ensure_registered()?;

        if !self.active {
            return Ok(vec![UserEvent::AuthenticationFailed(AuthenticationFailed {
                reason: AuthFailureReason::Deactivated,
                ip: cmd.ip.clone(),
                occurred_at: cmd.occurred_at,
            })]);
        }

        if !verify_password(&self.password_hash, &cmd.password) {
            return Ok(vec![UserEvent::AuthenticationFailed(AuthenticationFailed {
                reason: AuthFailureReason::BadCredentials,
                ip: cmd.ip.clone(),
                occurred_at: cmd.occurred_at,
            })]);
        }

        Ok(vec![UserEvent::Authenticated(UserAuthenticated {
            ip: cmd.ip.clone(),
            user_agent: cmd.user_agent.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_change_password(&self, cmd: &ChangePassword) -> Result<Vec<UserEvent>, DomainError> {
        self.ensure_active()?;

        if !verify_password(&self.password_hash, &cmd.current_password) {
            return Err(DomainError::Authentication);
        }
        if cmd.new_password_hash.is_empty() {
            return Err(DomainError::validation("password hash is required"));
        }

        Ok(vec![UserEvent::PasswordChanged(PasswordChanged {
            password_hash: cmd.new_password_hash.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_link_identity(&self, cmd: &LinkIdentity) -> Result<Vec<UserEvent>, DomainError> {
        self.ensure_active()?;

        let identity = &cmd.identity;
        if identity.provider.trim().is_empty() || identity.external_id.trim().is_empty() {
            return Err(DomainError::validation("provider and external id are required"));
        }
        if self.linked_identities.contains(identity) {
            return Ok(vec![]);
        }

        Ok(vec![UserEvent::IdentityLinked(IdentityLinked {
            identity: identity.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_assign_role(&self, cmd: &ChangeRole) -> Result<Vec<UserEvent>, DomainError> {
        self.ensure_active()?;

        if cmd.role.as_str().trim().is_empty() {
            return Err(DomainError::validation("role cannot be empty"));
        }
        if self.roles.contains(&cmd.role) {
            return Ok(vec![]);
        }

        Ok(vec![UserEvent::RoleAssigned(RoleChanged {
            role: cmd.role.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_revoke_role(&self, cmd: &ChangeRole) -> Result<Vec<UserEvent>, DomainError> {
        self.ensure_registered()?;

        if !self.roles.contains(&cmd.role) {
            return Ok(vec![]);
        }

        Ok(vec![UserEvent::RoleRevoked(RoleChanged {
            role: cmd.role.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_deactivate(&self, cmd: &DeactivateUser) -> Result<Vec<UserEvent>, DomainError> {
        self.ensure_registered()?;

        if !self.active {
            return Ok(vec![]);
        }

        Ok(vec![UserEvent::Deactivated(UserDeactivated {
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::{PasswordHasher, PasswordHashing};

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn hasher() -> PasswordHasher {
        PasswordHasher::new(PasswordHashing::testing()).unwrap()
    }

    fn execute(user: &mut User, cmd: UserCommand) -> Result<Vec<UserEvent>, DomainError> {
        let events = user.handle(&cmd)?;
        for e in &events {
            user.apply(e);
        }
        Ok(events)
    }

    fn registered_user(password: &str) -> User {
        let user_id = UserId::new();
        let mut user = User::empty(user_id);
        execute(
            &mut user,
            UserCommand::Register(RegisterUser {
                user_id,
                email: "  Alice@Example.com ".to_string(),
                password_hash: hasher().hash(password).unwrap(),
                occurred_at: now(),
            }),
        )
        .unwrap();
        user
    }

    fn authenticate(password: &str) -> UserCommand {
        UserCommand::Authenticate(AuthenticateUser {
            password: password.to_string(),
            ip: Some("10.0.0.1".to_string()),
            user_agent: None,
            occurred_at: now(),
        })
    }

    #[test]
    fn register_normalizes_email() {
        let user = registered_user("hunter2hunter2");
        assert_eq!(user.email, "alice@example.com");
        assert!(user.active);
        assert_eq!(user.version, 1);
    }

    #[test]
    fn register_rejects_malformed_email() {
        for bad in ["", "no-at-sign", "@example.com", "a@b", "a b@example.com", "a@@b.com"] {
            assert!(normalize_email(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn register_twice_conflicts() {
        let user = registered_user("hunter2hunter2");
        let again = user.handle(&UserCommand::Register(RegisterUser {
            user_id: user.id,
            email: "other@example.com".to_string(),
            password_hash: "x".to_string(),
            occurred_at: now(),
        }));
        assert!(matches!(again, Err(DomainError::Conflict(_))));
    }

    #[test]
    fn authenticate_success_and_failure_are_both_recorded() {
        let mut user = registered_user("hunter2hunter2");

        let failed = execute(&mut user, authenticate("wrong")).unwrap();
        assert!(matches!(
            failed[0],
            UserEvent::AuthenticationFailed(AuthenticationFailed {
                reason: AuthFailureReason::BadCredentials,
                ..
            })
        ));
        assert_eq!(user.failed_attempts, 1);

        let ok = execute(&mut user, authenticate("hunter2hunter2")).unwrap();
        assert!(matches!(ok[0], UserEvent::Authenticated(_)));
        assert_eq!(user.failed_attempts, 0);
        assert!(user.last_authenticated_at.is_some());
    }

    #[test]
    fn deactivated_user_cannot_authenticate() {
        let mut user = registered_user("hunter2hunter2");
        execute(
            &mut user,
            UserCommand::Deactivate(DeactivateUser {
                reason: "requested".to_string(),
                occurred_at: now(),
            }),
        )
        .unwrap();

        let events = user.handle(&authenticate("hunter2hunter2")).unwrap();
        assert!(matches!(
            events[0],
            UserEvent::AuthenticationFailed(AuthenticationFailed {
                reason: AuthFailureReason::Deactivated,
                ..
            })
        ));
    }

    #[test]
    fn change_password_requires_current_password() {
        let mut user = registered_user("hunter2hunter2");
        let new_hash = hasher().hash("new-password-1").unwrap();

        let wrong = user.handle(&UserCommand::ChangePassword(ChangePassword {
            current_password: "nope".to_string(),
            new_password_hash: new_hash.clone(),
            occurred_at: now(),
        }));
        assert_eq!(wrong.unwrap_err(), DomainError::Authentication);

        execute(
            &mut user,
            UserCommand::ChangePassword(ChangePassword {
                current_password: "hunter2hunter2".to_string(),
                new_password_hash: new_hash,
                occurred_at: now(),
            }),
        )
        .unwrap();

        let events = user.handle(&authenticate("new-password-1")).unwrap();
        assert!(matches!(events[0], UserEvent::Authenticated(_)));
    }

    #[test]
    fn role_assignment_is_idempotent() {
        let mut user = registered_user("hunter2hunter2");
        let assign = || {
            UserCommand::AssignRole(ChangeRole {
                role: Role::new("admin"),
                occurred_at: now(),
            })
        };

        assert_eq!(execute(&mut user, assign()).unwrap().len(), 1);
        assert!(execute(&mut user, assign()).unwrap().is_empty());
        assert!(user.has_role("admin"));

        let revoke = || {
            UserCommand::RevokeRole(ChangeRole {
                role: Role::new("admin"),
                occurred_at: now(),
            })
        };
        assert_eq!(execute(&mut user, revoke()).unwrap().len(), 1);
        assert!(execute(&mut user, revoke()).unwrap().is_empty());
        assert!(!user.has_role("admin"));
    }

    #[test]
    fn linking_same_identity_twice_is_a_noop() {
        let mut user = registered_user("hunter2hunter2");
        let link = || {
            UserCommand::LinkIdentity(LinkIdentity {
                identity: LinkedIdentity {
                    provider: "google".to_string(),
                    external_id: "1234".to_string(),
                },
                occurred_at: now(),
            })
        };

        assert_eq!(execute(&mut user, link()).unwrap().len(), 1);
        assert!(execute(&mut user, link()).unwrap().is_empty());
        assert_eq!(user.linked_identities.len(), 1);
    }

    #[test]
    fn rehydration_matches_incremental_state() {
        let mut user = registered_user("hunter2hunter2");
        let mut history = vec![];
        // Re-run through the public fold to prove state is derived from events alone.
        for cmd in [
            authenticate("bad"),
            UserCommand::AssignRole(ChangeRole {
                role: Role::new("auditor"),
                occurred_at: now(),
            }),
        ] {
            history.extend(execute(&mut user, cmd).unwrap());
        }

        let registered = UserEvent::Registered(UserRegistered {
            user_id: user.id,
            email: user.email.clone(),
            password_hash: user.password_hash.clone(),
            occurred_at: user.registered_at.unwrap(),
        });
        let all: Vec<UserEvent> = std::iter::once(registered).chain(history).collect();
        let rebuilt = User::rehydrate(user.id, &all);

        assert_eq!(rebuilt.version, user.version);
        assert_eq!(rebuilt.roles, user.roles);
        assert_eq!(rebuilt.failed_attempts, user.failed_attempts);
    }

    #[test]
    fn unknown_event_variant_fails_to_decode() {
        let raw = serde_json::json!({ "Teleported": { "occurred_at": "2024-01-01T00:00:00Z" } });
        assert!(serde_json::from_value::<UserEvent>(raw).is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

            #[test]
            fn email_normalization_is_idempotent(
                local in "[A-Za-z0-9._+-]{1,20}",
                domain in "[A-Za-z0-9-]{1,20}",
                tld in "[A-Za-z]{2,6}",
                pad in " {0,3}",
            ) {
                let raw = format!("{pad}{local}@{domain}.{tld}{pad}");
                let once = normalize_email(&raw).unwrap();
                prop_assert_eq!(normalize_email(&once).unwrap(), once.clone());
                prop_assert_eq!(once.clone(), once.to_lowercase());
            }
        }
    }
}
