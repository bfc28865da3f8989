//! Token-based authentication and capability checks.
//!
//! Tokens are validated against SHA-256 hashes stored in configuration.
//! Every session starts as `guest`; a successful `AUTH` switches it to the
//! named user, whose grants then apply.

use crate::config::AuthConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Name of the unauthenticated user.
pub const GUEST: &str = "guest";

/// Capabilities a request may need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    /// JOIN and SUBSCRIBE.
    Replication,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Replication => "replication",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(Action::Read),
            "write" => Ok(Action::Write),
            "replication" => Ok(Action::Replication),
            other => Err(format!("unknown grant '{other}'")),
        }
    }
}

/// Decides who may do what.
pub trait AccessControl: Send + Sync {
    /// Returns whether `user` holds the capability for `action`.
    fn check_capability(&self, user: &str, action: Action) -> bool;

    /// Returns whether `token` is valid for `user`.
    fn authenticate(&self, user: &str, token: &str) -> bool;
}

/// Validates bearer tokens against pre-configured hashes.
#[derive(Debug, Clone)]
pub struct TokenValidator {
    valid_hashes: HashSet<String>,
}

impl TokenValidator {
    pub fn new(hashes: impl IntoIterator<Item = String>) -> Self {
        Self {
            valid_hashes: hashes
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn has_tokens(&self) -> bool {
        !self.valid_hashes.is_empty()
    }

    /// Validates a plaintext token by hashing and comparing.
    pub fn validate(&self, token: &str) -> bool {
        self.valid_hashes.contains(&Self::hash_token(token))
    }

    /// Hashes a token using SHA-256, returning a lowercase hex string.
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone)]
struct UserEntry {
    tokens: TokenValidator,
    grants: HashSet<Action>,
}

/// Static grants loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct Grants {
    guest: HashSet<Action>,
    users: HashMap<String, UserEntry>,
}

impl Grants {
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut grants = Self {
            guest: config.guest_grants.iter().copied().collect(),
            users: HashMap::new(),
        };
        for user in &config.users {
            grants.add_user(&user.name, user.token_hash.clone(), user.grants.iter().copied());
        }
        grants
    }

    /// Grants every capability to guests.
    pub fn allow_all() -> Self {
        Self::default().with_guest([Action::Read, Action::Write, Action::Replication])
    }

    pub fn with_guest(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.guest = actions.into_iter().collect();
        self
    }

    /// Adds a user, or another token for an existing one.
    pub fn add_user(
        &mut self,
        name: &str,
        token_hash: String,
        actions: impl IntoIterator<Item = Action>,
    ) {
        let entry = self
            .users
            .entry(name.to_string())
            .or_insert_with(|| UserEntry {
                tokens: TokenValidator::new(Vec::new()),
                grants: HashSet::new(),
            });
        entry.tokens.valid_hashes.insert(token_hash.to_ascii_lowercase());
        entry.grants.extend(actions);
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl AccessControl for Grants {
    fn check_capability(&self, user: &str, action: Action) -> bool {
        if user == GUEST {
            return self.guest.contains(&action);
        }
        self.users
            .get(user)
            .map(|entry| entry.grants.contains(&action))
            .unwrap_or(false)
    }

    fn authenticate(&self, user: &str, token: &str) -> bool {
        if user == GUEST {
            return true;
        }
        self.users
            .get(user)
            .map(|entry| entry.tokens.validate(token))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;

    #[test]
    fn test_hash_token() {
        let hash = TokenValidator::hash_token("test-token");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, TokenValidator::hash_token("test-token"));
        assert_ne!(hash, TokenValidator::hash_token("other-token"));
    }

    #[test]
    fn test_validate_token() {
        let validator = TokenValidator::new(vec![TokenValidator::hash_token("secret")]);
        assert!(validator.has_tokens());
        assert!(validator.validate("secret"));
        assert!(!validator.validate("Secret"));

        let empty = TokenValidator::new(Vec::<String>::new());
        assert!(!empty.has_tokens());
        assert!(!empty.validate(""));
    }

    #[test]
    fn test_guest_grants() {
        let grants = Grants::from_config(&AuthConfig::default());
        assert!(grants.check_capability(GUEST, Action::Read));
        assert!(grants.check_capability(GUEST, Action::Write));
        assert!(!grants.check_capability(GUEST, Action::Replication));
        assert!(grants.authenticate(GUEST, "anything"));
    }

    #[test]
    fn test_user_grants() {
        let config = AuthConfig {
            users: vec![UserConfig {
                name: "repl".to_string(),
                token_hash: TokenValidator::hash_token("pass").to_uppercase(),
                grants: vec![Action::Replication],
            }],
            ..Default::default()
        };
        let grants = Grants::from_config(&config);

        assert!(grants.authenticate("repl", "pass"));
        assert!(!grants.authenticate("repl", "wrong"));
        assert!(!grants.authenticate("nobody", "pass"));
        assert!(grants.check_capability("repl", Action::Replication));
        assert!(!grants.check_capability("repl", Action::Write));
        assert!(!grants.check_capability("nobody", Action::Read));
    }

    #[test]
    fn test_allow_all() {
        let grants = Grants::allow_all();
        assert!(grants.check_capability(GUEST, Action::Replication));
        assert_eq!(grants.user_count(), 0);
    }

    #[test]
    fn test_action_parse() {
        assert_eq!("Replication".parse::<Action>().unwrap(), Action::Replication);
        assert!("admin".parse::<Action>().is_err());
        assert_eq!(Action::Write.to_string(), "write");
    }
}
