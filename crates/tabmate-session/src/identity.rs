//! Static bearer-token identity provider.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tabmate_core::{Identity, IdentityError, Principal, UserId};

/// One configured token.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityEntry {
    pub token: String,
    pub user_id: UserId,
    pub display_name: String,
}

/// Resolves tokens from a fixed table loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    users: HashMap<String, Principal>,
}

impl StaticIdentity {
    /// Empty identity table; every credential is rejected.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `principal`.
    #[must_use]
    pub fn with_user(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.users.insert(token.into(), principal);
        self
    }

    /// Build from configured entries.
    #[must_use]
    pub fn from_entries(entries: impl IntoIterator<Item = IdentityEntry>) -> Self {
        entries.into_iter().fold(Self::new(), |identity, entry| {
            identity.with_user(entry.token, Principal::new(entry.user_id, entry.display_name))
        })
    }

    /// Parse a JSON array of `{token, user_id, display_name}` objects.
    ///
    /// # Errors
    /// Returns the JSON error if the document is malformed.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let entries: Vec<IdentityEntry> = serde_json::from_str(json)?;
        Ok(Self::from_entries(entries))
    }

    /// Number of known tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether no token is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl Identity for StaticIdentity {
    async fn authenticate(&self, credential: &str) -> Result<Principal, IdentityError> {
        let token = credential.trim_start();
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(IdentityError::MissingCredential);
        }
        self.users
            .get(token)
            .cloned()
            .ok_or(IdentityError::InvalidCredential)
    }
}
