//! Authenticated principal for a table session.

use serde::{Deserialize, Serialize};

use crate::model::UserId;

/// The user behind a connection or request, as resolved by an
/// [`Identity`](crate::traits::Identity) provider.
///
/// Passed explicitly from the transport layer down to the hub and the
/// reconciler; never looked up from ambient request state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable user identifier.
    pub user_id: UserId,

    /// Name shown to other diners at the table.
    pub display_name: String,
}

impl Principal {
    /// Principal for `user_id` shown as `display_name`.
    #[must_use]
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
        }
    }

    /// Whether this principal contributes an entry to the roster.
    #[must_use]
    pub fn has_display_name(&self) -> bool {
        !self.display_name.trim().is_empty()
    }
}
