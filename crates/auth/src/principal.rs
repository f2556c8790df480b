use serde::{Deserialize, Serialize};

use crm_core::UserId;

/// An authenticated identity.
///
/// The policy subject of a principal is its user id; roles are attached
/// through grouping facts, never carried by the principal itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    pub username: String,
}

impl Principal {
    pub fn new(user_id: UserId, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }

    pub fn subject(&self) -> String {
        self.user_id.to_string()
    }
}
