//! Service readiness as reported by `/readyz`.

use std::sync::RwLock;

use serde::Serialize;

use crm_core::UserId;

/// Outcome of the admin bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdminStatus {
    #[default]
    Pending,
    Ready {
        user_id: UserId,
    },
    Missing {
        reason: String,
    },
}

#[derive(Debug, Default)]
pub struct Readiness {
    admin: RwLock<AdminStatus>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admin_status(&self) -> AdminStatus {
        self.admin
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn mark_admin_ready(&self, user_id: UserId) {
        self.set(AdminStatus::Ready { user_id });
    }

    pub fn mark_admin_missing(&self, reason: impl Into<String>) {
        self.set(AdminStatus::Missing { reason: reason.into() });
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.admin_status(), AdminStatus::Ready { .. })
    }

    fn set(&self, status: AdminStatus) {
        *self.admin.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }
}
