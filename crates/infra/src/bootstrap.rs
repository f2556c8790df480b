//! Ensures a super-admin account exists and holds the `super_admin` role.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::{Instant, timeout_at};
use tracing::{info, instrument, warn};

use crm_auth::{PasswordCost, PasswordError, PolicyEngine, PolicyError, SUPER_ADMIN_ROLE, hash_password};
use crm_core::UserId;

use crate::config::SuperAdminConfig;
use crate::readiness::Readiness;
use crate::users::{AdminUser, UserStore, UserStoreError};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to look up admin user: {0}")]
    Lookup(#[source] UserStoreError),

    #[error("failed to hash admin password: {0}")]
    Password(#[from] PasswordError),

    #[error("failed to create admin user: {0}")]
    Insert(#[source] UserStoreError),

    #[error("failed to grant the super admin role: {0}")]
    Grant(#[source] PolicyError),

    #[error("failed to save policy: {0}")]
    Save(#[source] PolicyError),

    #[error("admin bootstrap exceeded its deadline while {0}")]
    Deadline(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOutcome {
    pub user_id: UserId,
    pub created_user: bool,
    pub granted_role: bool,
}

pub struct AdminBootstrapper {
    users: Arc<dyn UserStore>,
    engine: Arc<PolicyEngine>,
    admin: SuperAdminConfig,
    cost: PasswordCost,
}

impl AdminBootstrapper {
    pub fn new(
        users: Arc<dyn UserStore>,
        engine: Arc<PolicyEngine>,
        admin: SuperAdminConfig,
        cost: PasswordCost,
    ) -> Self {
        Self {
            users,
            engine,
            admin,
            cost,
        }
    }

    /// Idempotent: creates the user only if absent and grants the role
    /// only if missing, saving policy only when a grant was added.
    pub async fn run(&self) -> Result<BootstrapOutcome, BootstrapError> {
        self.run_until(None).await
    }

    /// [`run`](Self::run) bounded by `budget`. Every step observes the
    /// deadline; a grant that was not saved in time is dropped from memory.
    pub async fn run_within(&self, budget: Duration) -> Result<BootstrapOutcome, BootstrapError> {
        self.run_until(Some(Instant::now() + budget)).await
    }

    #[instrument(skip(self), fields(username = %self.admin.username), err)]
    async fn run_until(&self, deadline: Option<Instant>) -> Result<BootstrapOutcome, BootstrapError> {
        let (user_id, created_user) = within(deadline, "creating the user", self.ensure_user()).await?;
        let subject = user_id.to_string();

        let already_granted = self.engine.has_grouping_policy(&subject, SUPER_ADMIN_ROLE).await;
        let granted_role = if already_granted {
            false
        } else {
            self.grant(&subject, deadline).await?
        };

        info!(%user_id, created_user, granted_role, "super admin ensured");
        Ok(BootstrapOutcome {
            user_id,
            created_user,
            granted_role,
        })
    }

    async fn grant(&self, subject: &str, deadline: Option<Instant>) -> Result<bool, BootstrapError> {
        let engine = &self.engine;
        let result: Result<bool, BootstrapError> = async {
            let added = within(deadline, "granting the role", async {
                engine
                    .add_grouping_policy(subject, SUPER_ADMIN_ROLE)
                    .await
                    .map_err(BootstrapError::Grant)
            })
            .await?;
            if added {
                within(deadline, "saving policy", async {
                    engine.save_policy().await.map_err(BootstrapError::Save)
                })
                .await?;
            }
            Ok(added)
        }
        .await;

        if result.is_err() {
            // Keep memory in step with the store so the next run retries the grant.
            engine.discard_grouping_policy(subject, SUPER_ADMIN_ROLE).await;
        }
        result
    }

    async fn ensure_user(&self) -> Result<(UserId, bool), BootstrapError> {
        if let Some(existing) = self
            .users
            .find_by_username(&self.admin.username)
            .await
            .map_err(BootstrapError::Lookup)?
        {
            return Ok((existing.id, false));
        }

        let user = AdminUser {
            id: UserId::new(),
            username: self.admin.username.clone(),
            password_hash: hash_password(&self.admin.password, self.cost)?,
            email: self.admin.email.clone(),
            real_name: self.admin.real_name.clone(),
            active: true,
            created_at: Utc::now(),
        };
        let id = user.id;

        match self.users.insert(user).await {
            Ok(()) => Ok((id, true)),
            // Lost a race with a concurrent bootstrap; adopt the winner.
            Err(UserStoreError::Conflict(_)) => {
                let existing = self
                    .users
                    .find_by_username(&self.admin.username)
                    .await
                    .map_err(BootstrapError::Lookup)?;
                existing
                    .map(|u| (u.id, false))
                    .ok_or_else(|| BootstrapError::Insert(UserStoreError::Conflict(self.admin.username.clone())))
            }
            Err(err) => Err(BootstrapError::Insert(err)),
        }
    }
}

/// Run the bootstrapper within `budget`, recording the outcome in
/// `readiness`. Failures are logged, never propagated.
pub async fn bootstrap_admin(
    bootstrapper: &AdminBootstrapper,
    readiness: &Readiness,
    budget: Duration,
) -> Option<BootstrapOutcome> {
    let reason = match bootstrapper.run_within(budget).await {
        Ok(outcome) => {
            readiness.mark_admin_ready(outcome.user_id);
            return Some(outcome);
        }
        Err(err) => err.to_string(),
    };
    warn!(%reason, "admin bootstrap failed; continuing without a super admin");
    readiness.mark_admin_missing(reason);
    None
}

async fn within<T, F>(deadline: Option<Instant>, step: &'static str, fut: F) -> Result<T, BootstrapError>
where
    F: Future<Output = Result<T, BootstrapError>>,
{
    match deadline {
        Some(deadline) => timeout_at(deadline, fut)
            .await
            .map_err(|_| BootstrapError::Deadline(step))?,
        None => fut.await,
    }
}
