//! Request-time authorization decision.
//!
//! - No IO
//! - No panics
//! - Never raises: every failure collapses into a `Decision`

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::engine::{EnforceError, PolicyEngine};
use crate::policy::ALL_APIS_SUBJECT;
use crate::routes::is_public_route;
use crate::Principal;

/// Read-only view of a policy engine used to authorize requests.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn enforce(&self, sub: &str, obj: &str, act: &str) -> Result<bool, EnforceError>;
}

#[async_trait]
impl PolicyEvaluator for PolicyEngine {
    async fn enforce(&self, sub: &str, obj: &str, act: &str) -> Result<bool, EnforceError> {
        PolicyEngine::enforce(self, sub, obj, act).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    /// No principal on a protected route (401).
    AuthRequired,
    /// A principal whose roles grant nothing matching (403).
    Forbidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenialKind),
    /// Public route; the engine was not consulted.
    Anonymous,
}

impl Decision {
    pub fn is_permitted(&self) -> bool {
        matches!(self, Decision::Allow | Decision::Anonymous)
    }
}

/// Decide whether `principal` may call `method path`.
///
/// `path` is the route template the request matched (policies are written
/// against templates). Role inheritance is resolved by the engine; an
/// evaluation error counts as a denial.
pub async fn authorize<E>(engine: &E, principal: Option<&Principal>, method: &str, path: &str) -> Decision
where
    E: PolicyEvaluator + ?Sized,
{
    if is_public_route(method, path) {
        return Decision::Anonymous;
    }

    let Some(principal) = principal else {
        return Decision::Deny(DenialKind::AuthRequired);
    };

    let subject = principal.subject();
    if subject == ALL_APIS_SUBJECT {
        return Decision::Deny(DenialKind::Forbidden);
    }

    match engine.enforce(&subject, path, method).await {
        Ok(true) => Decision::Allow,
        Ok(false) => Decision::Deny(DenialKind::Forbidden),
        Err(e) => {
            warn!(user = %subject, method, path, error = %e, "policy evaluation failed; treating as deny");
            Decision::Deny(DenialKind::Forbidden)
        }
    }
}
