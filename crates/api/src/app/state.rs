use std::sync::Arc;

use crm_auth::{PolicyEngine, TokenService};
use crm_infra::{Readiness, UserStore};

/// Shared handles injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PolicyEngine>,
    pub users: Arc<dyn UserStore>,
    pub tokens: Arc<TokenService>,
    pub readiness: Arc<Readiness>,
}
