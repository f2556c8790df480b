use crm_auth::Principal;
use crm_core::UserId;

/// Principal context for a request (authenticated identity).
///
/// Present on protected routes after the authorization middleware allowed
/// the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalContext {
    principal: Principal,
}

impl PrincipalContext {
    pub fn new(principal: Principal) -> Self {
        Self { principal }
    }

    pub fn user_id(&self) -> UserId {
        self.principal.user_id
    }

    pub fn username(&self) -> &str {
        &self.principal.username
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }
}
