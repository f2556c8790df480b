use crate::catalog::CatalogRouter;

pub mod auth;
pub mod rbac;
pub mod system;

/// Routes under the API prefix; every one passes the authorization middleware.
pub fn api_routes() -> CatalogRouter {
    CatalogRouter::new()
        .post("/api/v1/auth/login", "auth::login", auth::login)
        .post("/api/v1/auth/refresh", "auth::refresh", auth::refresh)
        .get("/api/v1/auth/me", "auth::me", auth::me)
        .get("/api/v1/rbac/permissions", "rbac::list_permissions", rbac::list_permissions)
        .get("/api/v1/rbac/roles/:role/policies", "rbac::list_role_policies", rbac::list_role_policies)
        .post("/api/v1/rbac/roles/:role/policies", "rbac::add_role_policy", rbac::add_role_policy)
        .delete("/api/v1/rbac/roles/:role/policies", "rbac::remove_role_policy", rbac::remove_role_policy)
        .get("/api/v1/rbac/users/:id/roles", "rbac::list_user_roles", rbac::list_user_roles)
        .post("/api/v1/rbac/users/:id/roles", "rbac::assign_user_role", rbac::assign_user_role)
        .delete("/api/v1/rbac/users/:id/roles/:role", "rbac::revoke_user_role", rbac::revoke_user_role)
        .post("/api/v1/rbac/save", "rbac::save_policy", rbac::save_policy)
        .post("/api/v1/rbac/reload", "rbac::reload_policy", rbac::reload_policy)
}

/// Unauthenticated operational endpoints.
pub fn system_routes() -> CatalogRouter {
    CatalogRouter::new()
        .get("/healthz", "system::healthz", system::healthz)
        .get("/readyz", "system::readyz", system::readyz)
}
