//! RBAC administration endpoints.
//!
//! Roles are granted catalogued endpoints (the `_all_apis_` tuples written
//! by the policy seeder) and users are granted roles. Mutations only touch
//! the in-memory engine unless `auth.rbac.auto_save` is set, in which case
//! each one is written through to the store; `POST /save` persists
//! explicitly and `POST /reload` discards unsaved changes.

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crm_auth::{ALL_APIS_SUBJECT, PolicyRule};
use crm_core::UserId;

use crate::app::errors::{self, json_error};
use crate::app::state::AppState;

// ─────────────────────────────────────────────────────────────────────────────
// Request / response bodies
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub path: String,
    pub method: String,
}

impl From<PolicyRule> for Endpoint {
    fn from(rule: PolicyRule) -> Self {
        Self {
            path: rule.object,
            method: rule.action,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RoleGrant {
    pub role: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/v1/rbac/permissions - every assignable endpoint
pub async fn list_permissions(Extension(state): Extension<AppState>) -> axum::response::Response {
    let permissions: Vec<Endpoint> = state
        .engine
        .policies_for_subject(ALL_APIS_SUBJECT)
        .await
        .into_iter()
        .map(Endpoint::from)
        .collect();
    Json(serde_json::json!({ "permissions": permissions })).into_response()
}

/// GET /api/v1/rbac/roles/:role/policies
pub async fn list_role_policies(
    Extension(state): Extension<AppState>,
    Path(role): Path<String>,
) -> axum::response::Response {
    let policies: Vec<Endpoint> = state
        .engine
        .policies_for_subject(&role)
        .await
        .into_iter()
        .map(Endpoint::from)
        .collect();
    Json(serde_json::json!({ "role": role, "policies": policies })).into_response()
}

/// POST /api/v1/rbac/roles/:role/policies - grant a catalogued endpoint to a role
pub async fn add_role_policy(
    Extension(state): Extension<AppState>,
    Path(role): Path<String>,
    Json(endpoint): Json<Endpoint>,
) -> axum::response::Response {
    if role == ALL_APIS_SUBJECT {
        return reserved_role();
    }
    if !state
        .engine
        .has_policy(ALL_APIS_SUBJECT, &endpoint.path, &endpoint.method)
        .await
    {
        return json_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "unknown_endpoint",
            format!("{} {} is not a catalogued endpoint", endpoint.method, endpoint.path),
        );
    }

    let added = match state.engine.add_policy(&role, &endpoint.path, &endpoint.method).await {
        Ok(added) => added,
        Err(e) => return errors::policy_error_to_response(e),
    };
    if added {
        info!(%role, path = %endpoint.path, method = %endpoint.method, "endpoint granted to role");
    }

    let status = if added { StatusCode::CREATED } else { StatusCode::OK };
    (
        status,
        Json(serde_json::json!({ "role": role, "policy": endpoint, "added": added })),
    )
        .into_response()
}

/// DELETE /api/v1/rbac/roles/:role/policies
pub async fn remove_role_policy(
    Extension(state): Extension<AppState>,
    Path(role): Path<String>,
    Json(endpoint): Json<Endpoint>,
) -> axum::response::Response {
    if role == ALL_APIS_SUBJECT {
        return reserved_role();
    }
    match state.engine.remove_policy(&role, &endpoint.path, &endpoint.method).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "not_found", "role does not hold that endpoint"),
        Err(e) => errors::policy_error_to_response(e),
    }
}

/// GET /api/v1/rbac/users/:id/roles - effective (transitive) roles
pub async fn list_user_roles(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let user_id = match parse_user_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let roles = state.engine.roles_for_user(&user_id.to_string()).await;
    Json(serde_json::json!({ "user_id": user_id, "roles": roles })).into_response()
}

/// POST /api/v1/rbac/users/:id/roles
pub async fn assign_user_role(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Json(grant): Json<RoleGrant>,
) -> axum::response::Response {
    let user_id = match parse_user_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.users.find_by_id(user_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "not_found", "user not found"),
        Err(e) => return errors::user_store_error_to_response(e),
    }

    let added = match state
        .engine
        .add_grouping_policy(&user_id.to_string(), &grant.role)
        .await
    {
        Ok(added) => added,
        Err(e) => return errors::policy_error_to_response(e),
    };
    if added {
        info!(%user_id, role = %grant.role, "role granted to user");
    }

    let status = if added { StatusCode::CREATED } else { StatusCode::OK };
    (
        status,
        Json(serde_json::json!({ "user_id": user_id, "role": grant.role, "added": added })),
    )
        .into_response()
}

/// DELETE /api/v1/rbac/users/:id/roles/:role
pub async fn revoke_user_role(
    Extension(state): Extension<AppState>,
    Path((id, role)): Path<(String, String)>,
) -> axum::response::Response {
    let user_id = match parse_user_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.engine.remove_grouping_policy(&user_id.to_string(), &role).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "not_found", "user does not hold that role"),
        Err(e) => errors::policy_error_to_response(e),
    }
}

/// POST /api/v1/rbac/save
pub async fn save_policy(Extension(state): Extension<AppState>) -> axum::response::Response {
    match state.engine.save_policy().await {
        Ok(()) => Json(serde_json::json!({ "saved": true })).into_response(),
        Err(e) => errors::policy_error_to_response(e),
    }
}

/// POST /api/v1/rbac/reload - discard unsaved changes
pub async fn reload_policy(Extension(state): Extension<AppState>) -> axum::response::Response {
    match state.engine.load_policy().await {
        Ok(()) => Json(serde_json::json!({
            "policies": state.engine.policies().await.len(),
            "groupings": state.engine.grouping_policies().await.len(),
        }))
        .into_response(),
        Err(e) => errors::policy_error_to_response(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn parse_user_id(raw: &str) -> Result<UserId, axum::response::Response> {
    raw.parse::<UserId>()
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}

fn reserved_role() -> axum::response::Response {
    json_error(
        StatusCode::BAD_REQUEST,
        "reserved_subject",
        format!("`{ALL_APIS_SUBJECT}` is reserved and cannot be modified"),
    )
}
