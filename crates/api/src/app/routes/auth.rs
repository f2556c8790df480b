//! Login and token refresh.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crm_auth::verify_password;
use crm_core::UserId;

use crate::app::errors::{self, json_error};
use crate::app::state::AppState;
use crate::context::PrincipalContext;
use crate::middleware::extract_bearer;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub user_id: UserId,
    pub username: String,
}

/// POST /api/v1/auth/login
pub async fn login(Extension(state): Extension<AppState>, Json(body): Json<LoginRequest>) -> axum::response::Response {
    let user = match state.users.find_by_username(&body.username).await {
        Ok(Some(user)) => user,
        Ok(None) => return invalid_credentials(),
        Err(e) => return errors::user_store_error_to_response(e),
    };

    // Hash verification is CPU-bound.
    let hash = user.password_hash.clone();
    let password = body.password;
    match tokio::task::spawn_blocking(move || verify_password(&password, &hash)).await {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => return invalid_credentials(),
        Ok(Err(e)) => {
            warn!(username = %user.username, error = %e, "stored password hash is unusable");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "password_error", "password check failed");
        }
        Err(e) => {
            warn!(error = %e, "password verification task failed");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "password_error", "password check failed");
        }
    }

    if !user.active {
        return json_error(StatusCode::FORBIDDEN, "account_disabled", "account is disabled");
    }

    info!(user_id = %user.id, "user logged in");
    issue_token(&state, user.id, &user.username)
}

/// POST /api/v1/auth/refresh
///
/// Public route: the bearer token is checked here rather than by the
/// authorization middleware.
pub async fn refresh(Extension(state): Extension<AppState>, headers: HeaderMap) -> axum::response::Response {
    let token = match extract_bearer(&headers) {
        Ok(Some(token)) => token,
        Ok(None) => return json_error(StatusCode::UNAUTHORIZED, "auth_required", "authentication required"),
        Err(response) => return response,
    };

    let claims = match state.tokens.verify(token, Utc::now()) {
        Ok(claims) => claims,
        Err(e) => return errors::token_error_to_response(e),
    };

    match state.users.find_by_id(claims.sub).await {
        Ok(Some(user)) if user.active => issue_token(&state, user.id, &user.username),
        Ok(_) => json_error(StatusCode::UNAUTHORIZED, "invalid_token", "unknown or inactive user"),
        Err(e) => errors::user_store_error_to_response(e),
    }
}

/// GET /api/v1/auth/me
pub async fn me(
    Extension(state): Extension<AppState>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    let roles = state.engine.roles_for_user(&principal.user_id().to_string()).await;
    Json(serde_json::json!({
        "user_id": principal.user_id(),
        "username": principal.username(),
        "roles": roles,
    }))
    .into_response()
}

fn issue_token(state: &AppState, user_id: UserId, username: &str) -> axum::response::Response {
    let now = Utc::now();
    match state.tokens.issue(user_id, username, now) {
        Ok(access_token) => Json(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_at: now + state.tokens.ttl(),
            user_id,
            username: username.to_string(),
        })
        .into_response(),
        Err(e) => errors::token_error_to_response(e),
    }
}

fn invalid_credentials() -> axum::response::Response {
    json_error(StatusCode::UNAUTHORIZED, "invalid_credentials", "invalid username or password")
}
