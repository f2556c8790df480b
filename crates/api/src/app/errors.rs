use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use crm_auth::{PolicyError, TokenError};
use crm_infra::UserStoreError;

pub fn policy_error_to_response(err: PolicyError) -> axum::response::Response {
    match err {
        PolicyError::ReservedSubject(name) => json_error(
            StatusCode::BAD_REQUEST,
            "reserved_subject",
            format!("`{name}` is reserved and cannot be granted"),
        ),
        PolicyError::InvalidRule(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_rule", msg),
        PolicyError::PersistFailed(e) => json_error(StatusCode::SERVICE_UNAVAILABLE, "persist_failed", e.to_string()),
        PolicyError::LoadFailed(e) => json_error(StatusCode::SERVICE_UNAVAILABLE, "load_failed", e.to_string()),
        PolicyError::Model(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "model_error", e.to_string()),
    }
}

pub fn user_store_error_to_response(err: UserStoreError) -> axum::response::Response {
    match err {
        UserStoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        UserStoreError::Storage(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "store_error", msg),
    }
}

pub fn token_error_to_response(err: TokenError) -> axum::response::Response {
    match err {
        TokenError::Sign(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "token_error", e.to_string()),
        TokenError::Invalid(_) | TokenError::Claims(_) => {
            json_error(StatusCode::UNAUTHORIZED, "invalid_token", err.to_string())
        }
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
