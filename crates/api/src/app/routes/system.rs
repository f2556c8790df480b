use axum::{Json, extract::Extension, http::StatusCode, response::IntoResponse};

use crate::app::state::AppState;

/// Liveness: the process is up.
pub async fn healthz() -> axum::response::Response {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response()
}

/// Readiness: 503 while the service runs without a super admin.
pub async fn readyz(Extension(state): Extension<AppState>) -> axum::response::Response {
    let admin = state.readiness.admin_status();
    let status = if state.readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(serde_json::json!({ "admin": admin }))).into_response()
}
