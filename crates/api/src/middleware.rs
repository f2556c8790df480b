use axum::{
    extract::{MatchedPath, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::{debug, warn};

use crm_auth::{Decision, DenialKind, Principal, authorize, is_public_route};

use crate::app::errors::json_error;
use crate::app::state::AppState;
use crate::context::PrincipalContext;

/// Authorize the request against the policy engine.
///
/// Runs as a route layer so the matched route template, not the concrete
/// URI, is what policies are checked against.
pub async fn authorize_request(
    State(state): State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let method = req.method().as_str().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    // Whitelisted routes bypass authentication and the engine entirely.
    if is_public_route(&method, &path) {
        return next.run(req).await;
    }

    let principal = match resolve_principal(&state, req.headers()).await {
        Ok(principal) => principal,
        Err(response) => return response,
    };

    match authorize(state.engine.as_ref(), principal.as_ref(), &method, &path).await {
        Decision::Allow | Decision::Anonymous => {
            if let Some(principal) = principal {
                req.extensions_mut().insert(PrincipalContext::new(principal));
            }
            next.run(req).await
        }
        Decision::Deny(DenialKind::AuthRequired) => {
            json_error(StatusCode::UNAUTHORIZED, "auth_required", "authentication required")
        }
        Decision::Deny(DenialKind::Forbidden) => {
            debug!(%method, %path, "request forbidden");
            json_error(StatusCode::FORBIDDEN, "forbidden", format!("not allowed to {method} {path}"))
        }
    }
}

/// No header yields `None`; a header that does not name an active user is rejected.
async fn resolve_principal(state: &AppState, headers: &HeaderMap) -> Result<Option<Principal>, Response> {
    let Some(token) = extract_bearer(headers)? else {
        return Ok(None);
    };

    let claims = state
        .tokens
        .verify(token, Utc::now())
        .map_err(|e| json_error(StatusCode::UNAUTHORIZED, "invalid_token", e.to_string()))?;

    let user = state.users.find_by_id(claims.sub).await.map_err(|e| {
        warn!(error = %e, "user lookup failed during authorization");
        json_error(StatusCode::SERVICE_UNAVAILABLE, "store_error", "user store unavailable")
    })?;

    match user {
        Some(user) if user.active => Ok(Some(Principal::new(user.id, user.username))),
        _ => Err(json_error(StatusCode::UNAUTHORIZED, "invalid_token", "unknown or inactive user")),
    }
}

pub(crate) fn extract_bearer(headers: &HeaderMap) -> Result<Option<&str>, Response> {
    let Some(header) = headers.get(axum::http::header::AUTHORIZATION) else {
        return Ok(None);
    };

    let invalid = || json_error(StatusCode::UNAUTHORIZED, "invalid_token", "malformed Authorization header");

    let header = header.to_str().map_err(|_| invalid())?;
    let token = header.strip_prefix("Bearer ").ok_or_else(invalid)?.trim();
    if token.is_empty() {
        return Err(invalid());
    }

    Ok(Some(token))
}
