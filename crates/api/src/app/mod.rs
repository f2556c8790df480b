//! HTTP API application wiring (Axum router + shared state).
//!
//! - `state.rs`: handles shared by every handler
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `errors.rs`: consistent error responses

use axum::{Extension, Router};
use tower::ServiceBuilder;

use crm_auth::RouteEntry;

use crate::middleware;

pub mod errors;
pub mod routes;
pub mod state;

pub use state::AppState;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(state: AppState) -> Router {
    let (system, _) = routes::system_routes().into_parts();
    let (api, _) = routes::api_routes().into_parts();

    // Route layer: runs after matching, so the middleware sees the route template.
    let api = api.route_layer(axum::middleware::from_fn_with_state(
        state.clone(),
        middleware::authorize_request,
    ));

    Router::new()
        .merge(system)
        .merge(api)
        .layer(ServiceBuilder::new().layer(Extension(state)))
}

/// Every route the server registers, without binding a listener.
pub fn route_catalog() -> Vec<RouteEntry> {
    let (_, mut entries) = routes::system_routes().into_parts();
    let (_, api) = routes::api_routes().into_parts();
    entries.extend(api);
    entries
}

#[cfg(test)]
mod tests {
    use crm_auth::is_public_route;

    use super::*;

    #[test]
    fn catalog_lists_system_api_and_public_routes() {
        let catalog = route_catalog();

        assert!(catalog.iter().any(|r| r.method == "GET" && r.path == "/healthz"));
        assert!(catalog.iter().any(|r| r.method == "POST" && r.path == "/api/v1/auth/login"));
        assert!(
            catalog
                .iter()
                .any(|r| r.method == "DELETE" && r.path == "/api/v1/rbac/users/:id/roles/:role")
        );

        let public: Vec<_> = catalog.iter().filter(|r| is_public_route(&r.method, &r.path)).collect();
        assert_eq!(public.len(), 2);
    }

    #[test]
    fn catalog_has_no_duplicate_routes() {
        let catalog = route_catalog();
        let mut keys: Vec<_> = catalog.iter().map(|r| (r.method.as_str(), r.path.as_str())).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), catalog.len());
    }
}
