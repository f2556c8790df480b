//! Route identities: the public-route whitelist and catalogued route entries.

use serde::{Deserialize, Serialize};

/// A `(method, path)` pair exempt from authentication and from seeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicRoute {
    pub method: &'static str,
    pub path: &'static str,
}

pub const PUBLIC_ROUTES: [PublicRoute; 5] = [
    PublicRoute { method: "POST", path: "/api/v1/auth/login" },
    PublicRoute { method: "POST", path: "/api/v1/auth/register" },
    PublicRoute { method: "POST", path: "/api/v1/auth/refresh" },
    PublicRoute { method: "POST", path: "/api/v1/auth/forgot-password" },
    PublicRoute { method: "POST", path: "/api/v1/auth/reset-password" },
];

/// Case-exact method and byte-exact path comparison against the whitelist.
pub fn is_public_route(method: &str, path: &str) -> bool {
    PUBLIC_ROUTES
        .iter()
        .any(|r| r.method == method && r.path == path)
}

/// One registered HTTP route as reported by the route catalog.
///
/// The handler label is informational only; `(method, path)` identifies the
/// route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub method: String,
    pub path: String,
    pub handler: String,
}

impl RouteEntry {
    pub fn new(method: impl Into<String>, path: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            handler: handler.into(),
        }
    }

    pub fn is_public(&self) -> bool {
        is_public_route(&self.method, &self.path)
    }
}
