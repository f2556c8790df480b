//! Route registration that also records a catalog of every route.
//!
//! The same registration code builds the served router and, without binding
//! a listener, the `(method, path, handler)` list the policy seeder walks.

use axum::Router;
use axum::handler::Handler;
use axum::routing::{MethodFilter, on};

use crm_auth::RouteEntry;

#[derive(Default)]
pub struct CatalogRouter {
    router: Router,
    entries: Vec<RouteEntry>,
}

impl CatalogRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<H, T>(self, path: &str, label: &str, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.on("GET", MethodFilter::GET, path, label, handler)
    }

    pub fn post<H, T>(self, path: &str, label: &str, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.on("POST", MethodFilter::POST, path, label, handler)
    }

    pub fn put<H, T>(self, path: &str, label: &str, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.on("PUT", MethodFilter::PUT, path, label, handler)
    }

    pub fn delete<H, T>(self, path: &str, label: &str, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.on("DELETE", MethodFilter::DELETE, path, label, handler)
    }

    fn on<H, T>(mut self, method: &str, filter: MethodFilter, path: &str, label: &str, handler: H) -> Self
    where
        H: Handler<T, ()>,
        T: 'static,
    {
        self.router = self.router.route(path, on(filter, handler));
        self.entries.push(RouteEntry::new(method, path, label));
        self
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    pub fn into_parts(self) -> (Router, Vec<RouteEntry>) {
        (self.router, self.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop() {}

    #[test]
    fn records_every_registration_in_order() {
        let catalog = CatalogRouter::new()
            .get("/api/v1/things", "things::list", noop)
            .post("/api/v1/things", "things::create", noop)
            .delete("/api/v1/things/:id", "things::delete", noop);

        assert_eq!(
            catalog.entries(),
            &[
                RouteEntry::new("GET", "/api/v1/things", "things::list"),
                RouteEntry::new("POST", "/api/v1/things", "things::create"),
                RouteEntry::new("DELETE", "/api/v1/things/:id", "things::delete"),
            ]
        );
    }
}
