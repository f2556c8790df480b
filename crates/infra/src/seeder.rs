//! Reflects the HTTP route catalog into the policy store.
//!
//! Every protected endpoint under the API prefix gets one
//! `p, _all_apis_, <path>, <METHOD>` tuple, which is the catalog of
//! assignable permissions. Public routes and routes outside the prefix are
//! never recorded.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crm_auth::{ALL_APIS_SUBJECT, PolicyEngine, PolicyError, RouteEntry, SUPER_ADMIN_ROLE};

use crate::config::Config;

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("failed to record {method} {path}: {source}")]
    Add {
        method: String,
        path: String,
        #[source]
        source: PolicyError,
    },

    #[error("failed to save seeded policy: {0}")]
    Save(#[source] PolicyError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    /// Entries in the catalog.
    pub discovered: usize,
    /// Entries outside the API prefix.
    pub outside_prefix: usize,
    /// Whitelisted entries.
    pub public: usize,
    /// Catalog tuples that already existed, duplicates included.
    pub already_present: usize,
    /// Catalog tuples added by this run.
    pub added: usize,
    /// Grants added for the configured role, if any.
    pub granted: usize,
    pub saved: bool,
}

impl SeedReport {
    pub fn is_up_to_date(&self) -> bool {
        self.added == 0 && self.granted == 0
    }
}

pub struct PolicySeeder {
    engine: Arc<PolicyEngine>,
    api_prefix: String,
    grant_role: Option<String>,
}

impl PolicySeeder {
    pub fn new(engine: Arc<PolicyEngine>, api_prefix: impl Into<String>) -> Self {
        Self {
            engine,
            api_prefix: api_prefix.into(),
            grant_role: None,
        }
    }

    /// The seeder the CLI runs: the configured prefix, plus the
    /// `super_admin` grant only when `auth.rbac.seed_grants_super_admin` is set.
    pub fn from_config(engine: Arc<PolicyEngine>, config: &Config) -> Self {
        let seeder = Self::new(engine, config.api.prefix.clone());
        if config.auth.rbac.seed_grants_super_admin {
            seeder.with_role_grant(SUPER_ADMIN_ROLE)
        } else {
            seeder
        }
    }

    /// Also grant `role` every endpoint that is catalogued.
    pub fn with_role_grant(mut self, role: impl Into<String>) -> Self {
        self.grant_role = Some(role.into());
        self
    }

    /// Add missing tuples for `routes`; saves only when something was added.
    #[instrument(skip(self, routes), fields(prefix = %self.api_prefix, routes = routes.len()), err)]
    pub async fn seed(&self, routes: &[RouteEntry]) -> Result<SeedReport, SeedError> {
        let mut report = SeedReport {
            discovered: routes.len(),
            ..SeedReport::default()
        };

        for route in routes {
            if !route.path.starts_with(&self.api_prefix) {
                report.outside_prefix += 1;
                continue;
            }
            if route.is_public() {
                debug!(method = %route.method, path = %route.path, "skipping public route");
                report.public += 1;
                continue;
            }

            if self.engine.has_policy(ALL_APIS_SUBJECT, &route.path, &route.method).await {
                report.already_present += 1;
            } else {
                self.add(ALL_APIS_SUBJECT, route).await?;
                report.added += 1;
            }

            if let Some(role) = &self.grant_role {
                if !self.engine.has_policy(role, &route.path, &route.method).await {
                    self.add(role, route).await?;
                    report.granted += 1;
                }
            }
        }

        if report.is_up_to_date() {
            info!(?report, "policy catalog is up to date");
            return Ok(report);
        }

        self.engine.save_policy().await.map_err(SeedError::Save)?;
        report.saved = true;
        info!(?report, "policy catalog seeded");
        Ok(report)
    }

    async fn add(&self, subject: &str, route: &RouteEntry) -> Result<(), SeedError> {
        self.engine
            .add_policy(subject, &route.path, &route.method)
            .await
            .map(|_| ())
            .map_err(|source| SeedError::Add {
                method: route.method.clone(),
                path: route.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use crm_auth::{InMemoryPolicyAdapter, PolicyRule};
    use proptest::prelude::*;

    use super::*;

    const PREFIX: &str = "/api/v1/";

    async fn seeder() -> (PolicySeeder, Arc<PolicyEngine>, InMemoryPolicyAdapter) {
        let adapter = InMemoryPolicyAdapter::new();
        let engine = Arc::new(PolicyEngine::new(adapter.clone()).await.unwrap());
        (PolicySeeder::new(engine.clone(), PREFIX), engine, adapter)
    }

    fn catalog() -> Vec<RouteEntry> {
        vec![
            RouteEntry::new("GET", "/api/v1/a", "list_a"),
            RouteEntry::new("POST", "/api/v1/b", "create_b"),
            RouteEntry::new("POST", "/api/v1/auth/login", "login"),
        ]
    }

    #[tokio::test]
    async fn seed_once_then_again() {
        let (seeder, _engine, adapter) = seeder().await;

        let first = seeder.seed(&catalog()).await.unwrap();
        assert_eq!(first.discovered, 3);
        assert_eq!(first.added, 2);
        assert_eq!(first.public, 1);
        assert!(first.saved);

        let stored: Vec<PolicyRule> = adapter.snapshot().policies.into_iter().collect();
        assert_eq!(
            stored,
            vec![
                PolicyRule::new(ALL_APIS_SUBJECT, "/api/v1/a", "GET"),
                PolicyRule::new(ALL_APIS_SUBJECT, "/api/v1/b", "POST"),
            ]
        );

        let second = seeder.seed(&catalog()).await.unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.already_present, 2);
        assert!(!second.saved);
        assert!(second.is_up_to_date());
        assert_eq!(adapter.save_count(), 1);
    }

    #[tokio::test]
    async fn routes_outside_the_prefix_are_ignored() {
        let (seeder, engine, adapter) = seeder().await;
        let report = seeder
            .seed(&[RouteEntry::new("GET", "/healthz", "healthz")])
            .await
            .unwrap();

        assert_eq!(report.outside_prefix, 1);
        assert!(report.is_up_to_date());
        assert!(engine.policies().await.is_empty());
        assert_eq!(adapter.save_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_entries_are_recorded_once() {
        let (seeder, engine, _adapter) = seeder().await;
        let routes = vec![
            RouteEntry::new("GET", "/api/v1/a", "first"),
            RouteEntry::new("GET", "/api/v1/a", "second"),
        ];
        let report = seeder.seed(&routes).await.unwrap();

        assert_eq!(report.added, 1);
        assert_eq!(report.already_present, 1);
        assert_eq!(engine.policies().await.len(), 1);
    }

    #[tokio::test]
    async fn method_comparison_is_case_exact() {
        let (seeder, _engine, _adapter) = seeder().await;
        // Lowercase methods are not whitelisted and are rejected as actions.
        let err = seeder
            .seed(&[RouteEntry::new("post", "/api/v1/auth/login", "login")])
            .await
            .unwrap_err();
        assert!(matches!(err, SeedError::Add { .. }));
    }

    #[tokio::test]
    async fn role_grant_covers_every_catalogued_endpoint() {
        let (seeder, engine, _adapter) = seeder().await;
        let seeder = seeder.with_role_grant(SUPER_ADMIN_ROLE);

        let report = seeder.seed(&catalog()).await.unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.granted, 2);
        assert!(engine.has_policy(SUPER_ADMIN_ROLE, "/api/v1/a", "GET").await);
        assert!(!engine.has_policy(SUPER_ADMIN_ROLE, "/api/v1/auth/login", "POST").await);

        let again = seeder.seed(&catalog()).await.unwrap();
        assert!(again.is_up_to_date());
    }

    #[tokio::test]
    async fn default_configuration_records_only_the_catalog() {
        let adapter = InMemoryPolicyAdapter::new();
        let engine = Arc::new(PolicyEngine::new(adapter.clone()).await.unwrap());
        let seeder = PolicySeeder::from_config(engine.clone(), &Config::default());

        let report = seeder.seed(&catalog()).await.unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.granted, 0);
        assert_eq!(adapter.snapshot().policies.len(), 2);
        assert!(
            adapter
                .snapshot()
                .policies
                .iter()
                .all(|rule| rule.subject == ALL_APIS_SUBJECT)
        );
    }

    #[tokio::test]
    async fn configured_role_grant_is_applied() {
        let mut config = Config::default();
        config.auth.rbac.seed_grants_super_admin = true;
        let (_, engine, _) = seeder().await;

        let report = PolicySeeder::from_config(engine.clone(), &config)
            .seed(&catalog())
            .await
            .unwrap();
        assert_eq!(report.granted, 2);
        assert!(engine.has_policy(SUPER_ADMIN_ROLE, "/api/v1/b", "POST").await);
    }

    fn route_strategy() -> impl Strategy<Value = RouteEntry> {
        let method = prop::sample::select(vec!["GET", "POST", "PUT", "DELETE"]);
        let path = prop::sample::select(vec![
            "/api/v1/customers",
            "/api/v1/customers/:id",
            "/api/v1/orders/{id}/items",
            "/api/v1/auth/login",
            "/api/v1/auth/refresh",
            "/healthz",
            "/readyz",
        ]);
        (method, path).prop_map(|(m, p)| RouteEntry::new(m, p, "handler"))
    }

    proptest! {
        #[test]
        fn seeding_is_idempotent_and_never_records_public_routes(routes in prop::collection::vec(route_strategy(), 0..24)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let (seeder, engine, _adapter) = seeder().await;
                seeder.seed(&routes).await.unwrap();
                let second = seeder.seed(&routes).await.unwrap();
                assert_eq!(second.added, 0);

                for rule in engine.policies().await {
                    assert!(!crm_auth::is_public_route(&rule.action, &rule.object));
                    assert!(rule.object.starts_with(PREFIX));
                }
            });
        }
    }
}
