//! The wired-up service runtime shared by the server and the seeder.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::{info, instrument};

use crm_auth::PolicyEngine;

use crate::config::Config;
use crate::resource::{
    CacheResource, DatabaseResource, MailerResource, PolicyResource, Registry, RegistryError, ResourceState,
    ServiceKey,
};
use crate::users::{PostgresUserStore, UserStore};

pub struct Runtime {
    config: Arc<Config>,
    registry: Registry,
}

impl Runtime {
    /// Database, Cache, Policy, Mailer, in that order.
    pub fn registry_for(config: &Config) -> Result<Registry, RegistryError> {
        let mut registry = Registry::new();
        registry.register(ServiceKey::Database, DatabaseResource::new(config.database.clone()))?;
        registry.register(ServiceKey::Cache, CacheResource::new(config.cache.clone()))?;
        registry.register(ServiceKey::Policy, PolicyResource::new(&config.auth.rbac))?;
        registry.register(ServiceKey::Mailer, MailerResource::new(config.email.clone()))?;
        Ok(registry)
    }

    /// Register and initialize every resource within `lifecycle.init_timeout_secs`.
    #[instrument(skip(config))]
    pub async fn start(config: Arc<Config>) -> Result<Self, RegistryError> {
        let registry = Self::registry_for(&config)?;
        Self::from_registry(config, registry).await
    }

    /// Initialize an already populated registry.
    pub async fn from_registry(config: Arc<Config>, mut registry: Registry) -> Result<Self, RegistryError> {
        registry.init_all(config.lifecycle.init_timeout()).await?;
        info!(services = registry.len(), "runtime started");
        Ok(Self { config, registry })
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn engine(&self) -> Result<Arc<PolicyEngine>, RegistryError> {
        self.registry
            .policy()?
            .engine()
            .ok_or_else(|| not_ready(ServiceKey::Policy))
    }

    pub fn pool(&self) -> Result<PgPool, RegistryError> {
        self.registry
            .database()?
            .pool()
            .cloned()
            .ok_or_else(|| not_ready(ServiceKey::Database))
    }

    pub fn user_store(&self) -> Result<Arc<dyn UserStore>, RegistryError> {
        Ok(Arc::new(PostgresUserStore::new(self.pool()?)))
    }

    /// Close every resource within `lifecycle.shutdown_timeout_secs`.
    #[instrument(skip(self))]
    pub async fn shutdown(mut self) -> Result<(), RegistryError> {
        let result = self.registry.close_all(self.config.lifecycle.shutdown_timeout()).await;
        info!(ok = result.is_ok(), "runtime stopped");
        result
    }
}

fn not_ready(key: ServiceKey) -> RegistryError {
    // A ready resource always holds its handle; reaching this means it was closed.
    RegistryError::NotReady {
        key,
        state: ResourceState::Closed,
    }
}
