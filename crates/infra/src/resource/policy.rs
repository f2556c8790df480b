use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use crm_auth::{InMemoryPolicyAdapter, PolicyEngine};

use super::{InitContext, Resource, ResourceError, ServiceKey};
use crate::config::RbacConfig;
use crate::policy_store::PostgresPolicyAdapter;

enum AdapterSource {
    /// Rows in `table` on the registry's database pool.
    Postgres { table: String },
    Memory(InMemoryPolicyAdapter),
}

/// The policy engine, loaded from its adapter at init.
pub struct PolicyResource {
    source: AdapterSource,
    auto_save: bool,
    engine: Option<Arc<PolicyEngine>>,
}

impl PolicyResource {
    /// Persist policy in the database registered under [`ServiceKey::Database`].
    pub fn new(config: &RbacConfig) -> Self {
        Self {
            source: AdapterSource::Postgres {
                table: config.table_name.clone(),
            },
            auto_save: config.auto_save,
            engine: None,
        }
    }

    /// Persist policy in `adapter`; no registry dependencies.
    pub fn with_adapter(adapter: InMemoryPolicyAdapter, auto_save: bool) -> Self {
        Self {
            source: AdapterSource::Memory(adapter),
            auto_save,
            engine: None,
        }
    }

    /// The shared engine; `None` unless the resource is ready.
    pub fn engine(&self) -> Option<Arc<PolicyEngine>> {
        self.engine.clone()
    }
}

#[async_trait]
impl Resource for PolicyResource {
    fn name(&self) -> &'static str {
        "casbin"
    }

    fn dependencies(&self) -> &'static [ServiceKey] {
        match self.source {
            AdapterSource::Postgres { .. } => &[ServiceKey::Database],
            AdapterSource::Memory(_) => &[],
        }
    }

    #[instrument(name = "policy.initialize", skip_all)]
    async fn initialize(&mut self, ctx: &InitContext<'_>) -> Result<(), ResourceError> {
        let engine = match &self.source {
            AdapterSource::Postgres { table } => {
                let pool = ctx
                    .database()?
                    .pool()
                    .cloned()
                    .ok_or(ResourceError::UnmetDependency {
                        resource: ctx.current(),
                        dependency: ServiceKey::Database,
                    })?;
                let adapter = PostgresPolicyAdapter::new(pool, table)?;
                adapter.ensure_table().await?;
                PolicyEngine::new(adapter).await?
            }
            AdapterSource::Memory(adapter) => PolicyEngine::new(adapter.clone()).await?,
        };

        let engine = engine.with_auto_save(self.auto_save);
        let policies = engine.policies().await.len();
        let groupings = engine.grouping_policies().await.len();
        info!(
            policies,
            groupings,
            auto_save = engine.auto_save(),
            "policy engine ready"
        );
        self.engine = Some(Arc::new(engine));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ResourceError> {
        self.engine.take();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
