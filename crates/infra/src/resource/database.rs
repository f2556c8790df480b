use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, instrument};

use super::{InitContext, Resource, ResourceError};
use crate::config::DatabaseConfig;
use crate::users::PostgresUserStore;

/// Postgres connection pool.
pub struct DatabaseResource {
    config: DatabaseConfig,
    pool: Option<PgPool>,
}

impl DatabaseResource {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config, pool: None }
    }

    /// The pool; `None` unless the resource is ready.
    pub fn pool(&self) -> Option<&PgPool> {
        self.pool.as_ref()
    }
}

#[async_trait]
impl Resource for DatabaseResource {
    fn name(&self) -> &'static str {
        "db"
    }

    #[instrument(name = "database.initialize", skip_all)]
    async fn initialize(&mut self, _ctx: &InitContext<'_>) -> Result<(), ResourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .connect(&self.config.url)
            .await
            .map_err(|e| ResourceError::Connect(e.to_string()))?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| ResourceError::Handshake(e.to_string()))?;

        PostgresUserStore::ensure_schema(&pool)
            .await
            .map_err(|e| ResourceError::Handshake(e.to_string()))?;

        info!("database pool established");
        self.pool = Some(pool);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ResourceError> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
