use std::any::Any;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{info, instrument};

use super::{InitContext, Resource, ResourceError};
use crate::config::CacheConfig;

/// Redis connection. A disabled cache becomes ready without connecting.
pub struct CacheResource {
    config: CacheConfig,
    connection: Option<MultiplexedConnection>,
}

impl CacheResource {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            connection: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// A clone of the shared connection; `None` when disabled or not ready.
    pub fn connection(&self) -> Option<MultiplexedConnection> {
        self.connection.clone()
    }
}

#[async_trait]
impl Resource for CacheResource {
    fn name(&self) -> &'static str {
        "cache"
    }

    #[instrument(name = "cache.initialize", skip_all)]
    async fn initialize(&mut self, _ctx: &InitContext<'_>) -> Result<(), ResourceError> {
        if !self.config.enabled {
            info!("cache disabled; skipping connection");
            return Ok(());
        }

        let client =
            redis::Client::open(self.config.url.as_str()).map_err(|e| ResourceError::Connect(e.to_string()))?;
        let mut connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| ResourceError::Connect(e.to_string()))?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|e| ResourceError::Handshake(e.to_string()))?;
        if pong != "PONG" {
            return Err(ResourceError::Handshake(format!("unexpected PING reply `{pong}`")));
        }

        info!("cache connection established");
        self.connection = Some(connection);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ResourceError> {
        self.connection.take();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Registry, ServiceKey};

    #[tokio::test]
    async fn disabled_cache_is_ready_without_a_connection() {
        let mut registry = Registry::new();
        registry
            .register(
                ServiceKey::Cache,
                CacheResource::new(CacheConfig {
                    url: "redis://127.0.0.1:1".to_string(),
                    enabled: false,
                }),
            )
            .unwrap();
        registry.init_all(std::time::Duration::from_secs(1)).await.unwrap();

        let cache = registry.cache().unwrap();
        assert!(!cache.is_enabled());
        assert!(cache.connection().is_none());
    }
}
