//! Managed external resources and their lifecycle.
//!
//! Every long-lived handle the service needs (database pool, cache
//! connection, policy engine, mail session) is a [`Resource`] registered
//! under a [`ServiceKey`] in a [`Registry`]. The registry initializes them in
//! registration order, rolls back on failure and closes them in reverse.

use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crm_auth::{AdapterError, PolicyError};

pub mod cache;
pub mod database;
pub mod mailer;
pub mod policy;
pub mod registry;

pub use cache::CacheResource;
pub use database::DatabaseResource;
pub use mailer::MailerResource;
pub use policy::PolicyResource;
pub use registry::{CloseFailures, Registry, RegistryError};

/// Well-known registry keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceKey {
    Database,
    Cache,
    Policy,
    Mailer,
}

impl ServiceKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKey::Database => "db",
            ServiceKey::Cache => "cache",
            ServiceKey::Policy => "casbin",
            ServiceKey::Mailer => "email",
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a registered resource.
///
/// `Registered -> Initializing -> Ready -> Closing -> Closed`, with
/// `Failed` reachable from `Initializing` and `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Registered,
    Initializing,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Registered => "registered",
            ResourceState::Initializing => "initializing",
            ResourceState::Ready => "ready",
            ResourceState::Closing => "closing",
            ResourceState::Closed => "closed",
            ResourceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("`{resource}` requires `{dependency}`, which is not ready")]
    UnmetDependency {
        resource: ServiceKey,
        dependency: ServiceKey,
    },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,
}

/// A managed resource with an async init/close lifecycle.
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    /// Short name used in logs and health output.
    fn name(&self) -> &'static str;

    /// Keys that must be `Ready` before this resource initializes.
    fn dependencies(&self) -> &'static [ServiceKey] {
        &[]
    }

    /// Acquire the underlying handle. Only called while `Registered`.
    async fn initialize(&mut self, ctx: &InitContext<'_>) -> Result<(), ResourceError>;

    /// Release the underlying handle. The handle is dropped even on error.
    async fn close(&mut self) -> Result<(), ResourceError>;

    fn as_any(&self) -> &dyn Any;
}

pub(crate) struct Slot {
    pub(crate) key: ServiceKey,
    pub(crate) state: ResourceState,
    pub(crate) resource: Box<dyn Resource>,
}

/// Read access to the resources initialized before the current one.
pub struct InitContext<'a> {
    current: ServiceKey,
    earlier: &'a [Slot],
}

impl<'a> InitContext<'a> {
    pub(crate) fn new(current: ServiceKey, earlier: &'a [Slot]) -> Self {
        Self { current, earlier }
    }

    /// The key being initialized.
    pub fn current(&self) -> ServiceKey {
        self.current
    }

    /// A `Ready` dependency of concrete type `R`.
    pub fn dependency<R: Resource>(&self, key: ServiceKey) -> Result<&'a R, ResourceError> {
        let unmet = ResourceError::UnmetDependency {
            resource: self.current,
            dependency: key,
        };
        let slot = self
            .earlier
            .iter()
            .find(|slot| slot.key == key && slot.state == ResourceState::Ready);
        match slot {
            Some(slot) => slot.resource.as_any().downcast_ref::<R>().ok_or(unmet),
            None => Err(unmet),
        }
    }

    pub fn database(&self) -> Result<&'a DatabaseResource, ResourceError> {
        self.dependency(ServiceKey::Database)
    }
}
