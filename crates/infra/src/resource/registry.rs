use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{error, info, instrument, warn};

use super::{
    CacheResource, DatabaseResource, InitContext, MailerResource, PolicyResource, Resource, ResourceError,
    ResourceState, ServiceKey, Slot,
};

/// Upper bound for each best-effort close performed during init rollback.
const ROLLBACK_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service `{0}` is already registered")]
    DuplicateKey(ServiceKey),

    #[error("service `{0}` is not registered")]
    NotFound(ServiceKey),

    #[error("service `{key}` is not ready ({state})")]
    NotReady { key: ServiceKey, state: ResourceState },

    #[error("service `{0}` is registered with a different type")]
    TypeMismatch(ServiceKey),

    #[error("`{resource}` requires `{dependency}`, which is not ready")]
    UnmetDependency {
        resource: ServiceKey,
        dependency: ServiceKey,
    },

    #[error("initialization deadline exceeded{}", pending_suffix(.pending))]
    InitTimeout { pending: Option<ServiceKey> },

    #[error("failed to initialize `{key}`: {source}")]
    Init {
        key: ServiceKey,
        #[source]
        source: ResourceError,
    },

    #[error(transparent)]
    Close(CloseFailures),
}

fn pending_suffix(pending: &Option<ServiceKey>) -> String {
    match pending {
        Some(key) => format!(" while initializing `{key}`"),
        None => String::new(),
    }
}

/// Every close error from one `close_all`, in close order.
#[derive(Debug)]
pub struct CloseFailures(pub Vec<(ServiceKey, ResourceError)>);

impl CloseFailures {
    pub fn keys(&self) -> Vec<ServiceKey> {
        self.0.iter().map(|(key, _)| *key).collect()
    }
}

impl fmt::Display for CloseFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to close {} service(s)", self.0.len())?;
        for (i, (key, err)) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{key}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseFailures {}

/// Ordered set of managed resources, keyed by [`ServiceKey`].
#[derive(Default)]
pub struct Registry {
    slots: Vec<Slot>,
    index: HashMap<ServiceKey, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `resource` under `key`. Registration order is init order.
    pub fn register<R: Resource>(&mut self, key: ServiceKey, resource: R) -> Result<(), RegistryError> {
        if self.index.contains_key(&key) {
            return Err(RegistryError::DuplicateKey(key));
        }
        self.index.insert(key, self.slots.len());
        self.slots.push(Slot {
            key,
            state: ResourceState::Registered,
            resource: Box::new(resource),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Keys in registration order.
    pub fn keys(&self) -> Vec<ServiceKey> {
        self.slots.iter().map(|slot| slot.key).collect()
    }

    pub fn state(&self, key: ServiceKey) -> Option<ResourceState> {
        self.index.get(&key).map(|&i| self.slots[i].state)
    }

    /// The registered resource's own name, whatever its state.
    pub fn name(&self, key: ServiceKey) -> Option<&'static str> {
        self.index.get(&key).map(|&i| self.slots[i].resource.name())
    }

    /// A `Ready` resource; anything else fails fast.
    pub fn get(&self, key: ServiceKey) -> Result<&dyn Resource, RegistryError> {
        let slot = self
            .index
            .get(&key)
            .map(|&i| &self.slots[i])
            .ok_or(RegistryError::NotFound(key))?;
        if slot.state != ResourceState::Ready {
            return Err(RegistryError::NotReady { key, state: slot.state });
        }
        Ok(slot.resource.as_ref())
    }

    pub fn get_as<R: Resource>(&self, key: ServiceKey) -> Result<&R, RegistryError> {
        self.get(key)?
            .as_any()
            .downcast_ref::<R>()
            .ok_or(RegistryError::TypeMismatch(key))
    }

    pub fn database(&self) -> Result<&DatabaseResource, RegistryError> {
        self.get_as(ServiceKey::Database)
    }

    pub fn cache(&self) -> Result<&CacheResource, RegistryError> {
        self.get_as(ServiceKey::Cache)
    }

    pub fn policy(&self) -> Result<&PolicyResource, RegistryError> {
        self.get_as(ServiceKey::Policy)
    }

    pub fn mailer(&self) -> Result<&MailerResource, RegistryError> {
        self.get_as(ServiceKey::Mailer)
    }

    /// Initialize every resource in registration order within `budget`.
    ///
    /// On the first failure every resource initialized so far is closed in
    /// reverse order and the original error is returned. Afterwards each
    /// resource is either `Ready` (success) or `Registered`/`Closed`.
    #[instrument(skip(self), fields(services = self.slots.len()))]
    pub async fn init_all(&mut self, budget: Duration) -> Result<(), RegistryError> {
        if budget.is_zero() {
            return Err(RegistryError::InitTimeout {
                pending: self.first_pending(),
            });
        }

        let deadline = Instant::now() + budget;
        for index in 0..self.slots.len() {
            if self.slots[index].state == ResourceState::Ready {
                continue;
            }
            if let Err(err) = self.initialize_slot(index, deadline).await {
                self.rollback(index, &err).await;
                return Err(err);
            }
        }

        info!("all services ready");
        Ok(())
    }

    async fn initialize_slot(&mut self, index: usize, deadline: Instant) -> Result<(), RegistryError> {
        let (earlier, rest) = self.slots.split_at_mut(index);
        let slot = &mut rest[0];
        let key = slot.key;
        let name = slot.resource.name();

        for &dependency in slot.resource.dependencies() {
            let ready = earlier
                .iter()
                .any(|s| s.key == dependency && s.state == ResourceState::Ready);
            if !ready {
                slot.state = ResourceState::Failed;
                return Err(RegistryError::UnmetDependency {
                    resource: key,
                    dependency,
                });
            }
        }

        slot.state = ResourceState::Initializing;
        info!(service = %key, resource = name, "initializing service");

        let ctx = InitContext::new(key, earlier);
        match timeout_at(deadline, slot.resource.initialize(&ctx)).await {
            Ok(Ok(())) => {
                slot.state = ResourceState::Ready;
                info!(service = %key, resource = name, "service ready");
                Ok(())
            }
            Ok(Err(ResourceError::UnmetDependency { resource, dependency })) => {
                slot.state = ResourceState::Failed;
                Err(RegistryError::UnmetDependency { resource, dependency })
            }
            Ok(Err(source)) => {
                slot.state = ResourceState::Failed;
                error!(service = %key, resource = name, error = %source, "service failed to initialize");
                Err(RegistryError::Init { key, source })
            }
            Err(_) => {
                slot.state = ResourceState::Failed;
                error!(service = %key, resource = name, "service initialization exceeded the deadline");
                Err(RegistryError::InitTimeout { pending: Some(key) })
            }
        }
    }

    async fn rollback(&mut self, failed: usize, cause: &RegistryError) {
        warn!(error = %cause, "rolling back initialized services");

        // A timed-out initialize may have left a partial handle behind.
        if matches!(cause, RegistryError::InitTimeout { .. }) {
            let slot = &mut self.slots[failed];
            if let Err(err) = close_with_timeout(slot.resource.as_mut(), ROLLBACK_CLOSE_TIMEOUT).await {
                warn!(service = %slot.key, error = %err, "close after timed-out init failed");
            }
        }
        self.slots[failed].state = ResourceState::Closed;

        for slot in self.slots[..failed].iter_mut().rev() {
            if slot.state != ResourceState::Ready {
                continue;
            }
            slot.state = ResourceState::Closing;
            if let Err(err) = close_with_timeout(slot.resource.as_mut(), ROLLBACK_CLOSE_TIMEOUT).await {
                warn!(service = %slot.key, error = %err, "rollback close failed");
            }
            slot.state = ResourceState::Closed;
        }
    }

    /// Close every `Ready` resource in reverse registration order.
    ///
    /// Every close is attempted; failures are collected into
    /// [`RegistryError::Close`].
    #[instrument(skip(self), fields(services = self.slots.len()))]
    pub async fn close_all(&mut self, budget: Duration) -> Result<(), RegistryError> {
        let deadline = Instant::now() + budget;
        let mut failures = Vec::new();

        for slot in self.slots.iter_mut().rev() {
            if slot.state != ResourceState::Ready {
                continue;
            }
            slot.state = ResourceState::Closing;
            let outcome = match timeout_at(deadline, slot.resource.close()).await {
                Ok(result) => result,
                Err(_) => Err(ResourceError::Timeout),
            };
            match outcome {
                Ok(()) => {
                    slot.state = ResourceState::Closed;
                    info!(service = %slot.key, resource = slot.resource.name(), "service closed");
                }
                Err(err) => {
                    slot.state = ResourceState::Failed;
                    error!(service = %slot.key, resource = slot.resource.name(), error = %err, "service failed to close");
                    failures.push((slot.key, err));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Close(CloseFailures(failures)))
        }
    }

    fn first_pending(&self) -> Option<ServiceKey> {
        self.slots
            .iter()
            .find(|slot| slot.state != ResourceState::Ready)
            .map(|slot| slot.key)
    }
}

async fn close_with_timeout(resource: &mut dyn Resource, limit: Duration) -> Result<(), ResourceError> {
    match timeout(limit, resource.close()).await {
        Ok(result) => result,
        Err(_) => Err(ResourceError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;

    type Journal = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy)]
    enum Behavior {
        Ok,
        FailInit,
        FailClose,
        Hang,
    }

    struct Scripted {
        label: &'static str,
        behavior: Behavior,
        deps: &'static [ServiceKey],
        journal: Journal,
    }

    impl Scripted {
        fn new(label: &'static str, behavior: Behavior, journal: &Journal) -> Self {
            Self {
                label,
                behavior,
                deps: &[],
                journal: journal.clone(),
            }
        }

        fn depending_on(mut self, deps: &'static [ServiceKey]) -> Self {
            self.deps = deps;
            self
        }
    }

    #[async_trait]
    impl Resource for Scripted {
        fn name(&self) -> &'static str {
            self.label
        }

        fn dependencies(&self) -> &'static [ServiceKey] {
            self.deps
        }

        async fn initialize(&mut self, _ctx: &InitContext<'_>) -> Result<(), ResourceError> {
            self.journal.lock().unwrap().push(format!("init:{}", self.label));
            match self.behavior {
                Behavior::FailInit => Err(ResourceError::Connect(format!("{} refused", self.label))),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        async fn close(&mut self) -> Result<(), ResourceError> {
            self.journal.lock().unwrap().push(format!("close:{}", self.label));
            match self.behavior {
                Behavior::FailClose => Err(ResourceError::Handshake(format!("{} close", self.label))),
                _ => Ok(()),
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    const BUDGET: Duration = Duration::from_secs(5);

    #[test]
    fn registered_resources_report_their_names() {
        let j = journal();
        let mut registry = Registry::new();
        registry.register(ServiceKey::Cache, Scripted::new("redis", Behavior::Ok, &j)).unwrap();

        assert_eq!(registry.name(ServiceKey::Cache), Some("redis"));
        assert_eq!(registry.name(ServiceKey::Database), None);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let j = journal();
        let mut registry = Registry::new();
        registry.register(ServiceKey::Database, Scripted::new("db", Behavior::Ok, &j)).unwrap();
        let err = registry
            .register(ServiceKey::Database, Scripted::new("db2", Behavior::Ok, &j))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateKey(ServiceKey::Database)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_distinguishes_missing_from_not_ready() {
        let j = journal();
        let mut registry = Registry::new();
        registry.register(ServiceKey::Cache, Scripted::new("cache", Behavior::Ok, &j)).unwrap();

        assert!(matches!(
            registry.get(ServiceKey::Mailer),
            Err(RegistryError::NotFound(ServiceKey::Mailer))
        ));
        assert!(matches!(
            registry.get(ServiceKey::Cache),
            Err(RegistryError::NotReady {
                key: ServiceKey::Cache,
                state: ResourceState::Registered
            })
        ));
    }

    #[tokio::test]
    async fn init_all_runs_in_registration_order_and_close_all_reverses() {
        let j = journal();
        let mut registry = Registry::new();
        registry.register(ServiceKey::Database, Scripted::new("db", Behavior::Ok, &j)).unwrap();
        registry.register(ServiceKey::Cache, Scripted::new("cache", Behavior::Ok, &j)).unwrap();
        registry.register(ServiceKey::Mailer, Scripted::new("email", Behavior::Ok, &j)).unwrap();

        registry.init_all(BUDGET).await.unwrap();
        for key in registry.keys() {
            assert_eq!(registry.state(key), Some(ResourceState::Ready));
        }
        assert!(registry.get(ServiceKey::Cache).is_ok());

        registry.close_all(BUDGET).await.unwrap();
        for key in registry.keys() {
            assert_eq!(registry.state(key), Some(ResourceState::Closed));
        }
        assert_eq!(
            entries(&j),
            vec!["init:db", "init:cache", "init:email", "close:email", "close:cache", "close:db"]
        );
    }

    #[tokio::test]
    async fn failed_init_rolls_back_earlier_resources_in_reverse() {
        let j = journal();
        let mut registry = Registry::new();
        registry.register(ServiceKey::Database, Scripted::new("db", Behavior::Ok, &j)).unwrap();
        registry.register(ServiceKey::Cache, Scripted::new("cache", Behavior::Ok, &j)).unwrap();
        registry
            .register(ServiceKey::Policy, Scripted::new("casbin", Behavior::FailInit, &j))
            .unwrap();
        registry.register(ServiceKey::Mailer, Scripted::new("email", Behavior::Ok, &j)).unwrap();

        let err = registry.init_all(BUDGET).await.unwrap_err();
        match &err {
            RegistryError::Init { key, source } => {
                assert_eq!(*key, ServiceKey::Policy);
                assert!(source.to_string().contains("casbin refused"));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(
            entries(&j),
            vec!["init:db", "init:cache", "init:casbin", "close:cache", "close:db"]
        );
        assert!(matches!(
            registry.get(ServiceKey::Database),
            Err(RegistryError::NotReady { .. })
        ));
        assert_eq!(registry.state(ServiceKey::Policy), Some(ResourceState::Closed));
        assert_eq!(registry.state(ServiceKey::Mailer), Some(ResourceState::Registered));
    }

    #[tokio::test]
    async fn rollback_close_errors_do_not_mask_the_original() {
        let j = journal();
        let mut registry = Registry::new();
        registry
            .register(ServiceKey::Database, Scripted::new("db", Behavior::FailClose, &j))
            .unwrap();
        registry.register(ServiceKey::Cache, Scripted::new("cache", Behavior::FailInit, &j)).unwrap();

        let err = registry.init_all(BUDGET).await.unwrap_err();
        assert!(matches!(err, RegistryError::Init { key: ServiceKey::Cache, .. }));
        assert_eq!(registry.state(ServiceKey::Database), Some(ResourceState::Closed));
    }

    #[tokio::test]
    async fn zero_budget_times_out_without_touching_resources() {
        let j = journal();
        let mut registry = Registry::new();
        registry.register(ServiceKey::Database, Scripted::new("db", Behavior::Ok, &j)).unwrap();

        let err = registry.init_all(Duration::ZERO).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InitTimeout {
                pending: Some(ServiceKey::Database)
            }
        ));
        assert!(entries(&j).is_empty());
        assert_eq!(registry.state(ServiceKey::Database), Some(ResourceState::Registered));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_init_is_reported_as_timeout_and_rolled_back() {
        let j = journal();
        let mut registry = Registry::new();
        registry.register(ServiceKey::Database, Scripted::new("db", Behavior::Ok, &j)).unwrap();
        registry.register(ServiceKey::Cache, Scripted::new("cache", Behavior::Hang, &j)).unwrap();

        let err = registry.init_all(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InitTimeout {
                pending: Some(ServiceKey::Cache)
            }
        ));
        assert_eq!(
            entries(&j),
            vec!["init:db", "init:cache", "close:cache", "close:db"]
        );
        assert_eq!(registry.state(ServiceKey::Database), Some(ResourceState::Closed));
        assert_eq!(registry.state(ServiceKey::Cache), Some(ResourceState::Closed));
    }

    #[tokio::test]
    async fn declared_dependency_must_be_ready_first() {
        let j = journal();
        let mut registry = Registry::new();
        registry
            .register(
                ServiceKey::Policy,
                Scripted::new("casbin", Behavior::Ok, &j).depending_on(&[ServiceKey::Database]),
            )
            .unwrap();
        registry.register(ServiceKey::Database, Scripted::new("db", Behavior::Ok, &j)).unwrap();

        let err = registry.init_all(BUDGET).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::UnmetDependency {
                resource: ServiceKey::Policy,
                dependency: ServiceKey::Database
            }
        ));
        assert!(entries(&j).is_empty());
    }

    #[tokio::test]
    async fn close_all_attempts_every_close_and_aggregates() {
        let j = journal();
        let mut registry = Registry::new();
        registry
            .register(ServiceKey::Database, Scripted::new("db", Behavior::FailClose, &j))
            .unwrap();
        registry.register(ServiceKey::Cache, Scripted::new("cache", Behavior::Ok, &j)).unwrap();
        registry
            .register(ServiceKey::Mailer, Scripted::new("email", Behavior::FailClose, &j))
            .unwrap();
        registry.init_all(BUDGET).await.unwrap();

        let err = registry.close_all(BUDGET).await.unwrap_err();
        match err {
            RegistryError::Close(failures) => {
                assert_eq!(failures.keys(), vec![ServiceKey::Mailer, ServiceKey::Database]);
                let message = failures.to_string();
                assert!(message.starts_with("failed to close 2 service(s)"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            entries(&j)[3..],
            ["close:email", "close:cache", "close:db"]
        );
        assert_eq!(registry.state(ServiceKey::Cache), Some(ResourceState::Closed));
        assert_eq!(registry.state(ServiceKey::Database), Some(ResourceState::Failed));
    }

    #[tokio::test]
    async fn close_all_on_empty_registry_is_a_no_op() {
        let mut registry = Registry::new();
        assert!(registry.is_empty());
        registry.close_all(BUDGET).await.unwrap();
    }

    #[tokio::test]
    async fn typed_access_reports_type_mismatch() {
        let j = journal();
        let mut registry = Registry::new();
        registry.register(ServiceKey::Database, Scripted::new("db", Behavior::Ok, &j)).unwrap();
        registry.init_all(BUDGET).await.unwrap();

        assert!(registry.get_as::<Scripted>(ServiceKey::Database).is_ok());
        assert!(matches!(
            registry.database(),
            Err(RegistryError::TypeMismatch(ServiceKey::Database))
        ));
    }
}
