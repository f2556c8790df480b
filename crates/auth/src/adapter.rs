//! Policy persistence boundary.
//!
//! Stores implement [`casbin::Adapter`]. The engine loads the whole tuple set
//! on construction and on reload and replaces it on save; with auto-save on,
//! single-rule writes also reach the store through `add_policy` and
//! `remove_policy`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use casbin::{Adapter, Filter, Model};
use thiserror::Error;

use crate::policy::PolicySet;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("policy store unavailable: {0}")]
    Unavailable(String),

    #[error("policy store rejected the write: {0}")]
    Rejected(String),
}

impl From<AdapterError> for casbin::Error {
    fn from(err: AdapterError) -> Self {
        casbin::Error::from(casbin::error::AdapterError(Box::new(err)))
    }
}

/// Injected behaviour of every write on an [`InMemoryPolicyAdapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFault {
    /// Writes fail with [`AdapterError::Unavailable`].
    Fail,
    /// Writes never complete.
    Stall,
}

#[derive(Debug, Default)]
struct Shared {
    stored: RwLock<PolicySet>,
    saves: AtomicUsize,
    fault: RwLock<Option<WriteFault>>,
}

/// In-memory adapter for tests and development.
///
/// Clones share one store, so a test can keep a handle after moving the
/// adapter into an engine.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPolicyAdapter {
    shared: Arc<Shared>,
}

impl InMemoryPolicyAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policies(policies: PolicySet) -> Self {
        let adapter = Self::new();
        *adapter.stored() = policies;
        adapter
    }

    /// What a fresh load would return.
    pub fn snapshot(&self) -> PolicySet {
        self.shared
            .stored
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of successful whole-set saves.
    pub fn save_count(&self) -> usize {
        self.shared.saves.load(Ordering::SeqCst)
    }

    pub fn set_write_fault(&self, fault: Option<WriteFault>) {
        *self.shared.fault.write().unwrap_or_else(PoisonError::into_inner) = fault;
    }

    fn stored(&self) -> RwLockWriteGuard<'_, PolicySet> {
        self.shared.stored.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn writable(&self) -> Result<(), AdapterError> {
        let fault = *self.shared.fault.read().unwrap_or_else(PoisonError::into_inner);
        match fault {
            None => Ok(()),
            Some(WriteFault::Fail) => Err(AdapterError::Unavailable("connection refused".to_string())),
            Some(WriteFault::Stall) => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Adapter for InMemoryPolicyAdapter {
    async fn load_policy(&mut self, m: &mut dyn Model) -> casbin::Result<()> {
        self.snapshot().load_into(m);
        Ok(())
    }

    async fn load_filtered_policy<'a>(&mut self, m: &mut dyn Model, _f: Filter<'a>) -> casbin::Result<()> {
        self.load_policy(m).await
    }

    async fn save_policy(&mut self, m: &mut dyn Model) -> casbin::Result<()> {
        self.writable().await?;
        *self.stored() = PolicySet::from_model(m);
        self.shared.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_policy(&mut self) -> casbin::Result<()> {
        self.writable().await?;
        *self.stored() = PolicySet::new();
        Ok(())
    }

    fn is_filtered(&self) -> bool {
        false
    }

    async fn add_policy(&mut self, _sec: &str, ptype: &str, rule: Vec<String>) -> casbin::Result<bool> {
        self.writable().await?;
        self.stored().insert_fields(ptype, &rule);
        Ok(true)
    }

    async fn add_policies(&mut self, _sec: &str, ptype: &str, rules: Vec<Vec<String>>) -> casbin::Result<bool> {
        self.writable().await?;
        let mut stored = self.stored();
        for rule in &rules {
            stored.insert_fields(ptype, rule);
        }
        Ok(true)
    }

    async fn remove_policy(&mut self, _sec: &str, ptype: &str, rule: Vec<String>) -> casbin::Result<bool> {
        self.writable().await?;
        self.stored().remove_fields(ptype, &rule);
        Ok(true)
    }

    async fn remove_policies(&mut self, _sec: &str, ptype: &str, rules: Vec<Vec<String>>) -> casbin::Result<bool> {
        self.writable().await?;
        let mut stored = self.stored();
        for rule in &rules {
            stored.remove_fields(ptype, rule);
        }
        Ok(true)
    }

    async fn remove_filtered_policy(
        &mut self,
        _sec: &str,
        ptype: &str,
        field_index: usize,
        field_values: Vec<String>,
    ) -> casbin::Result<bool> {
        self.writable().await?;
        self.stored().remove_filtered(ptype, field_index, &field_values);
        Ok(true)
    }
}
