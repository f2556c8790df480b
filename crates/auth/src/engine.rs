//! Policy engine: a casbin enforcer over the embedded RBAC model.
//!
//! ## Concurrency
//!
//! The enforcer sits behind a tokio `RwLock`. Evaluation and read queries take
//! the shared side. Mutations, save and reload take the exclusive side and
//! hold it across the adapter round-trip, so two persistence calls never
//! interleave. Callers must still quiesce mutations while saving.

use casbin::function_map::OperatorFunction;
use casbin::{Adapter, CoreApi, DefaultModel, Enforcer, MgmtApi, Model, RbacApi};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::key_match::{path_match_operator, validate_pattern};
use crate::model::{PATH_MATCH_FN, RBAC_MODEL, REQUIRED_SECTIONS};
use crate::policy::{ALL_APIS_SUBJECT, GroupingRule, PolicyRule, PolicySet};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy model: {0}")]
    Model(String),

    #[error("`{0}` is reserved and cannot be granted")]
    ReservedSubject(String),

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("failed to persist policy: {0}")]
    PersistFailed(#[source] casbin::Error),

    #[error("failed to load policy: {0}")]
    LoadFailed(#[source] casbin::Error),
}

#[derive(Debug, Error)]
pub enum EnforceError {
    #[error("policy evaluation failed: {0}")]
    Engine(#[source] casbin::Error),
}

pub struct PolicyEngine {
    enforcer: RwLock<Enforcer>,
    auto_save: bool,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("auto_save", &self.auto_save)
            .finish_non_exhaustive()
    }
}

impl PolicyEngine {
    /// Build an engine over the embedded RBAC model and load the adapter's
    /// current tuple set.
    pub async fn new<A: Adapter + 'static>(adapter: A) -> Result<Self, PolicyError> {
        Self::with_model(RBAC_MODEL, adapter).await
    }

    pub async fn with_model<A: Adapter + 'static>(model_text: &str, adapter: A) -> Result<Self, PolicyError> {
        let model = DefaultModel::from_str(model_text)
            .await
            .map_err(|e| PolicyError::Model(e.to_string()))?;
        if let Some(section) = REQUIRED_SECTIONS
            .iter()
            .find(|s| !model.get_model().contains_key(**s))
        {
            return Err(PolicyError::Model(format!("missing section `{section}`")));
        }

        let mut enforcer = Enforcer::new(model, adapter)
            .await
            .map_err(PolicyError::LoadFailed)?;
        enforcer.add_function(PATH_MATCH_FN, OperatorFunction::Arg2(path_match_operator));
        enforcer.enable_auto_save(false);

        debug!(
            policies = enforcer.get_policy().len(),
            groupings = enforcer.get_grouping_policy().len(),
            "policy loaded"
        );

        Ok(Self {
            enforcer: RwLock::new(enforcer),
            auto_save: false,
        })
    }

    /// Write every mutation through to the store as it happens.
    pub fn with_auto_save(mut self, auto_save: bool) -> Self {
        self.enforcer.get_mut().enable_auto_save(auto_save);
        self.auto_save = auto_save;
        self
    }

    pub fn auto_save(&self) -> bool {
        self.auto_save
    }

    // ─────────────────────────────────────────────────────────────────────
    // Policy tuples
    // ─────────────────────────────────────────────────────────────────────

    pub async fn has_policy(&self, sub: &str, obj: &str, act: &str) -> bool {
        let rule = PolicyRule::new(sub, obj, act);
        self.enforcer.read().await.has_policy(rule.fields())
    }

    /// Insert `p(sub, obj, act)`. Returns `false` when it already exists.
    pub async fn add_policy(&self, sub: &str, obj: &str, act: &str) -> Result<bool, PolicyError> {
        let rule = PolicyRule::new(sub, obj, act);
        validate_policy(&rule)?;
        self.enforcer
            .write()
            .await
            .add_policy(rule.fields())
            .await
            .map_err(PolicyError::PersistFailed)
    }

    pub async fn remove_policy(&self, sub: &str, obj: &str, act: &str) -> Result<bool, PolicyError> {
        let rule = PolicyRule::new(sub, obj, act);
        self.enforcer
            .write()
            .await
            .remove_policy(rule.fields())
            .await
            .map_err(PolicyError::PersistFailed)
    }

    pub async fn policies(&self) -> Vec<PolicyRule> {
        let rules = self.enforcer.read().await.get_policy();
        rules.iter().filter_map(|r| PolicyRule::from_fields(r)).collect()
    }

    pub async fn policies_for_subject(&self, sub: &str) -> Vec<PolicyRule> {
        let rules = self
            .enforcer
            .read()
            .await
            .get_filtered_policy(0, vec![sub.to_string()]);
        rules.iter().filter_map(|r| PolicyRule::from_fields(r)).collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Grouping tuples
    // ─────────────────────────────────────────────────────────────────────

    pub async fn has_grouping_policy(&self, user: &str, role: &str) -> bool {
        let grouping = GroupingRule::new(user, role);
        self.enforcer.read().await.has_grouping_policy(grouping.fields())
    }

    /// Insert `g(user, role)`. Returns `false` when it already exists.
    pub async fn add_grouping_policy(&self, user: &str, role: &str) -> Result<bool, PolicyError> {
        for name in [user, role] {
            if name == ALL_APIS_SUBJECT {
                return Err(PolicyError::ReservedSubject(name.to_string()));
            }
            if name.trim().is_empty() {
                return Err(PolicyError::InvalidRule("grouping fields must not be empty".to_string()));
            }
        }
        let grouping = GroupingRule::new(user, role);
        self.enforcer
            .write()
            .await
            .add_grouping_policy(grouping.fields())
            .await
            .map_err(PolicyError::PersistFailed)
    }

    pub async fn remove_grouping_policy(&self, user: &str, role: &str) -> Result<bool, PolicyError> {
        let grouping = GroupingRule::new(user, role);
        self.enforcer
            .write()
            .await
            .remove_grouping_policy(grouping.fields())
            .await
            .map_err(PolicyError::PersistFailed)
    }

    /// Drop `g(user, role)` from memory only, bypassing auto-save.
    pub async fn discard_grouping_policy(&self, user: &str, role: &str) -> bool {
        let grouping = GroupingRule::new(user, role);
        let mut enforcer = self.enforcer.write().await;
        enforcer.enable_auto_save(false);
        let removed = enforcer.remove_grouping_policy(grouping.fields()).await;
        enforcer.enable_auto_save(self.auto_save);
        removed.unwrap_or(false)
    }

    pub async fn grouping_policies(&self) -> Vec<GroupingRule> {
        let rules = self.enforcer.read().await.get_grouping_policy();
        rules.iter().filter_map(|r| GroupingRule::from_fields(r)).collect()
    }

    /// Every role reachable from `user` through grouping facts, sorted.
    pub async fn roles_for_user(&self, user: &str) -> Vec<String> {
        let mut roles = self
            .enforcer
            .write()
            .await
            .get_implicit_roles_for_user(user, None);
        roles.retain(|r| r != user);
        roles.sort();
        roles.dedup();
        roles
    }

    /// Direct members of `role`, sorted.
    pub async fn users_for_role(&self, role: &str) -> Vec<String> {
        let mut users = self.enforcer.write().await.get_users_for_role(role, None);
        users.sort();
        users
    }

    pub async fn snapshot(&self) -> PolicySet {
        let enforcer = self.enforcer.read().await;
        PolicySet::from_rule_vectors(enforcer.get_policy(), enforcer.get_grouping_policy())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Evaluation
    // ─────────────────────────────────────────────────────────────────────

    /// Evaluate the model's matcher for `(sub, obj, act)`.
    pub async fn enforce(&self, sub: &str, obj: &str, act: &str) -> Result<bool, EnforceError> {
        self.enforcer
            .read()
            .await
            .enforce((sub, obj, act))
            .map_err(EnforceError::Engine)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────

    /// Replace the store's tuple set with the in-memory one.
    ///
    /// On failure the in-memory state is left untouched.
    #[instrument(skip(self), err)]
    pub async fn save_policy(&self) -> Result<(), PolicyError> {
        let mut enforcer = self.enforcer.write().await;
        enforcer.save_policy().await.map_err(PolicyError::PersistFailed)?;

        info!(
            policies = enforcer.get_policy().len(),
            groupings = enforcer.get_grouping_policy().len(),
            "policy saved"
        );
        Ok(())
    }

    /// Replace the in-memory tuple set with the store's, discarding unsaved
    /// mutations. A failed load leaves the engine empty, denying everything
    /// until a reload succeeds.
    #[instrument(skip(self), err)]
    pub async fn load_policy(&self) -> Result<(), PolicyError> {
        let mut enforcer = self.enforcer.write().await;
        enforcer.load_policy().await.map_err(PolicyError::LoadFailed)?;

        info!(
            policies = enforcer.get_policy().len(),
            groupings = enforcer.get_grouping_policy().len(),
            "policy reloaded"
        );
        Ok(())
    }
}

fn validate_policy(rule: &PolicyRule) -> Result<(), PolicyError> {
    if rule.subject.trim().is_empty() || rule.object.trim().is_empty() || rule.action.trim().is_empty() {
        return Err(PolicyError::InvalidRule("policy fields must not be empty".to_string()));
    }
    validate_pattern(&rule.object).map_err(|e| PolicyError::InvalidRule(e.to_string()))?;
    if rule.action != "*" && !rule.action.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(PolicyError::InvalidRule(format!(
            "action `{}` must be an uppercase HTTP method or `*`",
            rule.action
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::adapter::{InMemoryPolicyAdapter, WriteFault};
    use crate::policy::SUPER_ADMIN_ROLE;
    use proptest::prelude::*;

    async fn engine() -> (PolicyEngine, InMemoryPolicyAdapter) {
        let adapter = InMemoryPolicyAdapter::new();
        let engine = PolicyEngine::new(adapter.clone()).await.unwrap();
        (engine, adapter)
    }

    #[tokio::test]
    async fn add_policy_is_idempotent() {
        let (e, _) = engine().await;
        assert!(e.add_policy("sales", "/api/v1/customers", "GET").await.unwrap());
        assert!(!e.add_policy("sales", "/api/v1/customers", "GET").await.unwrap());
        assert_eq!(e.policies().await.len(), 1);
    }

    #[tokio::test]
    async fn saved_policy_survives_reload() {
        let (e, adapter) = engine().await;
        e.add_policy("sales", "/api/v1/orders", "POST").await.unwrap();
        e.add_grouping_policy("u-1", "sales").await.unwrap();
        e.save_policy().await.unwrap();

        e.remove_policy("sales", "/api/v1/orders", "POST").await.unwrap();
        e.load_policy().await.unwrap();

        assert!(e.has_policy("sales", "/api/v1/orders", "POST").await);
        assert!(e.has_grouping_policy("u-1", "sales").await);
        assert_eq!(adapter.snapshot(), e.snapshot().await);
    }

    #[tokio::test]
    async fn load_discards_unsaved_mutations() {
        let (e, adapter) = engine().await;
        e.add_policy("sales", "/api/v1/orders", "GET").await.unwrap();
        assert_eq!(adapter.save_count(), 0);
        e.load_policy().await.unwrap();
        assert!(!e.has_policy("sales", "/api/v1/orders", "GET").await);
    }

    #[tokio::test]
    async fn construction_loads_existing_tuples() {
        let mut set = PolicySet::new();
        set.policies.insert(PolicyRule::new("ops", "/api/v1/*", "GET"));
        set.groupings.insert(GroupingRule::new("u-1", "ops"));

        let e = PolicyEngine::new(InMemoryPolicyAdapter::with_policies(set)).await.unwrap();
        assert!(e.has_policy("ops", "/api/v1/*", "GET").await);
        assert!(e.enforce("u-1", "/api/v1/customers", "GET").await.unwrap());
    }

    #[tokio::test]
    async fn model_without_matcher_fails_construction() {
        let text = RBAC_MODEL.split("[matchers]").next().unwrap_or_default();
        let err = PolicyEngine::with_model(text, InMemoryPolicyAdapter::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Model(_)));
    }

    #[tokio::test]
    async fn unknown_subject_is_denied_without_error() {
        let (e, _) = engine().await;
        e.add_policy("sales", "/api/v1/customers", "GET").await.unwrap();
        assert!(!e.enforce("nobody", "/api/v1/customers", "GET").await.unwrap());
    }

    #[tokio::test]
    async fn enforce_sees_own_writes() {
        let (e, _) = engine().await;
        assert!(!e.enforce("sales", "/api/v1/customers/7", "GET").await.unwrap());
        e.add_policy("sales", "/api/v1/customers/:id", "GET").await.unwrap();
        assert!(e.enforce("sales", "/api/v1/customers/7", "GET").await.unwrap());
        assert!(!e.enforce("sales", "/api/v1/customers/7", "DELETE").await.unwrap());
    }

    #[tokio::test]
    async fn star_does_not_cross_segments() {
        let (e, _) = engine().await;
        e.add_policy("sales", "/api/v1/*", "GET").await.unwrap();
        assert!(e.enforce("sales", "/api/v1/customers", "GET").await.unwrap());
        assert!(!e.enforce("sales", "/api/v1/customers/7", "GET").await.unwrap());
    }

    #[tokio::test]
    async fn roles_are_inherited_transitively() {
        let (e, _) = engine().await;
        e.add_grouping_policy("u-1", "manager").await.unwrap();
        e.add_grouping_policy("manager", "sales").await.unwrap();
        e.add_policy("sales", "/api/v1/orders", "GET").await.unwrap();

        assert_eq!(e.roles_for_user("u-1").await, vec!["manager".to_string(), "sales".to_string()]);
        assert!(e.enforce("u-1", "/api/v1/orders", "GET").await.unwrap());
        assert!(e.enforce("manager", "/api/v1/orders", "GET").await.unwrap());
        assert_eq!(e.users_for_role("manager").await, vec!["u-1".to_string()]);
    }

    #[tokio::test]
    async fn cyclic_groupings_terminate() {
        let (e, _) = engine().await;
        e.add_grouping_policy("a", "b").await.unwrap();
        e.add_grouping_policy("b", "a").await.unwrap();
        assert_eq!(e.roles_for_user("a").await, vec!["b".to_string()]);
        assert!(!e.enforce("a", "/api/v1/x", "GET").await.unwrap());
    }

    #[tokio::test]
    async fn wildcard_action_grants_every_method() {
        let (e, _) = engine().await;
        e.add_policy(SUPER_ADMIN_ROLE, "/api/v1/*", "*").await.unwrap();
        for method in ["GET", "POST", "DELETE"] {
            assert!(e.enforce(SUPER_ADMIN_ROLE, "/api/v1/customers", method).await.unwrap());
        }
    }

    #[tokio::test]
    async fn catalog_subject_is_reserved() {
        let (e, _) = engine().await;
        e.add_policy(ALL_APIS_SUBJECT, "/api/v1/customers", "GET").await.unwrap();

        assert!(matches!(
            e.add_grouping_policy("u-1", ALL_APIS_SUBJECT).await,
            Err(PolicyError::ReservedSubject(_))
        ));
        assert!(!e.enforce(ALL_APIS_SUBJECT, "/api/v1/customers", "GET").await.unwrap());
    }

    #[tokio::test]
    async fn stored_grant_of_the_catalog_subject_matches_nothing() {
        let mut set = PolicySet::new();
        set.policies.insert(PolicyRule::new(ALL_APIS_SUBJECT, "/api/v1/customers", "GET"));
        set.groupings.insert(GroupingRule::new("u-1", ALL_APIS_SUBJECT));

        let e = PolicyEngine::new(InMemoryPolicyAdapter::with_policies(set)).await.unwrap();
        assert!(!e.enforce("u-1", "/api/v1/customers", "GET").await.unwrap());
    }

    #[tokio::test]
    async fn invalid_rules_are_rejected() {
        let (e, _) = engine().await;
        assert!(matches!(e.add_policy("sales", "customers", "GET").await, Err(PolicyError::InvalidRule(_))));
        assert!(matches!(e.add_policy("sales", "/api/v1/x", "get").await, Err(PolicyError::InvalidRule(_))));
        assert!(matches!(e.add_policy("", "/api/v1/x", "GET").await, Err(PolicyError::InvalidRule(_))));
        assert!(matches!(e.add_grouping_policy("u-1", " ").await, Err(PolicyError::InvalidRule(_))));
    }

    #[tokio::test]
    async fn malformed_stored_rule_does_not_hide_a_later_allow() {
        let mut set = PolicySet::new();
        set.policies.insert(PolicyRule::new("sales", "/api/v1/:", "GET"));
        set.policies.insert(PolicyRule::new("sales", "/api/v1/orders", "GET"));
        let e = PolicyEngine::new(InMemoryPolicyAdapter::with_policies(set)).await.unwrap();

        assert!(e.enforce("sales", "/api/v1/orders", "GET").await.unwrap());
        assert!(!e.enforce("sales", "/api/v1/x", "GET").await.unwrap());
    }

    #[tokio::test]
    async fn failed_save_keeps_memory() {
        let (e, adapter) = engine().await;
        e.add_policy("sales", "/api/v1/orders", "GET").await.unwrap();
        adapter.set_write_fault(Some(WriteFault::Fail));

        let err = e.save_policy().await.unwrap_err();
        assert!(matches!(err, PolicyError::PersistFailed(_)));
        assert!(e.has_policy("sales", "/api/v1/orders", "GET").await);
        assert!(adapter.snapshot().is_empty());
    }

    #[tokio::test]
    async fn auto_save_writes_through_and_refuses_on_store_failure() {
        let adapter = InMemoryPolicyAdapter::new();
        let e = PolicyEngine::new(adapter.clone()).await.unwrap().with_auto_save(true);

        e.add_policy("sales", "/api/v1/orders", "GET").await.unwrap();
        assert!(
            adapter
                .snapshot()
                .policies
                .contains(&PolicyRule::new("sales", "/api/v1/orders", "GET"))
        );

        adapter.set_write_fault(Some(WriteFault::Fail));
        assert!(e.add_policy("sales", "/api/v1/customers", "GET").await.is_err());
        assert!(!e.has_policy("sales", "/api/v1/customers", "GET").await);
    }

    #[tokio::test]
    async fn discarding_a_grouping_skips_the_store() {
        let adapter = InMemoryPolicyAdapter::new();
        let e = PolicyEngine::new(adapter.clone()).await.unwrap().with_auto_save(true);
        e.add_grouping_policy("u-1", "sales").await.unwrap();

        adapter.set_write_fault(Some(WriteFault::Stall));
        assert!(e.discard_grouping_policy("u-1", "sales").await);
        assert!(!e.has_grouping_policy("u-1", "sales").await);
        assert!(e.auto_save());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn evaluation_runs_alongside_a_writer() {
        let (e, _) = engine().await;
        let e = Arc::new(e);
        e.add_grouping_policy("u-1", "sales").await.unwrap();
        e.add_policy("sales", "/api/v1/orders", "GET").await.unwrap();

        let writer = {
            let e = e.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    e.add_policy("sales", &format!("/api/v1/r{i}"), "GET").await.unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let e = e.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        assert!(e.enforce("u-1", "/api/v1/orders", "GET").await.unwrap());
                        assert!(!e.enforce("u-1", "/api/v1/orders", "DELETE").await.unwrap());
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
        assert!(e.enforce("u-1", "/api/v1/r49", "GET").await.unwrap());
        assert_eq!(e.policies().await.len(), 51);
    }

    fn rule_strategy() -> impl Strategy<Value = (String, String, String)> {
        (
            "[a-z_]{1,10}",
            proptest::collection::vec("[a-z0-9]{1,6}", 1..4).prop_map(|s| format!("/{}", s.join("/"))),
            prop_oneof![Just("GET"), Just("POST"), Just("PUT"), Just("DELETE")].prop_map(str::to_string),
        )
    }

    proptest! {
        #[test]
        fn save_then_load_is_identity(rules in proptest::collection::vec(rule_strategy(), 0..20)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let (e, _) = engine().await;
                for (s, o, a) in &rules {
                    e.add_policy(s, o, a).await.unwrap();
                }
                let before = e.snapshot().await;
                e.save_policy().await.unwrap();
                e.load_policy().await.unwrap();
                assert_eq!(e.snapshot().await, before);
                for (s, o, a) in &rules {
                    assert!(e.has_policy(s, o, a).await);
                    assert!(!e.add_policy(s, o, a).await.unwrap());
                }
            });
        }
    }
}
