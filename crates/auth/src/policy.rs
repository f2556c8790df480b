//! Access-control tuples and their persisted row form.

use std::collections::BTreeSet;

use casbin::Model;
use serde::{Deserialize, Serialize};

/// Pseudo-subject under which the policy seeder catalogs every protected
/// endpoint. It is never granted to a principal and never matches a request.
pub const ALL_APIS_SUBJECT: &str = "_all_apis_";

/// Role granted to the bootstrap administrator.
pub const SUPER_ADMIN_ROLE: &str = "super_admin";

/// `p(sub, obj, act)`: holders of `subject` may perform `action` on `object`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyRule {
    pub subject: String,
    pub object: String,
    pub action: String,
}

impl PolicyRule {
    pub fn new(subject: impl Into<String>, object: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            object: object.into(),
            action: action.into(),
        }
    }

    /// Casbin rule vector `[sub, obj, act]`.
    pub fn fields(&self) -> Vec<String> {
        vec![self.subject.clone(), self.object.clone(), self.action.clone()]
    }

    /// Trailing padding columns are ignored.
    pub fn from_fields(fields: &[String]) -> Option<Self> {
        match fields {
            [sub, obj, act, ..] => Some(Self::new(sub.as_str(), obj.as_str(), act.as_str())),
            _ => None,
        }
    }
}

/// `g(user, role)`: `user` is a member of `role`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupingRule {
    pub user: String,
    pub role: String,
}

impl GroupingRule {
    pub fn new(user: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            role: role.into(),
        }
    }

    pub fn fields(&self) -> Vec<String> {
        vec![self.user.clone(), self.role.clone()]
    }

    pub fn from_fields(fields: &[String]) -> Option<Self> {
        match fields {
            [user, role, ..] => Some(Self::new(user.as_str(), role.as_str())),
            _ => None,
        }
    }
}

/// The complete fact base held by an enforcer and written by an adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    pub policies: BTreeSet<PolicyRule>,
    pub groupings: BTreeSet<GroupingRule>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty() && self.groupings.is_empty()
    }

    /// Build from casbin rule vectors as returned by the enforcer.
    pub fn from_rule_vectors(policies: Vec<Vec<String>>, groupings: Vec<Vec<String>>) -> Self {
        Self {
            policies: policies.iter().filter_map(|r| PolicyRule::from_fields(r)).collect(),
            groupings: groupings.iter().filter_map(|r| GroupingRule::from_fields(r)).collect(),
        }
    }

    /// The tuple set currently held by a casbin model.
    pub fn from_model(model: &dyn Model) -> Self {
        Self::from_rule_vectors(model.get_policy("p", "p"), model.get_policy("g", "g"))
    }

    /// Add every tuple to a casbin model (used by adapters on load).
    pub fn load_into(&self, model: &mut dyn Model) {
        for rule in &self.policies {
            model.add_policy("p", "p", rule.fields());
        }
        for grouping in &self.groupings {
            model.add_policy("g", "g", grouping.fields());
        }
    }

    /// Insert one casbin rule vector of rule type `ptype`.
    pub fn insert_fields(&mut self, ptype: &str, fields: &[String]) -> bool {
        match RuleType::parse(ptype) {
            Some(RuleType::Policy) => PolicyRule::from_fields(fields).is_some_and(|r| self.policies.insert(r)),
            Some(RuleType::Grouping) => GroupingRule::from_fields(fields).is_some_and(|g| self.groupings.insert(g)),
            None => false,
        }
    }

    pub fn remove_fields(&mut self, ptype: &str, fields: &[String]) -> bool {
        match RuleType::parse(ptype) {
            Some(RuleType::Policy) => PolicyRule::from_fields(fields).is_some_and(|r| self.policies.remove(&r)),
            Some(RuleType::Grouping) => GroupingRule::from_fields(fields).is_some_and(|g| self.groupings.remove(&g)),
            None => false,
        }
    }

    /// Remove every rule of `ptype` whose fields, starting at `field_index`,
    /// equal `values`. Empty values match anything.
    pub fn remove_filtered(&mut self, ptype: &str, field_index: usize, values: &[String]) -> bool {
        let matches = |fields: &[String]| {
            values
                .iter()
                .enumerate()
                .all(|(i, v)| v.is_empty() || fields.get(field_index + i) == Some(v))
        };
        match RuleType::parse(ptype) {
            Some(RuleType::Policy) => {
                let before = self.policies.len();
                self.policies.retain(|r| !matches(&r.fields()));
                before != self.policies.len()
            }
            Some(RuleType::Grouping) => {
                let before = self.groupings.len();
                self.groupings.retain(|g| !matches(&g.fields()));
                before != self.groupings.len()
            }
            None => false,
        }
    }

    /// Flatten into persisted rows (`p` rows first, then `g`).
    pub fn to_rows(&self) -> Vec<RuleRow> {
        let policies = self.policies.iter().map(|p| RuleRow {
            ptype: RuleType::Policy.as_str().to_string(),
            v0: p.subject.clone(),
            v1: p.object.clone(),
            v2: p.action.clone(),
        });
        let groupings = self.groupings.iter().map(|g| RuleRow {
            ptype: RuleType::Grouping.as_str().to_string(),
            v0: g.user.clone(),
            v1: g.role.clone(),
            v2: String::new(),
        });
        policies.chain(groupings).collect()
    }

    /// Rebuild from persisted rows. Rows of any other rule type are skipped.
    pub fn from_rows(rows: impl IntoIterator<Item = RuleRow>) -> Self {
        let mut set = Self::new();
        for row in rows {
            match RuleType::parse(&row.ptype) {
                Some(RuleType::Policy) => {
                    set.policies.insert(PolicyRule::new(row.v0, row.v1, row.v2));
                }
                Some(RuleType::Grouping) => {
                    set.groupings.insert(GroupingRule::new(row.v0, row.v1));
                }
                None => {
                    tracing::warn!(ptype = %row.ptype, "skipping policy row with unknown rule type");
                }
            }
        }
        set
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    Policy,
    Grouping,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Policy => "p",
            RuleType::Grouping => "g",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "p" => Some(RuleType::Policy),
            "g" => Some(RuleType::Grouping),
            _ => None,
        }
    }
}

/// Persisted row: `(ptype, v0, v1, v2)`. Columns `v3..v5` are unused here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRow {
    pub ptype: String,
    pub v0: String,
    pub v1: String,
    pub v2: String,
}
