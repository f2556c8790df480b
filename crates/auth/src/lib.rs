//! `crm-auth`: the authorization boundary with the policy model, engine and the
//! request-time decision.
//!
//! This crate is decoupled from HTTP and storage; persistence is reached only
//! through [`casbin::Adapter`].

pub mod adapter;
pub mod authorize;
pub mod claims;
pub mod engine;
pub mod key_match;
pub mod model;
pub mod password;
pub mod policy;
pub mod principal;
pub mod routes;
pub mod token;

pub use adapter::{AdapterError, InMemoryPolicyAdapter, WriteFault};
pub use authorize::{Decision, DenialKind, PolicyEvaluator, authorize};
pub use claims::{TokenClaims, TokenValidationError, validate_claims};
pub use engine::{EnforceError, PolicyEngine, PolicyError};
pub use key_match::{PatternError, key_match};
pub use model::{PATH_MATCH_FN, RBAC_MODEL, rbac_model};
pub use password::{PasswordCost, PasswordError, hash_password, verify_password};
pub use policy::{ALL_APIS_SUBJECT, GroupingRule, PolicyRule, PolicySet, RuleRow, RuleType, SUPER_ADMIN_ROLE};
pub use principal::Principal;
pub use routes::{PUBLIC_ROUTES, PublicRoute, RouteEntry, is_public_route};
pub use token::{TokenError, TokenService};
