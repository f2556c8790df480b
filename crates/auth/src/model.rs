//! Embedded RBAC model.
//!
//! `pathMatch` is keyMatch over path segments (see [`crate::key_match`]); it
//! is registered on the enforcer at construction. Tuples under the catalog
//! pseudo-subject never match a request.

use casbin::DefaultModel;

/// Name under which the segment matcher is registered with the enforcer.
pub const PATH_MATCH_FN: &str = "pathMatch";

/// Sections every model must define: request, policy, role, effect, matcher.
pub const REQUIRED_SECTIONS: [&str; 5] = ["r", "p", "g", "e", "m"];

/// RBAC model with role inheritance and wildcard actions.
pub const RBAC_MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = p.sub != "_all_apis_" && g(r.sub, p.sub) && pathMatch(r.obj, p.obj) && (r.act == p.act || p.act == "*")
"#;

pub async fn rbac_model() -> casbin::Result<DefaultModel> {
    DefaultModel::from_str(RBAC_MODEL).await
}
