//! `crm-infra`: configuration, managed resources and the startup routines
//! built on them.
//!
//! Everything that performs I/O lives here: the resource registry and its
//! database, cache, policy and mail resources, the Postgres policy and user
//! stores, the admin bootstrapper and the policy seeder.

pub mod bootstrap;
pub mod config;
pub mod policy_store;
pub mod readiness;
pub mod resource;
pub mod runtime;
pub mod seeder;
pub mod users;

pub use bootstrap::{AdminBootstrapper, BootstrapError, BootstrapOutcome, bootstrap_admin};
pub use config::{Config, ConfigError, Environment};
pub use policy_store::PostgresPolicyAdapter;
pub use readiness::{AdminStatus, Readiness};
pub use resource::{Registry, RegistryError, Resource, ResourceError, ResourceState, ServiceKey};
pub use runtime::Runtime;
pub use seeder::{PolicySeeder, SeedError, SeedReport};
pub use users::{AdminUser, InMemoryUserStore, PostgresUserStore, UserStore, UserStoreError};
