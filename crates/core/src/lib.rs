//! `crm-core`: identifiers and error primitives shared by every CRM crate.
//!
//! This crate contains **no infrastructure concerns**.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::UserId;
