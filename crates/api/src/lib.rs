//! HTTP API: server, routing, and request authorization.

pub mod app;
pub mod catalog;
pub mod context;
pub mod middleware;
