//! HTTP API module.
//!
//! # Purpose
//! Exposes route handlers, the permission gates that guard them, and the
//! shared error and body types.
pub mod checks;
pub mod error;
pub mod middleware;
pub mod resources;
pub mod system;
pub mod topology;
pub mod types;
