//! Resource-tree authorization service library crate.
//!
//! # Purpose
//! Exposes the resource-tree cache, the permission checker built on it, the
//! HTTP gates and handlers, configuration, and the system-of-record stores
//! for use by the binary and tests.
pub mod api;
pub mod app;
pub mod authz;
pub mod cache;
pub mod config;
pub mod model;
pub mod observability;
pub mod store;
