//! berth-api: REST API server for berth
//!
//! This crate exposes the scheduling engine over HTTP:
//! - Cluster registration and resource reports
//! - Deployment submission, withdrawal, retry and completion
//! - Queue inspection and re-evaluation

pub mod rest;

pub use rest::{create_app, create_router};
