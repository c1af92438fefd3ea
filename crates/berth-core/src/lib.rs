//! berth-core: Core types and traits for the berth scheduler
//!
//! This crate provides the fundamental types used throughout the berth system:
//! - Fixed-point resource vectors
//! - Cluster, deployment, allocation and queue entry records
//! - The deployment lifecycle state machine
//! - Configuration types
//! - Error handling
//! - Clock abstraction

pub mod clock;
pub mod config;
pub mod error;
pub mod model;
pub mod resources;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use model::*;
pub use resources::*;
