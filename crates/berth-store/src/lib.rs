//! berth-store: State persistence
//!
//! This crate provides storage for the scheduling engine:
//! - `StateStore` trait for clusters, deployments and queue entries
//! - In-memory store (default)
//! - JSON file store with atomic writes
//! - Bounded per-cluster utilization history

pub mod file;
pub mod history;
pub mod memory;
pub mod traits;

pub use file::FileStore;
pub use history::{HistoryStats, UtilizationHistory};
pub use memory::MemoryStore;
pub use traits::{StateStore, StoreSnapshot};
