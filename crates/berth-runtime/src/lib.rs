//! berth-runtime: Executor abstraction layer
//!
//! This crate provides executor implementations for running deployments:
//! - Process-based executor that launches each deployment as a child process
//! - Simulated executor for development without a workload runtime

pub mod process;
pub mod simulated;
pub mod traits;

pub use process::{ProcessExecutor, ProcessExecutorConfig};
pub use simulated::SimulatedExecutor;
pub use traits::{event_channel, EventReceiver, EventSender, Executor, ExecutorEvent};
