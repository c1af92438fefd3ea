//! berth-scheduler: priority scheduling and preemption engine
//!
//! This crate decides where and when deployments run:
//! - Per-cluster resource accounting
//! - Deployment lifecycle tracking and the pending queue
//! - Preemption victim selection and retry backoff

pub mod ledger;
pub mod placement;
pub mod preemption;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scheduler;

pub use ledger::{AccountGuard, ClusterAccount, ResourceLedger};
pub use placement::{ClusterView, PlacementStrategy, TightestFit};
pub use preemption::{verify_victims, PreemptionCandidate, PreemptionSelector, VictimSet};
pub use queue::{PriorityQueue, QueueSnapshot};
pub use registry::DeploymentRegistry;
pub use retry::{RetryDecision, RetryManager};
pub use scheduler::{Scheduler, SchedulerOptions};
