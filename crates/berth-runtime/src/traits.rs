//! Executor trait definitions

use async_trait::async_trait;
use berth_core::{Allocation, AllocationId, BerthResult, Cluster, Deployment, DeploymentId};

/// Executor trait for running deployments on clusters
///
/// `start` returns once the workload has been launched (or failed to launch);
/// what happens to the workload afterwards is reported as [`ExecutorEvent`]s.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Launch a deployment under the given allocation
    async fn start(
        &self,
        deployment: &Deployment,
        cluster: &Cluster,
        allocation: &Allocation,
    ) -> BerthResult<()>;

    /// Stop a running deployment (used on preemption)
    async fn stop(&self, deployment: &Deployment, allocation: &Allocation) -> BerthResult<()>;

    /// Get the executor name
    fn name(&self) -> &'static str;
}

/// Outcome of a launched workload, tagged with the allocation it ran under
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorEvent {
    /// The workload finished successfully
    Completed {
        deployment_id: DeploymentId,
        allocation_id: AllocationId,
    },
    /// The workload exited with an error after starting
    Failed {
        deployment_id: DeploymentId,
        allocation_id: AllocationId,
        reason: String,
    },
}

impl ExecutorEvent {
    pub fn deployment_id(&self) -> DeploymentId {
        match self {
            ExecutorEvent::Completed { deployment_id, .. }
            | ExecutorEvent::Failed { deployment_id, .. } => *deployment_id,
        }
    }
}

/// Sender half used by executors to report outcomes
pub type EventSender = tokio::sync::mpsc::UnboundedSender<ExecutorEvent>;
/// Receiver half drained by the daemon
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<ExecutorEvent>;

/// Create an executor event channel
pub fn event_channel() -> (EventSender, EventReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}
