//! Simulated executor
//!
//! Accepts every start request and reports completion after a fixed duration.
//! Used for development and demos where no real workload runtime is available.

use async_trait::async_trait;
use berth_core::{Allocation, AllocationId, BerthError, BerthResult, Cluster, Deployment};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::traits::{EventSender, Executor, ExecutorEvent};

/// Executor that pretends to run deployments for a fixed duration
pub struct SimulatedExecutor {
    duration: Duration,
    events: EventSender,
    runs: Arc<Mutex<HashMap<AllocationId, JoinHandle<()>>>>,
}

impl SimulatedExecutor {
    pub fn new(duration: Duration, events: EventSender) -> Self {
        Self {
            duration,
            events,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of simulated runs in flight
    pub async fn active_runs(&self) -> usize {
        self.runs.lock().await.len()
    }
}

#[async_trait]
impl Executor for SimulatedExecutor {
    async fn start(
        &self,
        deployment: &Deployment,
        cluster: &Cluster,
        allocation: &Allocation,
    ) -> BerthResult<()> {
        info!(
            deployment_id = %deployment.id,
            cluster = %cluster.name,
            duration_secs = self.duration.as_secs(),
            "Simulating deployment"
        );

        let deployment_id = deployment.id;
        let allocation_id = allocation.id;
        let duration = self.duration;
        let events = self.events.clone();
        let runs = Arc::clone(&self.runs);

        // Hold the lock across spawn so a fast run cannot remove itself before insertion.
        let mut guard = self.runs.lock().await;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            runs.lock().await.remove(&allocation_id);
            debug!(%deployment_id, "Simulated deployment finished");
            let _ = events.send(ExecutorEvent::Completed {
                deployment_id,
                allocation_id,
            });
        });
        guard.insert(allocation_id, handle);

        Ok(())
    }

    async fn stop(&self, deployment: &Deployment, allocation: &Allocation) -> BerthResult<()> {
        match self.runs.lock().await.remove(&allocation.id) {
            Some(handle) => {
                handle.abort();
                info!(deployment_id = %deployment.id, "Simulated deployment stopped");
                Ok(())
            }
            None => Err(BerthError::Runtime(format!(
                "no simulated run for deployment {}",
                deployment.id
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::event_channel;
    use berth_core::{DeploymentRequest, Priority, ResourceVector};
    use chrono::Utc;

    fn fixture() -> (Deployment, Cluster, Allocation) {
        let cluster = Cluster::new("sim".to_string(), ResourceVector::units(8, 4096, 1));
        let deployment = Deployment::new(
            DeploymentRequest::new(
                "sim-job".to_string(),
                "image".to_string(),
                ResourceVector::units(2, 512, 0),
                Priority::LOW,
            ),
            Utc::now(),
        );
        let allocation = Allocation::new(deployment.id, cluster.id, deployment.resources, Utc::now());
        (deployment, cluster, allocation)
    }

    #[tokio::test]
    async fn test_simulated_completion() {
        let (tx, mut rx) = event_channel();
        let executor = SimulatedExecutor::new(Duration::from_millis(10), tx);
        let (deployment, cluster, allocation) = fixture();

        executor.start(&deployment, &cluster, &allocation).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            ExecutorEvent::Completed {
                deployment_id: deployment.id,
                allocation_id: allocation.id,
            }
        );
        assert_eq!(executor.active_runs().await, 0);
    }

    #[tokio::test]
    async fn test_simulated_stop() {
        let (tx, mut rx) = event_channel();
        let executor = SimulatedExecutor::new(Duration::from_secs(60), tx);
        let (deployment, cluster, allocation) = fixture();

        executor.start(&deployment, &cluster, &allocation).await.unwrap();
        assert_eq!(executor.active_runs().await, 1);

        executor.stop(&deployment, &allocation).await.unwrap();
        assert_eq!(executor.active_runs().await, 0);
        assert!(rx.try_recv().is_err());
        assert!(executor.stop(&deployment, &allocation).await.is_err());
    }
}
