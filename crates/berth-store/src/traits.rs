//! Storage trait definitions

use async_trait::async_trait;
use berth_core::{BerthResult, Cluster, Deployment, DeploymentId, QueueEntry};
use serde::{Deserialize, Serialize};

/// Everything the engine needs to rebuild itself after a restart
///
/// Allocations are not stored separately: they live inside the
/// `scheduled`/`running` state of each deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub clusters: Vec<Cluster>,
    #[serde(default)]
    pub deployments: Vec<Deployment>,
    #[serde(default)]
    pub queue: Vec<QueueEntry>,
}

impl StoreSnapshot {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty() && self.deployments.is_empty() && self.queue.is_empty()
    }
}

/// Durable store for engine state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last persisted state
    async fn load(&self) -> BerthResult<StoreSnapshot>;

    /// Insert or replace a cluster
    async fn save_cluster(&self, cluster: &Cluster) -> BerthResult<()>;

    /// Insert or replace a deployment
    async fn save_deployment(&self, deployment: &Deployment) -> BerthResult<()>;

    /// Remove a withdrawn deployment
    async fn delete_deployment(&self, id: DeploymentId) -> BerthResult<()>;

    /// Replace the persisted queue contents
    async fn save_queue(&self, entries: &[QueueEntry]) -> BerthResult<()>;

    /// Get the store name
    fn name(&self) -> &'static str;
}
