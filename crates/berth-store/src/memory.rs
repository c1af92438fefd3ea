//! In-memory state store

use async_trait::async_trait;
use berth_core::{BerthResult, Cluster, ClusterId, Deployment, DeploymentId, QueueEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::traits::{StateStore, StoreSnapshot};

/// Keyed state shared by the memory and file stores
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    #[serde(default)]
    pub clusters: BTreeMap<ClusterId, Cluster>,
    #[serde(default)]
    pub deployments: BTreeMap<DeploymentId, Deployment>,
    #[serde(default)]
    pub queue: Vec<QueueEntry>,
}

impl StoreState {
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            clusters: self.clusters.values().cloned().collect(),
            deployments: self.deployments.values().cloned().collect(),
            queue: self.queue.clone(),
        }
    }
}

/// Store that keeps state for the lifetime of the process only
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> BerthResult<StoreSnapshot> {
        Ok(self.state.read().await.snapshot())
    }

    async fn save_cluster(&self, cluster: &Cluster) -> BerthResult<()> {
        self.state
            .write()
            .await
            .clusters
            .insert(cluster.id, cluster.clone());
        Ok(())
    }

    async fn save_deployment(&self, deployment: &Deployment) -> BerthResult<()> {
        self.state
            .write()
            .await
            .deployments
            .insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn delete_deployment(&self, id: DeploymentId) -> BerthResult<()> {
        self.state.write().await.deployments.remove(&id);
        Ok(())
    }

    async fn save_queue(&self, entries: &[QueueEntry]) -> BerthResult<()> {
        self.state.write().await.queue = entries.to_vec();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::{DeploymentRequest, Priority, ResourceVector};
    use chrono::Utc;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.load().await.unwrap().is_empty());

        let cluster = Cluster::new("c1".to_string(), ResourceVector::units(4, 1024, 0));
        store.save_cluster(&cluster).await.unwrap();

        let deployment = Deployment::new(
            DeploymentRequest::new(
                "d1".to_string(),
                "img".to_string(),
                ResourceVector::units(1, 128, 0),
                Priority::LOW,
            ),
            Utc::now(),
        );
        store.save_deployment(&deployment).await.unwrap();
        store
            .save_queue(&[QueueEntry {
                deployment_id: deployment.id,
                priority: deployment.priority,
                enqueued_at: Utc::now(),
                seq: 1,
            }])
            .await
            .unwrap();

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.clusters.len(), 1);
        assert_eq!(snapshot.deployments.len(), 1);
        assert_eq!(snapshot.queue.len(), 1);

        store.delete_deployment(deployment.id).await.unwrap();
        assert!(store.load().await.unwrap().deployments.is_empty());
    }
}
