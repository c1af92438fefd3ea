//! Bounded per-cluster utilization history
//!
//! Monitor readings are kept for reporting only. Each cluster retains at most
//! `capacity` samples; the oldest are evicted first.

use berth_core::{ClusterId, UtilizationSample};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Utilization history manager
pub struct UtilizationHistory {
    /// Maximum samples kept per cluster
    capacity: usize,
    /// Samples indexed by cluster, oldest first
    samples: RwLock<HashMap<ClusterId, VecDeque<UtilizationSample>>>,
}

impl UtilizationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: RwLock::new(HashMap::new()),
        }
    }

    /// Append a sample, evicting the oldest one when the cluster is full
    pub async fn record(&self, sample: UtilizationSample) {
        let mut samples = self.samples.write().await;
        let ring = samples.entry(sample.cluster_id).or_default();

        if ring
            .back()
            .is_some_and(|last| last.sampled_at > sample.sampled_at)
        {
            warn!(
                cluster_id = %sample.cluster_id,
                "Utilization sample older than latest reading"
            );
        }

        while ring.len() >= self.capacity {
            ring.pop_front();
        }
        debug!(cluster_id = %sample.cluster_id, used = %sample.used, "Recorded utilization sample");
        ring.push_back(sample);
    }

    /// Most recent sample for a cluster
    pub async fn latest(&self, cluster_id: ClusterId) -> Option<UtilizationSample> {
        let samples = self.samples.read().await;
        samples.get(&cluster_id).and_then(|ring| ring.back().cloned())
    }

    /// All retained samples for a cluster, oldest first
    pub async fn history(&self, cluster_id: ClusterId) -> Vec<UtilizationSample> {
        let samples = self.samples.read().await;
        samples
            .get(&cluster_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all samples of a cluster
    pub async fn forget(&self, cluster_id: ClusterId) {
        self.samples.write().await.remove(&cluster_id);
    }

    /// Get history statistics
    pub async fn stats(&self) -> HistoryStats {
        let samples = self.samples.read().await;
        HistoryStats {
            clusters: samples.len(),
            samples: samples.values().map(VecDeque::len).sum(),
            capacity_per_cluster: self.capacity,
        }
    }
}

/// History statistics
#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    /// Clusters with at least one sample
    pub clusters: usize,
    /// Total retained samples
    pub samples: usize,
    /// Maximum samples kept per cluster
    pub capacity_per_cluster: usize,
}
