//! Resource ledger for tracking per-cluster capacity and allocations

use berth_core::{
    Allocation, AllocationId, BerthError, BerthResult, Cluster, ClusterId, ClusterResourceSnapshot,
    ResourceVector,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

/// Capacity bookkeeping for a single cluster
#[derive(Debug)]
pub struct ClusterAccount {
    cluster: Cluster,
    /// Sum of all active allocations
    allocated: ResourceVector,
    /// Active allocations indexed by ID
    allocations: HashMap<AllocationId, Allocation>,
}

impl ClusterAccount {
    pub fn new(cluster: Cluster) -> Self {
        Self {
            cluster,
            allocated: ResourceVector::zero(),
            allocations: HashMap::new(),
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn total(&self) -> ResourceVector {
        self.cluster.capacity
    }

    pub fn allocated(&self) -> ResourceVector {
        self.allocated
    }

    /// Capacity not covered by active allocations
    pub fn available(&self) -> ResourceVector {
        self.cluster.capacity.saturating_sub(&self.allocated)
    }

    pub fn would_fit(&self, amount: &ResourceVector) -> bool {
        amount.fits_within(&self.available())
    }

    /// Debit the account for a new allocation
    pub fn reserve(&mut self, allocation: Allocation) -> BerthResult<()> {
        let available = self.available();
        if !allocation.resources.fits_within(&available) {
            return Err(BerthError::InsufficientCapacity {
                cluster: self.cluster.id,
                requested: allocation.resources,
                available,
            });
        }
        if self.allocations.contains_key(&allocation.id) {
            return Err(BerthError::Internal(format!(
                "allocation {} already reserved on cluster {}",
                allocation.id, self.cluster.id
            )));
        }

        self.allocated = self
            .allocated
            .checked_add(&allocation.resources)
            .ok_or_else(|| BerthError::Internal("allocated total overflow".to_string()))?;

        debug!(
            cluster_id = %self.cluster.id,
            allocation_id = %allocation.id,
            deployment_id = %allocation.deployment_id,
            resources = %allocation.resources,
            "Reserved resources"
        );
        self.allocations.insert(allocation.id, allocation);
        Ok(())
    }

    /// Credit the account, returning the released allocation
    pub fn release(&mut self, allocation_id: AllocationId) -> BerthResult<Allocation> {
        let allocation = match self.allocations.remove(&allocation_id) {
            Some(allocation) => allocation,
            None => {
                error!(
                    cluster_id = %self.cluster.id,
                    allocation_id = %allocation_id,
                    "Release without a matching reservation"
                );
                return Err(BerthError::DoubleRelease {
                    cluster: self.cluster.id,
                    allocation: allocation_id,
                });
            }
        };

        self.allocated = self
            .allocated
            .checked_sub(&allocation.resources)
            .ok_or_else(|| {
                BerthError::Internal(format!(
                    "allocated total of cluster {} below released allocation",
                    self.cluster.id
                ))
            })?;

        debug!(
            cluster_id = %self.cluster.id,
            allocation_id = %allocation_id,
            resources = %allocation.resources,
            "Released resources"
        );
        Ok(allocation)
    }

    pub fn allocation(&self, allocation_id: AllocationId) -> Option<&Allocation> {
        self.allocations.get(&allocation_id)
    }

    pub fn allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.allocations.values()
    }

    pub fn snapshot(&self, captured_at: DateTime<Utc>) -> ClusterResourceSnapshot {
        ClusterResourceSnapshot {
            cluster_id: self.cluster.id,
            name: self.cluster.name.clone(),
            total: self.cluster.capacity,
            allocated: self.allocated,
            available: self.available(),
            utilization: self.allocated.utilization_of(&self.cluster.capacity),
            allocations: self.allocations.len(),
            observed: None,
            captured_at,
        }
    }
}

/// Exclusive access to one cluster's account
pub type AccountGuard = OwnedMutexGuard<ClusterAccount>;

/// Per-cluster capacity and allocation bookkeeping
///
/// Every cluster account sits behind its own mutex; no lock spans clusters.
#[derive(Default)]
pub struct ResourceLedger {
    accounts: RwLock<Accounts>,
}

#[derive(Default)]
struct Accounts {
    by_id: HashMap<ClusterId, Arc<Mutex<ClusterAccount>>>,
    /// Cluster names are unique across the ledger
    by_name: HashMap<String, ClusterId>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an account for a new cluster
    ///
    /// A cluster whose ID or name is already registered is rejected with
    /// `ClusterExists` carrying the registered cluster's ID.
    pub async fn register(&self, cluster: Cluster) -> BerthResult<()> {
        let mut accounts = self.accounts.write().await;
        if accounts.by_id.contains_key(&cluster.id) {
            return Err(BerthError::ClusterExists(cluster.id));
        }
        if let Some(&existing) = accounts.by_name.get(&cluster.name) {
            return Err(BerthError::ClusterExists(existing));
        }

        info!(
            cluster_id = %cluster.id,
            name = %cluster.name,
            capacity = %cluster.capacity,
            "Registered cluster"
        );
        accounts.by_name.insert(cluster.name.clone(), cluster.id);
        accounts
            .by_id
            .insert(cluster.id, Arc::new(Mutex::new(ClusterAccount::new(cluster))));
        Ok(())
    }

    pub async fn contains(&self, cluster_id: ClusterId) -> bool {
        self.accounts.read().await.by_id.contains_key(&cluster_id)
    }

    /// Registered cluster IDs in ascending order
    pub async fn cluster_ids(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self.accounts.read().await.by_id.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Enter the critical section of one cluster
    pub async fn lock(&self, cluster_id: ClusterId) -> BerthResult<AccountGuard> {
        let account = self
            .accounts
            .read()
            .await
            .by_id
            .get(&cluster_id)
            .cloned()
            .ok_or(BerthError::ClusterNotFound(cluster_id))?;
        Ok(account.lock_owned().await)
    }

    /// Rebuild a cluster's allocated total from persisted allocations
    ///
    /// Allocations are re-reserved oldest first. Those that no longer fit are
    /// returned instead of reserved.
    pub async fn restore(
        &self,
        cluster_id: ClusterId,
        mut allocations: Vec<Allocation>,
    ) -> BerthResult<Vec<Allocation>> {
        let mut account = self.lock(cluster_id).await?;
        allocations.sort_by(|a, b| a.allocated_at.cmp(&b.allocated_at).then(a.id.cmp(&b.id)));

        let mut rejected = Vec::new();
        let mut restored = 0;
        for allocation in allocations {
            match account.reserve(allocation.clone()) {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!(
                        cluster_id = %cluster_id,
                        allocation_id = %allocation.id,
                        deployment_id = %allocation.deployment_id,
                        error = %e,
                        "Persisted allocation no longer fits"
                    );
                    rejected.push(allocation);
                }
            }
        }

        info!(
            cluster_id = %cluster_id,
            restored = restored,
            rejected = rejected.len(),
            allocated = %account.allocated(),
            "Restored cluster allocations"
        );
        Ok(rejected)
    }

    pub async fn reserve(&self, cluster_id: ClusterId, allocation: Allocation) -> BerthResult<()> {
        self.lock(cluster_id).await?.reserve(allocation)
    }

    pub async fn release(
        &self,
        cluster_id: ClusterId,
        allocation_id: AllocationId,
    ) -> BerthResult<Allocation> {
        self.lock(cluster_id).await?.release(allocation_id)
    }

    pub async fn available(&self, cluster_id: ClusterId) -> BerthResult<ResourceVector> {
        Ok(self.lock(cluster_id).await?.available())
    }

    pub async fn would_fit(&self, cluster_id: ClusterId, amount: &ResourceVector) -> BerthResult<bool> {
        Ok(self.lock(cluster_id).await?.would_fit(amount))
    }

    pub async fn cluster(&self, cluster_id: ClusterId) -> BerthResult<Cluster> {
        Ok(self.lock(cluster_id).await?.cluster().clone())
    }

    /// All registered clusters ordered by ID
    pub async fn clusters(&self) -> Vec<Cluster> {
        let mut clusters = Vec::new();
        for id in self.cluster_ids().await {
            if let Ok(account) = self.lock(id).await {
                clusters.push(account.cluster().clone());
            }
        }
        clusters
    }

    /// Total, allocated and available resources per cluster
    pub async fn snapshot(&self, captured_at: DateTime<Utc>) -> Vec<ClusterResourceSnapshot> {
        let mut snapshots = Vec::new();
        for id in self.cluster_ids().await {
            if let Ok(account) = self.lock(id).await {
                snapshots.push(account.snapshot(captured_at));
            }
        }
        snapshots
    }
}
