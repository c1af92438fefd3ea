//! Deployment registry: owner of every deployment's lifecycle state

use berth_core::{
    BerthError, BerthResult, ClusterId, Deployment, DeploymentId, DeploymentState, StateKind,
    TransitionCause,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

/// Deployments indexed by ID
#[derive(Default)]
pub struct DeploymentRegistry {
    deployments: RwLock<HashMap<DeploymentId, Deployment>>,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, deployment: Deployment) {
        self.deployments
            .write()
            .await
            .insert(deployment.id, deployment);
    }

    pub async fn get(&self, id: DeploymentId) -> BerthResult<Deployment> {
        self.deployments
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(BerthError::DeploymentNotFound(id))
    }

    pub async fn contains(&self, id: DeploymentId) -> bool {
        self.deployments.read().await.contains_key(&id)
    }

    pub async fn remove(&self, id: DeploymentId) -> Option<Deployment> {
        self.deployments.write().await.remove(&id)
    }

    /// Remove a deployment if `check` accepts its current state
    pub async fn remove_if(
        &self,
        id: DeploymentId,
        check: impl FnOnce(&Deployment) -> BerthResult<()>,
    ) -> BerthResult<Deployment> {
        let mut deployments = self.deployments.write().await;
        let deployment = deployments
            .get(&id)
            .ok_or(BerthError::DeploymentNotFound(id))?;
        check(deployment)?;
        deployments
            .remove(&id)
            .ok_or(BerthError::DeploymentNotFound(id))
    }

    pub async fn len(&self) -> usize {
        self.deployments.read().await.len()
    }

    /// All deployments, oldest first
    pub async fn list(&self) -> Vec<Deployment> {
        let mut list: Vec<Deployment> = self.deployments.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    pub async fn count_by_state(&self) -> HashMap<StateKind, usize> {
        let mut counts = HashMap::new();
        for deployment in self.deployments.read().await.values() {
            *counts.entry(deployment.kind()).or_insert(0) += 1;
        }
        counts
    }

    /// Deployments holding an active allocation on a cluster
    pub async fn allocated_on(&self, cluster_id: ClusterId) -> Vec<Deployment> {
        self.deployments
            .read()
            .await
            .values()
            .filter(|d| d.allocation().is_some_and(|a| a.cluster_id == cluster_id))
            .cloned()
            .collect()
    }

    /// Mutate a deployment under the registry lock
    pub async fn update<T>(
        &self,
        id: DeploymentId,
        f: impl FnOnce(&mut Deployment) -> BerthResult<T>,
    ) -> BerthResult<T> {
        let mut deployments = self.deployments.write().await;
        let deployment = deployments
            .get_mut(&id)
            .ok_or(BerthError::DeploymentNotFound(id))?;
        f(deployment)
    }

    /// Mutate several deployments under one registry lock
    ///
    /// Nothing else observes the registry until `f` returns, so checks made at
    /// the start of `f` still hold when it mutates.
    pub async fn update_many<T>(
        &self,
        f: impl FnOnce(&mut HashMap<DeploymentId, Deployment>) -> BerthResult<T>,
    ) -> BerthResult<T> {
        let mut deployments = self.deployments.write().await;
        f(&mut deployments)
    }

    /// Apply a lifecycle transition, returning the updated deployment
    pub async fn transition(
        &self,
        id: DeploymentId,
        next: DeploymentState,
        cause: TransitionCause,
        at: DateTime<Utc>,
    ) -> BerthResult<Deployment> {
        self.update(id, |deployment| {
            apply_transition(deployment, next, cause, at)?;
            Ok(deployment.clone())
        })
        .await
    }
}

/// Transition a deployment and log the change
pub(crate) fn apply_transition(
    deployment: &mut Deployment,
    next: DeploymentState,
    cause: TransitionCause,
    at: DateTime<Utc>,
) -> BerthResult<()> {
    let record = deployment.transition(next, cause, at)?;
    info!(
        deployment_id = %deployment.id,
        name = %deployment.name,
        from = %record.from,
        to = %record.to,
        cause = %record.cause,
        "Deployment state transition"
    );
    Ok(())
}
