//! JSON file state store
//!
//! The whole state is rewritten on every change: serialized to a sibling
//! temporary file and renamed over the target so a crash never leaves a
//! half-written snapshot behind.

use async_trait::async_trait;
use berth_core::{BerthError, BerthResult, Cluster, Deployment, DeploymentId, QueueEntry};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::memory::StoreState;
use crate::traits::{StateStore, StoreSnapshot};

/// Store that persists state to a JSON file
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Open a store, reading existing state if the file is present
    pub async fn open(path: impl Into<PathBuf>) -> BerthResult<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
                info!(path = %parent.display(), "Created state directory");
            }
        }

        let state = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let state: StoreState = serde_json::from_str(&content).map_err(|e| {
                BerthError::Storage(format!("corrupt state file {}: {}", path.display(), e))
            })?;
            info!(
                path = %path.display(),
                clusters = state.clusters.len(),
                deployments = state.deployments.len(),
                "Loaded state file"
            );
            state
        } else {
            StoreState::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Write the state while the caller holds the lock
    async fn persist(&self, state: &StoreState) -> BerthResult<()> {
        let content = serde_json::to_vec_pretty(state)?;
        let temp = self.temp_path();

        tokio::fs::write(&temp, &content).await.map_err(|e| {
            BerthError::Storage(format!("failed to write {}: {}", temp.display(), e))
        })?;
        tokio::fs::rename(&temp, &self.path).await.map_err(|e| {
            BerthError::Storage(format!("failed to replace {}: {}", self.path.display(), e))
        })?;

        debug!(path = %self.path.display(), bytes = content.len(), "State file written");
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn load(&self) -> BerthResult<StoreSnapshot> {
        Ok(self.state.lock().await.snapshot())
    }

    async fn save_cluster(&self, cluster: &Cluster) -> BerthResult<()> {
        let mut state = self.state.lock().await;
        state.clusters.insert(cluster.id, cluster.clone());
        self.persist(&state).await
    }

    async fn save_deployment(&self, deployment: &Deployment) -> BerthResult<()> {
        let mut state = self.state.lock().await;
        state.deployments.insert(deployment.id, deployment.clone());
        self.persist(&state).await
    }

    async fn delete_deployment(&self, id: DeploymentId) -> BerthResult<()> {
        let mut state = self.state.lock().await;
        if state.deployments.remove(&id).is_some() {
            self.persist(&state).await?;
        }
        Ok(())
    }

    async fn save_queue(&self, entries: &[QueueEntry]) -> BerthResult<()> {
        let mut state = self.state.lock().await;
        state.queue = entries.to_vec();
        self.persist(&state).await
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
