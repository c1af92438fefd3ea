//! Process-based executor implementation
//!
//! Each deployment runs as a child process of the daemon: the configured
//! launcher (for example `docker run --rm`) followed by the deployment image.
//! Resource limits are passed through the environment so that the launcher can
//! translate them into its own flags.

use async_trait::async_trait;
use berth_core::{Allocation, AllocationId, BerthError, BerthResult, Cluster, Deployment};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::traits::{EventSender, Executor, ExecutorEvent};

/// Process executor configuration
#[derive(Debug, Clone)]
pub struct ProcessExecutorConfig {
    /// Program that launches a deployment image
    pub launcher: PathBuf,
    /// Arguments placed before the image
    pub launcher_args: Vec<String>,
}

impl Default for ProcessExecutorConfig {
    fn default() -> Self {
        Self {
            launcher: PathBuf::from("docker"),
            launcher_args: vec!["run".to_string(), "--rm".to_string()],
        }
    }
}

type StopHandles = Arc<Mutex<HashMap<AllocationId, oneshot::Sender<()>>>>;

/// Process-based executor for running deployments
pub struct ProcessExecutor {
    config: ProcessExecutorConfig,
    events: EventSender,
    running: StopHandles,
}

impl ProcessExecutor {
    /// Create a new process executor
    pub fn new(config: ProcessExecutorConfig, events: EventSender) -> Self {
        Self {
            config,
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build the command to start a deployment
    fn build_command(
        &self,
        deployment: &Deployment,
        cluster: &Cluster,
        allocation: &Allocation,
    ) -> Command {
        let mut cmd = Command::new(&self.config.launcher);

        for arg in &self.config.launcher_args {
            cmd.arg(arg);
        }
        cmd.arg(&deployment.image);

        cmd.env("BERTH_DEPLOYMENT_ID", deployment.id.to_string());
        cmd.env("BERTH_DEPLOYMENT_NAME", &deployment.name);
        cmd.env("BERTH_CLUSTER_ID", cluster.id.to_string());
        cmd.env("BERTH_CLUSTER_NAME", &cluster.name);
        cmd.env("BERTH_ALLOCATION_ID", allocation.id.to_string());
        cmd.env("BERTH_CPU", allocation.resources.cpu.to_string());
        cmd.env("BERTH_RAM_MB", allocation.resources.ram.to_string());
        cmd.env("BERTH_GPU", allocation.resources.gpu.to_string());

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        cmd
    }

    /// Number of child processes currently tracked
    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn start(
        &self,
        deployment: &Deployment,
        cluster: &Cluster,
        allocation: &Allocation,
    ) -> BerthResult<()> {
        info!(
            deployment_id = %deployment.id,
            cluster = %cluster.name,
            image = %deployment.image,
            "Starting deployment process"
        );

        let mut cmd = self.build_command(deployment, cluster, allocation);
        let mut child = cmd.spawn().map_err(|e| {
            error!(
                deployment_id = %deployment.id,
                error = %e,
                "Failed to spawn deployment process"
            );
            BerthError::ExecutorStartFailure {
                deployment: deployment.id,
                reason: format!("failed to spawn {}: {}", self.config.launcher.display(), e),
            }
        })?;

        let pid = child.id().unwrap_or(0);
        debug!(deployment_id = %deployment.id, pid = pid, "Deployment process spawned");

        let (stop_tx, stop_rx) = oneshot::channel();
        self.running.lock().await.insert(allocation.id, stop_tx);

        let deployment_id = deployment.id;
        let allocation_id = allocation.id;
        let events = self.events.clone();
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    running.lock().await.remove(&allocation_id);
                    let event = match status {
                        Ok(status) if status.success() => ExecutorEvent::Completed {
                            deployment_id,
                            allocation_id,
                        },
                        Ok(status) => ExecutorEvent::Failed {
                            deployment_id,
                            allocation_id,
                            reason: format!("process exited with {}", status),
                        },
                        Err(e) => ExecutorEvent::Failed {
                            deployment_id,
                            allocation_id,
                            reason: format!("failed to wait for process: {}", e),
                        },
                    };
                    if events.send(event).is_err() {
                        warn!(%deployment_id, "Executor event receiver dropped");
                    }
                }
                _ = stop_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(%deployment_id, error = %e, "Failed to kill deployment process");
                    }
                    debug!(%deployment_id, "Deployment process stopped");
                }
            }
        });

        Ok(())
    }

    async fn stop(&self, deployment: &Deployment, allocation: &Allocation) -> BerthResult<()> {
        let handle = self.running.lock().await.remove(&allocation.id);
        match handle {
            Some(stop) => {
                info!(deployment_id = %deployment.id, "Stopping deployment process");
                // The process may have exited between lookup and send.
                let _ = stop.send(());
                Ok(())
            }
            None => Err(BerthError::Runtime(format!(
                "no process for deployment {}",
                deployment.id
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::event_channel;
    use berth_core::{DeploymentRequest, Priority, ResourceVector};
    use chrono::Utc;
    use std::time::Duration;

    fn fixture() -> (Deployment, Cluster, Allocation) {
        let cluster = Cluster::new("local".to_string(), ResourceVector::units(4, 1024, 0));
        let deployment = Deployment::new(
            DeploymentRequest::new(
                "job".to_string(),
                "busybox".to_string(),
                ResourceVector::units(1, 128, 0),
                Priority::MEDIUM,
            ),
            Utc::now(),
        );
        let allocation = Allocation::new(deployment.id, cluster.id, deployment.resources, Utc::now());
        (deployment, cluster, allocation)
    }

    #[test]
    fn test_process_executor_config_default() {
        let config = ProcessExecutorConfig::default();
        assert_eq!(config.launcher.to_str().unwrap(), "docker");
        assert_eq!(config.launcher_args, vec!["run", "--rm"]);
    }

    #[test]
    fn test_build_command() {
        let (tx, _rx) = event_channel();
        let executor = ProcessExecutor::new(ProcessExecutorConfig::default(), tx);
        let (deployment, cluster, allocation) = fixture();

        let cmd = executor.build_command(&deployment, &cluster, &allocation);
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, vec!["run", "--rm", "busybox"]);
        assert_eq!(executor.name(), "process");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_start_failure() {
        let (tx, _rx) = event_channel();
        let executor = ProcessExecutor::new(
            ProcessExecutorConfig {
                launcher: PathBuf::from("/nonexistent/berth-launcher"),
                launcher_args: Vec::new(),
            },
            tx,
        );
        let (deployment, cluster, allocation) = fixture();

        let err = executor
            .start(&deployment, &cluster, &allocation)
            .await
            .unwrap_err();
        assert!(matches!(err, BerthError::ExecutorStartFailure { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_reported() {
        let (tx, mut rx) = event_channel();
        let executor = ProcessExecutor::new(
            ProcessExecutorConfig {
                launcher: PathBuf::from("sh"),
                launcher_args: vec!["-c".to_string(), "exit 3".to_string()],
            },
            tx,
        );
        let (deployment, cluster, allocation) = fixture();

        executor.start(&deployment, &cluster, &allocation).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ExecutorEvent::Failed { allocation_id, .. } => assert_eq!(allocation_id, allocation.id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_suppresses_event() {
        let (tx, mut rx) = event_channel();
        let executor = ProcessExecutor::new(
            ProcessExecutorConfig {
                launcher: PathBuf::from("sh"),
                launcher_args: vec!["-c".to_string(), "sleep 30".to_string()],
            },
            tx,
        );
        let (deployment, cluster, allocation) = fixture();

        executor.start(&deployment, &cluster, &allocation).await.unwrap();
        assert_eq!(executor.running_count().await, 1);
        executor.stop(&deployment, &allocation).await.unwrap();

        let received = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(received.is_err());
        assert!(executor.stop(&deployment, &allocation).await.is_err());
    }
}
