//! Configuration types for berth

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::model::{ClusterId, ClusterSpec, DeploymentRequest, Priority};
use crate::resources::ResourceVector;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Scheduler timers and search limits
    pub scheduler: SchedulerConfig,
    /// Retry/backoff policy
    pub retry: RetryPolicy,
    /// Executor configuration
    pub runtime: RuntimeConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Clusters registered at startup
    pub clusters: Vec<ClusterSpec>,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::BerthError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::BerthError::Config(format!("Failed to read config file: {}", e))
        })?;
        let config: DaemonConfig = toml::from_str(&content)
            .map_err(|e| crate::BerthError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), crate::BerthError> {
        if self.retry.max_failures == 0 {
            return Err(crate::BerthError::Config(
                "retry.max_failures must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(crate::BerthError::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(crate::BerthError::Config(
                "retry.jitter_ratio must be between 0 and 1".to_string(),
            ));
        }
        if self.scheduler.reevaluate_interval_secs == 0 {
            return Err(crate::BerthError::Config(
                "scheduler.reevaluate_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
    /// Enable CORS
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9090,
            cors_enabled: false,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between queue re-evaluation passes
    pub reevaluate_interval_secs: u64,
    /// Interval between backoff expiry checks
    pub retry_check_interval_secs: u64,
    /// Interval between utilization snapshots
    pub utilization_capture_interval_secs: u64,
    /// Maximum candidate sets examined by the exact preemption search
    pub preemption_search_budget: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reevaluate_interval_secs: 30,
            retry_check_interval_secs: 5,
            utilization_capture_interval_secs: 300,
            preemption_search_budget: 100_000,
        }
    }
}

/// Exponential backoff policy for failed deployments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Failures after which a deployment becomes terminally failed
    pub max_failures: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound for the exponential delay
    pub max_delay_ms: u64,
    /// Extra random delay as a fraction of the computed delay (0-1)
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_failures: 3,
            base_delay_ms: 10_000,
            max_delay_ms: 300_000,
            jitter_ratio: 0.2,
        }
    }
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Which executor runs deployments
    pub executor: ExecutorKind,
    /// Command used by the process executor
    pub launcher: PathBuf,
    /// Arguments placed before the deployment image
    pub launcher_args: Vec<String>,
    /// How long the simulated executor runs a deployment
    pub simulated_duration_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorKind::Simulated,
            launcher: PathBuf::from("docker"),
            launcher_args: vec!["run".to_string(), "--rm".to_string()],
            simulated_duration_secs: 200,
        }
    }
}

/// Executor type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Deployments complete after a fixed duration
    Simulated,
    /// Deployments run as child processes of the daemon
    Process,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON state file; state is kept in memory only when unset
    pub state_path: Option<PathBuf>,
    /// Utilization samples retained per cluster
    pub history_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_path: None,
            history_capacity: 288,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Deployment manifest file format (TOML)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentManifest {
    /// Deployment settings
    pub deployment: ManifestSettings,
    /// Requested resources
    pub resources: ResourceVector,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSettings {
    pub name: String,
    pub image: String,
    pub description: Option<String>,
    pub owner: Option<String>,
    pub priority: Option<Priority>,
    pub cluster: Option<ClusterId>,
}

impl DeploymentManifest {
    pub fn parse(content: &str) -> Result<Self, crate::BerthError> {
        Ok(toml::from_str(content)?)
    }

    pub fn into_request(self) -> DeploymentRequest {
        DeploymentRequest {
            name: self.deployment.name,
            image: self.deployment.image,
            description: self.deployment.description,
            owner: self.deployment.owner.unwrap_or_default(),
            resources: self.resources,
            priority: self.deployment.priority.unwrap_or_default(),
            cluster_id: self.deployment.cluster,
        }
    }
}
