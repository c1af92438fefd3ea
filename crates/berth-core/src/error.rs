//! Error types for berth

use thiserror::Error;
use uuid::Uuid;

use crate::model::StateKind;
use crate::resources::ResourceVector;

/// Main error type for berth
#[derive(Error, Debug)]
pub enum BerthError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Executor (runtime) error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// API error
    #[error("API error: {0}")]
    Api(String),

    /// Cluster not found
    #[error("Cluster not found: {0}")]
    ClusterNotFound(Uuid),

    /// Cluster already registered
    #[error("Cluster already registered: {0}")]
    ClusterExists(Uuid),

    /// Deployment not found
    #[error("Deployment not found: {0}")]
    DeploymentNotFound(Uuid),

    /// Neither direct admission nor preemption can place the request
    #[error("Insufficient capacity on cluster {cluster}: requested {requested}, available {available}")]
    InsufficientCapacity {
        cluster: Uuid,
        requested: ResourceVector,
        available: ResourceVector,
    },

    /// A preemption plan selected a victim that is not strictly lower priority
    #[error("Invalid priority comparison: victim {victim} (priority {victim_priority}) cannot be preempted by {requester} (priority {requester_priority})")]
    InvalidPriorityComparison {
        requester: Uuid,
        requester_priority: u32,
        victim: Uuid,
        victim_priority: u32,
    },

    /// Ledger release without a matching reservation
    #[error("Double release of allocation {allocation} on cluster {cluster}")]
    DoubleRelease { cluster: Uuid, allocation: Uuid },

    /// The executor failed to start a deployment
    #[error("Executor failed to start deployment {deployment}: {reason}")]
    ExecutorStartFailure { deployment: Uuid, reason: String },

    /// The deployment failed too many times and is now terminal
    #[error("Retry budget exhausted for deployment {deployment} after {failures} failures")]
    RetryBudgetExhausted { deployment: Uuid, failures: u32 },

    /// State machine rejected a transition
    #[error("Invalid transition for deployment {deployment}: {from} -> {to}")]
    InvalidTransition {
        deployment: Uuid,
        from: StateKind,
        to: StateKind,
    },

    /// Operation not allowed in the deployment's current state
    #[error("Deployment {deployment} is {state}: {reason}")]
    InvalidState {
        deployment: Uuid,
        state: StateKind,
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BerthError {
    /// Consistency errors mean the ledger and registry disagree and need reconciliation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BerthError::DoubleRelease { .. } | BerthError::InvalidPriorityComparison { .. }
        )
    }
}

/// Result type for berth operations
pub type BerthResult<T> = Result<T, BerthError>;

impl From<serde_json::Error> for BerthError {
    fn from(err: serde_json::Error) -> Self {
        BerthError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for BerthError {
    fn from(err: toml::de::Error) -> Self {
        BerthError::Config(err.to_string())
    }
}
