//! Cluster, Deployment, Allocation and Queue Entry type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{BerthError, BerthResult};
use crate::resources::{ResourceVector, Utilization};

pub type ClusterId = Uuid;
pub type DeploymentId = Uuid;
pub type AllocationId = Uuid;

/// Deployment priority; higher values are more important
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Priority(pub u32);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const MEDIUM: Priority = Priority(1);
    pub const HIGH: Priority = Priority(2);

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::LOW),
            "medium" => Ok(Priority::MEDIUM),
            "high" => Ok(Priority::HIGH),
            other => other
                .parse::<u32>()
                .map(Priority)
                .map_err(|_| format!("invalid priority: '{}'", s)),
        }
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u32),
            Name(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(Priority(n)),
            Repr::Name(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// A compute cluster with fixed capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    /// Unique identifier for the cluster
    pub id: ClusterId,
    /// Human-readable name
    pub name: String,
    /// Owning organization (opaque reference)
    pub organisation_id: Option<String>,
    /// Total capacity
    pub capacity: ResourceVector,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    /// Create a new cluster with a generated identifier
    pub fn new(name: String, capacity: ResourceVector) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            organisation_id: None,
            capacity,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Cluster registration request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Fixed identifier, generated when absent
    #[serde(default)]
    pub id: Option<ClusterId>,
    pub name: String,
    #[serde(default)]
    pub organisation_id: Option<String>,
    pub capacity: ResourceVector,
}

impl ClusterSpec {
    pub fn into_cluster(self, now: DateTime<Utc>) -> Cluster {
        Cluster {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            name: self.name,
            organisation_id: self.organisation_id,
            capacity: self.capacity,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Deployment submission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub name: String,
    /// Container image to run
    pub image: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Submitting user or organization (opaque reference)
    #[serde(default)]
    pub owner: String,
    pub resources: ResourceVector,
    #[serde(default)]
    pub priority: Priority,
    /// Pin to a specific cluster instead of letting the scheduler choose
    #[serde(default)]
    pub cluster_id: Option<ClusterId>,
}

impl DeploymentRequest {
    pub fn new(name: String, image: String, resources: ResourceVector, priority: Priority) -> Self {
        Self {
            name,
            image,
            description: None,
            owner: String::new(),
            resources,
            priority,
            cluster_id: None,
        }
    }

    pub fn on_cluster(mut self, cluster_id: ClusterId) -> Self {
        self.cluster_id = Some(cluster_id);
        self
    }
}

/// Binding of one deployment to one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub deployment_id: DeploymentId,
    pub cluster_id: ClusterId,
    pub resources: ResourceVector,
    pub allocated_at: DateTime<Utc>,
}

impl Allocation {
    pub fn new(
        deployment_id: DeploymentId,
        cluster_id: ClusterId,
        resources: ResourceVector,
        allocated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            deployment_id,
            cluster_id,
            resources,
            allocated_at,
        }
    }
}

/// Deployment lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum DeploymentState {
    /// Waiting for admission
    Pending,
    /// Resources reserved, executor start in flight
    Scheduled { allocation: Allocation },
    /// Executor confirmed start
    Running {
        allocation: Allocation,
        started_at: DateTime<Utc>,
    },
    /// Evicted for a higher-priority deployment
    Preempted { by: DeploymentId },
    /// Terminal failure after the retry budget ran out
    Failed { reason: String },
    /// Terminal success
    Completed,
}

impl DeploymentState {
    pub fn kind(&self) -> StateKind {
        match self {
            DeploymentState::Pending => StateKind::Pending,
            DeploymentState::Scheduled { .. } => StateKind::Scheduled,
            DeploymentState::Running { .. } => StateKind::Running,
            DeploymentState::Preempted { .. } => StateKind::Preempted,
            DeploymentState::Failed { .. } => StateKind::Failed,
            DeploymentState::Completed => StateKind::Completed,
        }
    }

    /// The active allocation, present only while scheduled or running
    pub fn allocation(&self) -> Option<&Allocation> {
        match self {
            DeploymentState::Scheduled { allocation }
            | DeploymentState::Running { allocation, .. } => Some(allocation),
            _ => None,
        }
    }
}

/// Discriminant of [`DeploymentState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    Pending,
    Scheduled,
    Running,
    Preempted,
    Failed,
    Completed,
}

impl StateKind {
    /// Allowed edges of the lifecycle state machine
    pub fn can_transition_to(self, to: StateKind) -> bool {
        use StateKind::*;
        matches!(
            (self, to),
            (Pending, Scheduled)
                | (Scheduled, Running)
                | (Scheduled, Pending)
                | (Scheduled, Failed)
                | (Running, Completed)
                | (Running, Preempted)
                | (Running, Pending)
                | (Running, Failed)
                | (Preempted, Pending)
                | (Preempted, Failed)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StateKind::Failed | StateKind::Completed)
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKind::Pending => write!(f, "pending"),
            StateKind::Scheduled => write!(f, "scheduled"),
            StateKind::Running => write!(f, "running"),
            StateKind::Preempted => write!(f, "preempted"),
            StateKind::Failed => write!(f, "failed"),
            StateKind::Completed => write!(f, "completed"),
        }
    }
}

/// Why a transition happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", content = "detail", rename_all = "kebab-case")]
pub enum TransitionCause {
    Admitted,
    Started,
    PreemptedBy(DeploymentId),
    Requeued,
    RetryExhausted,
    Completed,
    StartFailure,
    RuntimeFailure,
    ManualRetry,
    Restored,
}

impl fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionCause::Admitted => write!(f, "admitted"),
            TransitionCause::Started => write!(f, "started"),
            TransitionCause::PreemptedBy(id) => write!(f, "preempted-by:{}", id),
            TransitionCause::Requeued => write!(f, "requeued"),
            TransitionCause::RetryExhausted => write!(f, "retry-exhausted"),
            TransitionCause::Completed => write!(f, "completed"),
            TransitionCause::StartFailure => write!(f, "start-failure"),
            TransitionCause::RuntimeFailure => write!(f, "runtime-failure"),
            TransitionCause::ManualRetry => write!(f, "manual-retry"),
            TransitionCause::Restored => write!(f, "restored"),
        }
    }
}

/// Audit record of one state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: StateKind,
    pub to: StateKind,
    pub cause: TransitionCause,
    pub at: DateTime<Utc>,
}

/// A deployment owned by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub name: String,
    pub image: String,
    pub description: Option<String>,
    pub owner: String,
    /// Requested resources
    pub resources: ResourceVector,
    pub priority: Priority,
    /// Pinned target cluster, if the submitter chose one
    pub cluster_id: Option<ClusterId>,
    pub state: DeploymentState,
    /// Start/runtime failures counted against the retry budget
    pub failure_count: u32,
    pub preempted_count: u32,
    /// Earliest time the next admission attempt is allowed
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// Cluster of the most recent allocation, kept for retry affinity
    pub last_cluster: Option<ClusterId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl Deployment {
    /// Create a pending deployment from a request
    pub fn new(request: DeploymentRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: request.name,
            image: request.image,
            description: request.description,
            owner: request.owner,
            resources: request.resources,
            priority: request.priority,
            cluster_id: request.cluster_id,
            state: DeploymentState::Pending,
            failure_count: 0,
            preempted_count: 0,
            next_retry_at: None,
            failure_reason: None,
            last_cluster: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            history: Vec::new(),
        }
    }

    pub fn kind(&self) -> StateKind {
        self.state.kind()
    }

    pub fn allocation(&self) -> Option<&Allocation> {
        self.state.allocation()
    }

    /// Apply a state-machine transition, recording it in the history
    pub fn transition(
        &mut self,
        next: DeploymentState,
        cause: TransitionCause,
        at: DateTime<Utc>,
    ) -> BerthResult<TransitionRecord> {
        let from = self.kind();
        let to = next.kind();
        if !from.can_transition_to(to) {
            return Err(BerthError::InvalidTransition {
                deployment: self.id,
                from,
                to,
            });
        }

        match &next {
            DeploymentState::Scheduled { allocation } => {
                self.last_cluster = Some(allocation.cluster_id);
            }
            DeploymentState::Running { started_at, .. } => {
                self.started_at = Some(*started_at);
            }
            DeploymentState::Preempted { .. } => {
                self.preempted_count += 1;
            }
            DeploymentState::Failed { reason } => {
                self.failure_reason = Some(reason.clone());
                self.completed_at = Some(at);
            }
            DeploymentState::Completed => {
                self.completed_at = Some(at);
            }
            DeploymentState::Pending => {}
        }

        self.state = next;
        self.updated_at = at;
        let record = TransitionRecord {
            from,
            to,
            cause,
            at,
        };
        self.history.push(record.clone());
        Ok(record)
    }
}

/// Ordering record for a deployment waiting in the priority queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub deployment_id: DeploymentId,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    /// Insertion sequence, breaks ties between identical timestamps
    pub seq: u64,
}

/// Point-in-time status of a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub id: DeploymentId,
    pub name: String,
    pub state: StateKind,
    pub priority: Priority,
    pub resources: ResourceVector,
    /// Cluster currently holding the allocation
    pub cluster_id: Option<ClusterId>,
    pub allocation: Option<Allocation>,
    pub failure_count: u32,
    pub preempted_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub last_cluster: Option<ClusterId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Deployment> for DeploymentStatus {
    fn from(d: &Deployment) -> Self {
        let allocation = d.allocation().cloned();
        Self {
            id: d.id,
            name: d.name.clone(),
            state: d.kind(),
            priority: d.priority,
            resources: d.resources,
            cluster_id: allocation.as_ref().map(|a| a.cluster_id),
            allocation,
            failure_count: d.failure_count,
            preempted_count: d.preempted_count,
            next_retry_at: d.next_retry_at,
            failure_reason: d.failure_reason.clone(),
            last_cluster: d.last_cluster,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

/// Utilization reading reported by an external monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub cluster_id: ClusterId,
    pub used: ResourceVector,
    pub sampled_at: DateTime<Utc>,
}

/// Resource accounting view of one cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterResourceSnapshot {
    pub cluster_id: ClusterId,
    pub name: String,
    pub total: ResourceVector,
    pub allocated: ResourceVector,
    pub available: ResourceVector,
    pub utilization: Utilization,
    pub allocations: usize,
    /// Latest monitor reading, informational only
    pub observed: Option<UtilizationSample>,
    pub captured_at: DateTime<Utc>,
}

/// Outcome of one queue re-evaluation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReevaluationReport {
    /// Another pass was already in flight; nothing was done
    pub skipped: bool,
    /// Queue entries looked at
    pub examined: usize,
    pub admitted: Vec<DeploymentId>,
    pub preempted: Vec<DeploymentId>,
    /// Admitted deployments whose start failed terminally
    pub failed: Vec<DeploymentId>,
    /// Queue length after the pass
    pub still_pending: usize,
}

impl ReevaluationReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Engine-wide counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStatus {
    pub clusters: usize,
    pub deployments: usize,
    pub pending: usize,
    pub scheduled: usize,
    pub running: usize,
    pub preempted: usize,
    pub failed: usize,
    pub completed: usize,
    pub queue_length: usize,
    pub executor: String,
    pub store: String,
    pub reevaluating: bool,
}
