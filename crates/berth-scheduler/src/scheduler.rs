//! Main scheduler logic

use berth_core::{
    Allocation, AllocationId, BerthError, BerthResult, Clock, Cluster, ClusterId,
    ClusterResourceSnapshot, ClusterSpec, DaemonConfig, Deployment, DeploymentId,
    DeploymentRequest, DeploymentState, DeploymentStatus, EngineStatus, ReevaluationReport,
    ResourceVector, RetryPolicy, StateKind, TransitionCause, UtilizationSample,
};
use berth_runtime::{Executor, ExecutorEvent};
use berth_store::{StateStore, UtilizationHistory};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::ledger::{AccountGuard, ClusterAccount, ResourceLedger};
use crate::placement::{ClusterView, PlacementStrategy, TightestFit};
use crate::preemption::{verify_victims, PreemptionCandidate, PreemptionSelector, VictimSet};
use crate::queue::PriorityQueue;
use crate::registry::{apply_transition, DeploymentRegistry};
use crate::retry::{RetryDecision, RetryManager};

/// Scheduler tuning knobs
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub retry: RetryPolicy,
    pub preemption_search_budget: usize,
    pub history_capacity: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(&DaemonConfig::default())
    }
}

impl SchedulerOptions {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            preemption_search_budget: config.scheduler.preemption_search_budget,
            history_capacity: config.storage.history_capacity,
        }
    }
}

/// A deployment bound to a cluster, waiting for its executor start
struct Admitted {
    deployment: Deployment,
    cluster: Cluster,
    allocation: Allocation,
    /// Evicted deployments (now pending) with the allocation they lost
    victims: Vec<(Deployment, Allocation)>,
}

enum AdmitOutcome {
    Admitted(Admitted),
    /// Neither direct admission nor preemption could place the deployment
    Blocked,
    /// Not pending or still backing off
    Skipped,
}

/// Clears the in-flight flag when a re-evaluation pass ends or is cancelled
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Scheduler owns the ledger, registry and queue and drives admission
pub struct Scheduler {
    /// Per-cluster capacity accounts
    ledger: ResourceLedger,
    /// Deployment lifecycle state
    registry: DeploymentRegistry,
    /// Deployments awaiting resources
    queue: Mutex<PriorityQueue>,
    selector: PreemptionSelector,
    placement: Arc<dyn PlacementStrategy>,
    retry: RetryManager,
    /// Monitor readings, for reporting only
    history: UtilizationHistory,
    executor: Arc<dyn Executor>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    reevaluating: AtomicBool,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        options: SchedulerOptions,
        executor: Arc<dyn Executor>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(
            executor = executor.name(),
            store = store.name(),
            max_failures = options.retry.max_failures,
            search_budget = options.preemption_search_budget,
            "Scheduler initialized"
        );

        Self {
            ledger: ResourceLedger::new(),
            registry: DeploymentRegistry::new(),
            queue: Mutex::new(PriorityQueue::new()),
            selector: PreemptionSelector::new(options.preemption_search_budget),
            placement: Arc::new(TightestFit),
            retry: RetryManager::new(options.retry),
            history: UtilizationHistory::new(options.history_capacity),
            executor,
            store,
            clock,
            reevaluating: AtomicBool::new(false),
        }
    }

    /// Replace the cluster placement strategy
    pub fn with_placement(mut self, placement: Arc<dyn PlacementStrategy>) -> Self {
        self.placement = placement;
        self
    }

    // ---------------------------------------------------------------
    // Clusters and monitoring
    // ---------------------------------------------------------------

    /// Register a cluster with the ledger
    pub async fn register_cluster(&self, spec: ClusterSpec) -> BerthResult<Cluster> {
        let cluster = spec.into_cluster(self.clock.now());
        self.ledger.register(cluster.clone()).await?;
        if let Err(e) = self.store.save_cluster(&cluster).await {
            error!(cluster_id = %cluster.id, error = %e, "Failed to persist cluster");
        }
        Ok(cluster)
    }

    pub async fn list_clusters(&self) -> Vec<Cluster> {
        self.ledger.clusters().await
    }

    /// Resource accounting view of one cluster
    pub async fn cluster_report(&self, cluster_id: ClusterId) -> BerthResult<ClusterResourceSnapshot> {
        let mut snapshot = self.ledger.lock(cluster_id).await?.snapshot(self.clock.now());
        snapshot.observed = self.history.latest(cluster_id).await;
        Ok(snapshot)
    }

    /// Total, allocated, available and utilization for every cluster
    pub async fn resource_report(&self) -> Vec<ClusterResourceSnapshot> {
        let mut snapshots = self.ledger.snapshot(self.clock.now()).await;
        for snapshot in &mut snapshots {
            snapshot.observed = self.history.latest(snapshot.cluster_id).await;
        }
        snapshots
    }

    /// Store a utilization reading from an external monitor
    pub async fn record_utilization(&self, sample: UtilizationSample) -> BerthResult<()> {
        if !self.ledger.contains(sample.cluster_id).await {
            return Err(BerthError::ClusterNotFound(sample.cluster_id));
        }
        self.history.record(sample).await;
        Ok(())
    }

    /// Record the ledger's allocated totals as a utilization sample per cluster
    pub async fn capture_utilization(&self) -> usize {
        let snapshots = self.ledger.snapshot(self.clock.now()).await;
        for snapshot in &snapshots {
            self.history
                .record(UtilizationSample {
                    cluster_id: snapshot.cluster_id,
                    used: snapshot.allocated,
                    sampled_at: snapshot.captured_at,
                })
                .await;
        }
        debug!(clusters = snapshots.len(), "Captured cluster utilization");
        snapshots.len()
    }

    pub async fn utilization_history(
        &self,
        cluster_id: ClusterId,
    ) -> BerthResult<Vec<UtilizationSample>> {
        if !self.ledger.contains(cluster_id).await {
            return Err(BerthError::ClusterNotFound(cluster_id));
        }
        Ok(self.history.history(cluster_id).await)
    }

    // ---------------------------------------------------------------
    // Deployment operations
    // ---------------------------------------------------------------

    /// Submit a deployment: admit it directly, by preemption, or queue it
    pub async fn submit(&self, request: DeploymentRequest) -> BerthResult<DeploymentStatus> {
        if let Some(cluster_id) = request.cluster_id {
            if !self.ledger.contains(cluster_id).await {
                return Err(BerthError::ClusterNotFound(cluster_id));
            }
        }

        let now = self.clock.now();
        let deployment = Deployment::new(request, now);
        let id = deployment.id;

        info!(
            deployment_id = %id,
            name = %deployment.name,
            priority = %deployment.priority,
            resources = %deployment.resources,
            "Submitting deployment"
        );

        if !self.could_ever_fit(&deployment).await {
            warn!(
                deployment_id = %id,
                resources = %deployment.resources,
                "Deployment exceeds the capacity of every eligible cluster; it will stay queued"
            );
        }

        self.registry.insert(deployment.clone()).await;
        self.queue
            .lock()
            .await
            .enqueue(id, deployment.priority, now);
        self.persist(&deployment).await;

        match self.try_admit(id, &HashSet::new()).await? {
            AdmitOutcome::Admitted(admitted) => {
                self.finish_admission(admitted).await?;
            }
            AdmitOutcome::Blocked => {
                info!(deployment_id = %id, "Insufficient capacity, deployment queued");
            }
            AdmitOutcome::Skipped => {}
        }
        self.persist_queue().await;

        self.get_status(id).await
    }

    /// Remove a deployment that has not been admitted
    pub async fn withdraw(&self, id: DeploymentId) -> BerthResult<DeploymentStatus> {
        let deployment = self
            .registry
            .remove_if(id, |d| match d.kind() {
                StateKind::Pending => Ok(()),
                state => Err(BerthError::InvalidState {
                    deployment: id,
                    state,
                    reason: "only pending deployments can be withdrawn".to_string(),
                }),
            })
            .await?;
        self.queue.lock().await.remove(id);

        info!(deployment_id = %id, name = %deployment.name, "Deployment withdrawn");

        if let Err(e) = self.store.delete_deployment(id).await {
            error!(deployment_id = %id, error = %e, "Failed to delete deployment from store");
        }
        self.persist_queue().await;
        Ok(DeploymentStatus::from(&deployment))
    }

    /// Reset a failed deployment's retry budget and put it back in the queue
    pub async fn manual_retry(&self, id: DeploymentId) -> BerthResult<DeploymentStatus> {
        let now = self.clock.now();
        let deployment = self
            .registry
            .update(id, |d| {
                self.retry.manual_retry(d)?;
                apply_transition(d, DeploymentState::Pending, TransitionCause::ManualRetry, now)?;
                Ok(d.clone())
            })
            .await?;
        self.queue
            .lock()
            .await
            .enqueue(id, deployment.priority, now);

        self.persist(&deployment).await;
        self.persist_queue().await;
        Ok(DeploymentStatus::from(&deployment))
    }

    pub async fn get_status(&self, id: DeploymentId) -> BerthResult<DeploymentStatus> {
        Ok(DeploymentStatus::from(&self.registry.get(id).await?))
    }

    /// Full deployment record including its transition history
    pub async fn get_deployment(&self, id: DeploymentId) -> BerthResult<Deployment> {
        self.registry.get(id).await
    }

    pub async fn list_deployments(&self) -> Vec<DeploymentStatus> {
        self.registry
            .list()
            .await
            .iter()
            .map(DeploymentStatus::from)
            .collect()
    }

    /// Queued deployments in admission order
    pub async fn list_pending(&self) -> Vec<DeploymentStatus> {
        let entries = self.queue.lock().await.entries();
        let mut pending = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Ok(deployment) = self.registry.get(entry.deployment_id).await {
                pending.push(DeploymentStatus::from(&deployment));
            }
        }
        pending
    }

    /// Running deployments on a cluster
    pub async fn list_running(&self, cluster_id: ClusterId) -> BerthResult<Vec<DeploymentStatus>> {
        if !self.ledger.contains(cluster_id).await {
            return Err(BerthError::ClusterNotFound(cluster_id));
        }
        let mut running: Vec<Deployment> = self
            .registry
            .allocated_on(cluster_id)
            .await
            .into_iter()
            .filter(|d| d.kind() == StateKind::Running)
            .collect();
        running.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        Ok(running.iter().map(DeploymentStatus::from).collect())
    }

    pub async fn status(&self) -> EngineStatus {
        let counts = self.registry.count_by_state().await;
        let count = |kind: StateKind| counts.get(&kind).copied().unwrap_or(0);

        EngineStatus {
            clusters: self.ledger.cluster_ids().await.len(),
            deployments: counts.values().sum(),
            pending: count(StateKind::Pending),
            scheduled: count(StateKind::Scheduled),
            running: count(StateKind::Running),
            preempted: count(StateKind::Preempted),
            failed: count(StateKind::Failed),
            completed: count(StateKind::Completed),
            queue_length: self.queue.lock().await.len(),
            executor: self.executor.name().to_string(),
            store: self.store.name().to_string(),
            reevaluating: self.reevaluating.load(Ordering::Acquire),
        }
    }

    // ---------------------------------------------------------------
    // Re-evaluation and retry
    // ---------------------------------------------------------------

    /// Walk the queue highest-priority-first and retry admission
    ///
    /// Only one pass runs at a time; a concurrent call returns a skipped
    /// report immediately.
    pub async fn reevaluate(&self) -> BerthResult<ReevaluationReport> {
        if self
            .reevaluating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Re-evaluation already in flight, skipping");
            return Ok(ReevaluationReport::skipped());
        }
        let _guard = PassGuard(&self.reevaluating);

        let snapshot = self.queue.lock().await.drain();
        let mut report = ReevaluationReport::default();
        if snapshot.is_empty() {
            return Ok(report);
        }

        let totals: HashMap<ClusterId, ResourceVector> = self
            .ledger
            .clusters()
            .await
            .into_iter()
            .map(|c| (c.id, c.capacity))
            .collect();
        let mut blocked: HashSet<ClusterId> = HashSet::new();

        for entry in snapshot {
            if !totals.is_empty() && blocked.len() == totals.len() {
                break;
            }
            report.examined += 1;
            let id = entry.deployment_id;

            let deployment = match self.registry.get(id).await {
                Ok(deployment) => deployment,
                Err(_) => {
                    warn!(deployment_id = %id, "Dropping queue entry without a deployment");
                    self.queue.lock().await.remove(id);
                    continue;
                }
            };

            match self.try_admit(id, &blocked).await {
                Ok(AdmitOutcome::Admitted(admitted)) => {
                    report.admitted.push(id);
                    report
                        .preempted
                        .extend(admitted.victims.iter().map(|(d, _)| d.id));
                    match self.finish_admission(admitted).await {
                        Ok(started) if started.kind() == StateKind::Failed => report.failed.push(id),
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            warn!(deployment_id = %id, error = %e, "Failed to start admitted deployment");
                        }
                    }
                }
                Ok(AdmitOutcome::Blocked) => {
                    let candidates: Vec<ClusterId> = match deployment.cluster_id {
                        Some(pinned) => vec![pinned],
                        None => totals.keys().copied().collect(),
                    };
                    for cluster_id in candidates {
                        let holds = totals
                            .get(&cluster_id)
                            .is_some_and(|total| deployment.resources.fits_within(total));
                        if holds && blocked.insert(cluster_id) {
                            debug!(cluster_id = %cluster_id, deployment_id = %id, "Cluster blocked for this pass");
                        }
                    }
                }
                Ok(AdmitOutcome::Skipped) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(deployment_id = %id, error = %e, "Admission attempt failed");
                }
            }
        }

        self.persist_queue().await;
        report.still_pending = self.queue.lock().await.len();

        info!(
            examined = report.examined,
            admitted = report.admitted.len(),
            preempted = report.preempted.len(),
            still_pending = report.still_pending,
            "Re-evaluation pass finished"
        );
        Ok(report)
    }

    /// Deployments whose backoff expired; triggers a re-evaluation when any exist
    ///
    /// Each expired backoff is cleared as it is reported, so an entry that
    /// still cannot be placed does not trigger a pass on every tick.
    pub async fn retry_due(&self) -> BerthResult<Vec<DeploymentId>> {
        let now = self.clock.now();
        let deployments = self.registry.list().await;
        let due = self.retry.due(&deployments, now);
        for &id in &due {
            let cleared = self
                .registry
                .update(id, |d| Ok(self.retry.clear_expired(d, now).then(|| d.clone())))
                .await;
            if let Ok(Some(deployment)) = cleared {
                self.persist(&deployment).await;
            }
        }
        if !due.is_empty() {
            info!(count = due.len(), "Backoff expired, re-evaluating queue");
            self.reevaluate().await?;
        }
        Ok(due)
    }

    // ---------------------------------------------------------------
    // Executor callbacks
    // ---------------------------------------------------------------

    /// Route an executor outcome to the matching callback
    pub async fn handle_event(&self, event: ExecutorEvent) -> BerthResult<DeploymentStatus> {
        match event {
            ExecutorEvent::Completed {
                deployment_id,
                allocation_id,
            } => {
                self.confirm_completed(deployment_id, Some(allocation_id))
                    .await
            }
            ExecutorEvent::Failed {
                deployment_id,
                allocation_id,
                reason,
            } => {
                self.report_failure(deployment_id, allocation_id, reason)
                    .await
            }
        }
    }

    /// Mark a running deployment completed and release its allocation
    ///
    /// With `allocation_id` set, a completion for an allocation the deployment
    /// no longer holds is ignored.
    pub async fn confirm_completed(
        &self,
        id: DeploymentId,
        allocation_id: Option<AllocationId>,
    ) -> BerthResult<DeploymentStatus> {
        let deployment = self.registry.get(id).await?;
        let allocation = match deployment.allocation() {
            Some(a) if allocation_id.map_or(true, |expected| expected == a.id) => a.clone(),
            _ if allocation_id.is_some() => {
                debug!(deployment_id = %id, "Ignoring completion of a superseded allocation");
                return Ok(DeploymentStatus::from(&deployment));
            }
            _ => {
                return Err(BerthError::InvalidState {
                    deployment: id,
                    state: deployment.kind(),
                    reason: "only scheduled or running deployments can complete".to_string(),
                })
            }
        };

        let now = self.clock.now();
        let mut account = self.ledger.lock(allocation.cluster_id).await?;
        let updated = self
            .registry
            .update(id, |d| {
                if d.allocation().map(|a| a.id) != Some(allocation.id) {
                    return Ok(None);
                }
                account.release(allocation.id)?;
                if d.kind() == StateKind::Scheduled {
                    apply_transition(
                        d,
                        DeploymentState::Running {
                            allocation: allocation.clone(),
                            started_at: now,
                        },
                        TransitionCause::Started,
                        now,
                    )?;
                }
                apply_transition(d, DeploymentState::Completed, TransitionCause::Completed, now)?;
                Ok(Some(d.clone()))
            })
            .await?;
        drop(account);

        match updated {
            Some(deployment) => {
                info!(
                    deployment_id = %id,
                    cluster_id = %allocation.cluster_id,
                    "Deployment completed"
                );
                self.persist(&deployment).await;
                Ok(DeploymentStatus::from(&deployment))
            }
            None => self.get_status(id).await,
        }
    }

    /// Report that a started workload crashed
    ///
    /// Returns `RetryBudgetExhausted` when this failure made the deployment
    /// terminally failed.
    pub async fn report_failure(
        &self,
        id: DeploymentId,
        allocation_id: AllocationId,
        reason: String,
    ) -> BerthResult<DeploymentStatus> {
        let (deployment, decision) = self
            .handle_failure(id, allocation_id, reason, TransitionCause::RuntimeFailure)
            .await?;
        match decision {
            Some(RetryDecision::Exhausted { failures }) => Err(BerthError::RetryBudgetExhausted {
                deployment: id,
                failures,
            }),
            _ => Ok(DeploymentStatus::from(&deployment)),
        }
    }

    // ---------------------------------------------------------------
    // Restart
    // ---------------------------------------------------------------

    /// Rebuild engine state from the store
    ///
    /// Running allocations are re-reserved in the ledger. Deployments caught
    /// between admission and executor acknowledgment go back to pending.
    pub async fn restore(&self) -> BerthResult<usize> {
        let snapshot = self.store.load().await?;
        if snapshot.is_empty() {
            return Ok(0);
        }
        let now = self.clock.now();

        for cluster in snapshot.clusters {
            match self.ledger.register(cluster).await {
                Ok(()) | Err(BerthError::ClusterExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut running: HashMap<ClusterId, Vec<Allocation>> = HashMap::new();
        for deployment in &snapshot.deployments {
            if let DeploymentState::Running { allocation, .. } = &deployment.state {
                running
                    .entry(allocation.cluster_id)
                    .or_default()
                    .push(allocation.clone());
            }
        }

        let mut rejected: HashSet<AllocationId> = HashSet::new();
        for (cluster_id, allocations) in running {
            match self.ledger.restore(cluster_id, allocations.clone()).await {
                Ok(lost) => rejected.extend(lost.iter().map(|a| a.id)),
                Err(BerthError::ClusterNotFound(_)) => {
                    warn!(cluster_id = %cluster_id, "Running allocations reference an unknown cluster");
                    rejected.extend(allocations.iter().map(|a| a.id));
                }
                Err(e) => return Err(e),
            }
        }

        let mut requeue: Vec<Deployment> = Vec::new();
        let mut restored = 0;

        for mut deployment in snapshot.deployments {
            restored += 1;
            let cause = match &deployment.state {
                DeploymentState::Running { allocation, .. } if rejected.contains(&allocation.id) => {
                    warn!(deployment_id = %deployment.id, "Could not re-reserve running allocation, requeueing");
                    Some(TransitionCause::Restored)
                }
                DeploymentState::Scheduled { .. } => Some(TransitionCause::Restored),
                DeploymentState::Preempted { .. } => Some(TransitionCause::Requeued),
                _ => None,
            };
            if let Some(cause) = cause {
                apply_transition(&mut deployment, DeploymentState::Pending, cause, now)?;
            }
            if deployment.kind() == StateKind::Pending {
                requeue.push(deployment.clone());
            }
            self.registry.insert(deployment).await;
        }

        {
            let pending: HashSet<DeploymentId> = requeue.iter().map(|d| d.id).collect();
            let mut queue = self.queue.lock().await;
            for entry in snapshot.queue {
                if pending.contains(&entry.deployment_id) {
                    queue.restore(entry);
                }
            }
            for deployment in &requeue {
                queue.enqueue(deployment.id, deployment.priority, deployment.updated_at);
            }
        }

        for deployment in &requeue {
            self.persist(deployment).await;
        }
        self.persist_queue().await;

        info!(
            deployments = restored,
            queued = requeue.len(),
            "Restored scheduler state"
        );
        Ok(restored)
    }

    // ---------------------------------------------------------------
    // Admission internals
    // ---------------------------------------------------------------

    /// Whether any eligible cluster's total capacity can hold the request
    async fn could_ever_fit(&self, deployment: &Deployment) -> bool {
        let targets = match deployment.cluster_id {
            Some(id) => vec![id],
            None => self.ledger.cluster_ids().await,
        };
        for id in targets {
            if let Ok(cluster) = self.ledger.cluster(id).await {
                if deployment.resources.fits_within(&cluster.capacity) {
                    return true;
                }
            }
        }
        false
    }

    async fn cluster_views(&self, targets: &[ClusterId]) -> BerthResult<Vec<ClusterView>> {
        let mut views = Vec::with_capacity(targets.len());
        for &cluster_id in targets {
            let account = self.ledger.lock(cluster_id).await?;
            views.push(ClusterView {
                cluster_id,
                total: account.total(),
                available: account.available(),
            });
        }
        Ok(views)
    }

    /// Running deployments on the locked cluster as eviction candidates
    async fn preemption_candidates(&self, account: &ClusterAccount) -> Vec<PreemptionCandidate> {
        self.registry
            .allocated_on(account.cluster().id)
            .await
            .into_iter()
            .filter_map(|d| match d.state {
                DeploymentState::Running {
                    allocation,
                    started_at,
                } if account.allocation(allocation.id).is_some() => Some(PreemptionCandidate {
                    deployment_id: d.id,
                    allocation_id: allocation.id,
                    priority: d.priority,
                    resources: allocation.resources,
                    started_at,
                }),
                _ => None,
            })
            .collect()
    }

    async fn plan_preemption(
        &self,
        account: &ClusterAccount,
        deployment: &Deployment,
    ) -> Option<VictimSet> {
        let candidates = self.preemption_candidates(account).await;
        self.selector.find_victims(
            account.cluster().id,
            &candidates,
            &account.available(),
            &deployment.resources,
            deployment.priority,
        )
    }

    /// Try direct admission, then preemption, on every eligible cluster
    async fn try_admit(
        &self,
        id: DeploymentId,
        blocked: &HashSet<ClusterId>,
    ) -> BerthResult<AdmitOutcome> {
        let deployment = self.registry.get(id).await?;
        if !self.retry.is_eligible(&deployment, self.clock.now()) {
            return Ok(AdmitOutcome::Skipped);
        }

        let targets: Vec<ClusterId> = match deployment.cluster_id {
            Some(pinned) => vec![pinned],
            None => self.ledger.cluster_ids().await,
        }
        .into_iter()
        .filter(|c| !blocked.contains(c))
        .collect();
        if targets.is_empty() {
            return Ok(AdmitOutcome::Blocked);
        }

        let views = self.cluster_views(&targets).await?;
        let ranked = self
            .placement
            .rank(&deployment.resources, &views, deployment.last_cluster);
        for cluster_id in ranked {
            let account = self.ledger.lock(cluster_id).await?;
            if !account.would_fit(&deployment.resources) {
                continue;
            }
            return self.commit(account, &deployment, None).await;
        }

        let mut best: Option<VictimSet> = None;
        for &cluster_id in &targets {
            let account = self.ledger.lock(cluster_id).await?;
            if let Some(plan) = self.plan_preemption(&account, &deployment).await {
                if best.as_ref().map_or(true, |b| plan.rank() < b.rank()) {
                    best = Some(plan);
                }
            }
        }

        if let Some(plan) = best {
            // Re-validate under the lock that covers eviction and admission.
            let account = self.ledger.lock(plan.cluster_id).await?;
            if let Some(plan) = self.plan_preemption(&account, &deployment).await {
                return self.commit(account, &deployment, Some(plan)).await;
            }
            debug!(deployment_id = %id, "Preemption plan invalidated before commit");
        }

        Ok(AdmitOutcome::Blocked)
    }

    /// Evict victims and bind the deployment, all under the cluster lock
    ///
    /// The requester is claimed and every victim re-checked under one registry
    /// lock before anything is released, so a concurrent withdrawal or a
    /// competing admission leaves the cluster untouched.
    async fn commit(
        &self,
        mut account: AccountGuard,
        deployment: &Deployment,
        plan: Option<VictimSet>,
    ) -> BerthResult<AdmitOutcome> {
        let now = self.clock.now();
        let cluster = account.cluster().clone();

        let plan = plan.filter(|p| !p.is_empty());
        if let Some(plan) = &plan {
            if let Err(e) = verify_victims(deployment.id, deployment.priority, plan) {
                error!(deployment_id = %deployment.id, error = %e, "Preemption plan violates priority ordering");
                return Err(e);
            }
        }
        let planned = plan.as_ref().map(|p| p.victims.as_slice()).unwrap_or_default();
        let allocation = Allocation::new(deployment.id, cluster.id, deployment.resources, now);

        let committed = self
            .registry
            .update_many(|deployments| {
                match deployments.get(&deployment.id).map(Deployment::kind) {
                    Some(StateKind::Pending) => {}
                    state => {
                        debug!(deployment_id = %deployment.id, state = ?state, "Deployment left the queue before commit");
                        return Ok(None);
                    }
                }

                let mut freed = account.available();
                for victim in planned {
                    let held = account.allocation(victim.allocation_id).map(|a| a.resources);
                    let running = deployments.get(&victim.deployment_id).is_some_and(|d| {
                        d.kind() == StateKind::Running
                            && d.allocation().map(|a| a.id) == Some(victim.allocation_id)
                    });
                    match held {
                        Some(resources) if running => {
                            freed = freed.checked_add(&resources).ok_or_else(|| {
                                BerthError::Internal("freed resources overflow".to_string())
                            })?;
                        }
                        _ => {
                            debug!(deployment_id = %victim.deployment_id, "Preemption victim changed before commit");
                            return Ok(None);
                        }
                    }
                }
                if !deployment.resources.fits_within(&freed) {
                    return Ok(None);
                }

                let mut victims = Vec::with_capacity(planned.len());
                for victim in planned {
                    let released = account.release(victim.allocation_id)?;
                    let evicted = deployments
                        .get_mut(&victim.deployment_id)
                        .ok_or(BerthError::DeploymentNotFound(victim.deployment_id))?;
                    apply_transition(
                        evicted,
                        DeploymentState::Preempted { by: deployment.id },
                        TransitionCause::PreemptedBy(deployment.id),
                        now,
                    )?;
                    self.retry.record_preemption(evicted);
                    apply_transition(evicted, DeploymentState::Pending, TransitionCause::Requeued, now)?;
                    victims.push((evicted.clone(), released));
                }

                account.reserve(allocation.clone())?;
                let requester = deployments
                    .get_mut(&deployment.id)
                    .ok_or(BerthError::DeploymentNotFound(deployment.id))?;
                self.retry.record_admission(requester);
                apply_transition(
                    requester,
                    DeploymentState::Scheduled {
                        allocation: allocation.clone(),
                    },
                    TransitionCause::Admitted,
                    now,
                )?;
                Ok(Some((requester.clone(), victims)))
            })
            .await?;

        let (scheduled, victims) = match committed {
            Some(committed) => committed,
            None => return Ok(AdmitOutcome::Skipped),
        };

        {
            let mut queue = self.queue.lock().await;
            queue.remove(deployment.id);
            for (victim, _) in &victims {
                queue.enqueue(victim.id, victim.priority, now);
            }
        }
        drop(account);

        for (victim, _) in &victims {
            warn!(
                deployment_id = %victim.id,
                preempted_by = %deployment.id,
                cluster_id = %cluster.id,
                victim_priority = %victim.priority,
                requester_priority = %deployment.priority,
                "Deployment preempted"
            );
        }
        info!(
            deployment_id = %deployment.id,
            cluster_id = %cluster.id,
            cluster = %cluster.name,
            allocation_id = %allocation.id,
            victims = victims.len(),
            "Deployment admitted"
        );

        Ok(AdmitOutcome::Admitted(Admitted {
            deployment: scheduled,
            cluster,
            allocation,
            victims,
        }))
    }

    /// Persist an admission, stop its victims and start the deployment
    async fn finish_admission(&self, admitted: Admitted) -> BerthResult<Deployment> {
        self.persist(&admitted.deployment).await;
        for (victim, _) in &admitted.victims {
            self.persist(victim).await;
        }
        self.persist_queue().await;

        let stops = admitted
            .victims
            .iter()
            .map(|(victim, allocation)| self.executor.stop(victim, allocation));
        for (result, (victim, _)) in join_all(stops).await.into_iter().zip(&admitted.victims) {
            if let Err(e) = result {
                warn!(deployment_id = %victim.id, error = %e, "Failed to stop preempted deployment");
            }
        }

        let id = admitted.deployment.id;
        match self
            .executor
            .start(&admitted.deployment, &admitted.cluster, &admitted.allocation)
            .await
        {
            Ok(()) => self.mark_running(id, admitted.allocation.id).await,
            Err(e) => {
                warn!(deployment_id = %id, error = %e, "Executor failed to start deployment");
                self.handle_failure(
                    id,
                    admitted.allocation.id,
                    e.to_string(),
                    TransitionCause::StartFailure,
                )
                .await
                .map(|(deployment, _)| deployment)
            }
        }
    }

    async fn mark_running(&self, id: DeploymentId, allocation_id: AllocationId) -> BerthResult<Deployment> {
        let now = self.clock.now();
        let deployment = self
            .registry
            .update(id, |d| {
                let scheduled = match &d.state {
                    DeploymentState::Scheduled { allocation } if allocation.id == allocation_id => {
                        Some(allocation.clone())
                    }
                    _ => None,
                };
                match scheduled {
                    Some(allocation) => apply_transition(
                        d,
                        DeploymentState::Running {
                            allocation,
                            started_at: now,
                        },
                        TransitionCause::Started,
                        now,
                    )?,
                    None => debug!(
                        deployment_id = %id,
                        state = %d.kind(),
                        "Start acknowledged for a superseded allocation"
                    ),
                }
                Ok(d.clone())
            })
            .await?;
        self.persist(&deployment).await;
        Ok(deployment)
    }

    /// Release the allocation of a failed start or run and apply the retry policy
    ///
    /// The decision is `None` when the failure referred to an allocation the
    /// deployment no longer holds.
    async fn handle_failure(
        &self,
        id: DeploymentId,
        allocation_id: AllocationId,
        reason: String,
        cause: TransitionCause,
    ) -> BerthResult<(Deployment, Option<RetryDecision>)> {
        let deployment = self.registry.get(id).await?;
        let cluster_id = match deployment.allocation() {
            Some(a) if a.id == allocation_id => a.cluster_id,
            _ => {
                debug!(deployment_id = %id, "Ignoring failure of a superseded allocation");
                return Ok((deployment, None));
            }
        };

        let now = self.clock.now();
        let mut account = self.ledger.lock(cluster_id).await?;
        let outcome = self
            .registry
            .update(id, |d| {
                if d.allocation().map(|a| a.id) != Some(allocation_id) {
                    return Ok(None);
                }
                account.release(allocation_id)?;
                let decision = self.retry.record_failure(d, now);
                match decision {
                    RetryDecision::Backoff { .. } => {
                        apply_transition(d, DeploymentState::Pending, cause, now)?;
                        d.failure_reason = Some(reason.clone());
                    }
                    RetryDecision::Exhausted { .. } => {
                        apply_transition(
                            d,
                            DeploymentState::Failed {
                                reason: reason.clone(),
                            },
                            TransitionCause::RetryExhausted,
                            now,
                        )?;
                    }
                }
                Ok(Some((d.clone(), decision)))
            })
            .await?;

        let (deployment, decision) = match outcome {
            Some(outcome) => outcome,
            None => {
                drop(account);
                return Ok((self.registry.get(id).await?, None));
            }
        };

        {
            let mut queue = self.queue.lock().await;
            match decision {
                RetryDecision::Backoff { .. } => {
                    queue.enqueue(id, deployment.priority, now);
                }
                RetryDecision::Exhausted { .. } => {
                    queue.remove(id);
                }
            }
        }
        drop(account);

        match decision {
            RetryDecision::Backoff { next_retry_at, .. } => info!(
                deployment_id = %id,
                failures = deployment.failure_count,
                next_retry_at = %next_retry_at,
                reason = %reason,
                "Deployment failed, retry scheduled"
            ),
            RetryDecision::Exhausted { failures } => error!(
                deployment_id = %id,
                failures = failures,
                reason = %reason,
                "Deployment failed permanently"
            ),
        }

        self.persist(&deployment).await;
        self.persist_queue().await;
        Ok((deployment, Some(decision)))
    }

    // ---------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------

    async fn persist(&self, deployment: &Deployment) {
        if let Err(e) = self.store.save_deployment(deployment).await {
            error!(deployment_id = %deployment.id, error = %e, "Failed to persist deployment");
        }
    }

    async fn persist_queue(&self) {
        let entries = self.queue.lock().await.entries();
        if let Err(e) = self.store.save_queue(&entries).await {
            error!(error = %e, "Failed to persist queue");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use berth_core::{ManualClock, Priority};
    use berth_store::MemoryStore;

    /// Executor that acknowledges every start
    struct AcceptAll;

    #[async_trait]
    impl Executor for AcceptAll {
        async fn start(&self, _: &Deployment, _: &Cluster, _: &Allocation) -> BerthResult<()> {
            Ok(())
        }

        async fn stop(&self, _: &Deployment, _: &Allocation) -> BerthResult<()> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            "accept-all"
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(
            SchedulerOptions::default(),
            Arc::new(AcceptAll),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::default()),
        )
    }

    fn cluster_spec(name: &str, cpu: u64) -> ClusterSpec {
        ClusterSpec {
            id: None,
            name: name.to_string(),
            organisation_id: None,
            capacity: ResourceVector::units(cpu, 1024, 0),
        }
    }

    fn request(name: &str, cpu: u64, priority: u32) -> DeploymentRequest {
        DeploymentRequest::new(
            name.to_string(),
            "image".to_string(),
            ResourceVector::units(cpu, 0, 0),
            Priority(priority),
        )
    }

    #[tokio::test]
    async fn test_submit_admits_directly() {
        let scheduler = scheduler();
        let cluster = scheduler.register_cluster(cluster_spec("c", 8)).await.unwrap();

        let status = scheduler.submit(request("a", 4, 1)).await.unwrap();
        assert_eq!(status.state, StateKind::Running);
        assert_eq!(status.cluster_id, Some(cluster.id));

        let report = scheduler.cluster_report(cluster.id).await.unwrap();
        assert_eq!(report.available, ResourceVector::units(4, 1024, 0));
        assert_eq!(scheduler.list_running(cluster.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_submit_to_unknown_cluster() {
        let scheduler = scheduler();
        let err = scheduler
            .submit(request("a", 1, 1).on_cluster(uuid::Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, BerthError::ClusterNotFound(_)));
    }

    #[tokio::test]
    async fn test_tightest_fit_cluster_chosen() {
        let scheduler = scheduler();
        scheduler.register_cluster(cluster_spec("big", 64)).await.unwrap();
        let small = scheduler.register_cluster(cluster_spec("small", 4)).await.unwrap();

        let status = scheduler.submit(request("a", 4, 1)).await.unwrap();
        assert_eq!(status.cluster_id, Some(small.id));
    }

    #[tokio::test]
    async fn test_withdraw_pending_only() {
        let scheduler = scheduler();
        let cluster = scheduler.register_cluster(cluster_spec("c", 4)).await.unwrap();

        let running = scheduler.submit(request("a", 4, 1)).await.unwrap();
        let queued = scheduler.submit(request("b", 4, 1)).await.unwrap();
        assert_eq!(queued.state, StateKind::Pending);

        let err = scheduler.withdraw(running.id).await.unwrap_err();
        assert!(matches!(err, BerthError::InvalidState { .. }));

        scheduler.withdraw(queued.id).await.unwrap();
        assert!(scheduler.list_pending().await.is_empty());
        assert!(matches!(
            scheduler.get_status(queued.id).await.unwrap_err(),
            BerthError::DeploymentNotFound(_)
        ));
        assert_eq!(scheduler.list_running(cluster.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_complete_frees_capacity() {
        let scheduler = scheduler();
        let cluster = scheduler.register_cluster(cluster_spec("c", 4)).await.unwrap();

        let first = scheduler.submit(request("a", 4, 1)).await.unwrap();
        let second = scheduler.submit(request("b", 4, 1)).await.unwrap();
        assert_eq!(second.state, StateKind::Pending);

        let done = scheduler.confirm_completed(first.id, None).await.unwrap();
        assert_eq!(done.state, StateKind::Completed);
        assert!(done.allocation.is_none());

        let report = scheduler.reevaluate().await.unwrap();
        assert_eq!(report.admitted, vec![second.id]);
        assert_eq!(
            scheduler.get_status(second.id).await.unwrap().cluster_id,
            Some(cluster.id)
        );

        let err = scheduler.confirm_completed(first.id, None).await.unwrap_err();
        assert!(matches!(err, BerthError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_stale_completion_ignored() {
        let scheduler = scheduler();
        scheduler.register_cluster(cluster_spec("c", 4)).await.unwrap();
        let running = scheduler.submit(request("a", 2, 1)).await.unwrap();

        let status = scheduler
            .confirm_completed(running.id, Some(uuid::Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(status.state, StateKind::Running);
    }

    /// Put a deployment in the registry and queue without attempting admission
    async fn enqueue_only(scheduler: &Scheduler, request: DeploymentRequest) -> Deployment {
        let deployment = Deployment::new(request, scheduler.clock.now());
        scheduler.registry.insert(deployment.clone()).await;
        scheduler
            .queue
            .lock()
            .await
            .enqueue(deployment.id, deployment.priority, deployment.created_at);
        deployment
    }

    #[tokio::test]
    async fn test_commit_after_withdraw_leaves_victims_running() {
        let scheduler = scheduler();
        let cluster = scheduler.register_cluster(cluster_spec("c", 4)).await.unwrap();
        let low = scheduler.submit(request("low", 4, 1)).await.unwrap();
        let high = enqueue_only(&scheduler, request("high", 4, 9)).await;

        let account = scheduler.ledger.lock(cluster.id).await.unwrap();
        let plan = scheduler.plan_preemption(&account, &high).await.unwrap();
        assert_eq!(plan.victims.len(), 1);

        // Withdrawal does not wait for the cluster lock.
        scheduler.withdraw(high.id).await.unwrap();
        let outcome = scheduler.commit(account, &high, Some(plan)).await.unwrap();
        assert!(matches!(outcome, AdmitOutcome::Skipped));

        let low = scheduler.get_deployment(low.id).await.unwrap();
        assert_eq!(low.kind(), StateKind::Running);
        assert_eq!(low.preempted_count, 0);
        let report = scheduler.cluster_report(cluster.id).await.unwrap();
        assert_eq!(report.allocated, ResourceVector::units(4, 0, 0));
        assert_eq!(report.allocations, 1);
        assert!(scheduler.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_commit_claims_deployment_once() {
        let scheduler = scheduler();
        let east = scheduler.register_cluster(cluster_spec("east", 8)).await.unwrap();
        let west = scheduler.register_cluster(cluster_spec("west", 8)).await.unwrap();
        let pending = enqueue_only(&scheduler, request("a", 2, 1)).await;

        let account = scheduler.ledger.lock(east.id).await.unwrap();
        let first = scheduler.commit(account, &pending, None).await.unwrap();
        assert!(matches!(first, AdmitOutcome::Admitted(_)));

        // A competing admission holding the same stale copy loses.
        let account = scheduler.ledger.lock(west.id).await.unwrap();
        let second = scheduler.commit(account, &pending, None).await.unwrap();
        assert!(matches!(second, AdmitOutcome::Skipped));

        let east = scheduler.cluster_report(east.id).await.unwrap();
        let west = scheduler.cluster_report(west.id).await.unwrap();
        assert_eq!(east.allocated, ResourceVector::units(2, 0, 0));
        assert!(west.allocated.is_zero());
        assert_eq!(
            scheduler.get_status(pending.id).await.unwrap().state,
            StateKind::Scheduled
        );
    }

    #[tokio::test]
    async fn test_reevaluate_single_flight() {
        let scheduler = scheduler();
        scheduler.reevaluating.store(true, Ordering::Release);
        let report = scheduler.reevaluate().await.unwrap();
        assert!(report.skipped);

        scheduler.reevaluating.store(false, Ordering::Release);
        let report = scheduler.reevaluate().await.unwrap();
        assert!(!report.skipped);
        assert_eq!(report.examined, 0);
        assert!(!scheduler.reevaluating.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_resource_report_includes_observed_sample() {
        let scheduler = scheduler();
        let cluster = scheduler.register_cluster(cluster_spec("c", 8)).await.unwrap();
        scheduler.submit(request("a", 2, 1)).await.unwrap();

        scheduler
            .record_utilization(UtilizationSample {
                cluster_id: cluster.id,
                used: ResourceVector::units(1, 100, 0),
                sampled_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let report = scheduler.resource_report().await;
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].allocated, ResourceVector::units(2, 0, 0));
        assert_eq!(report[0].utilization.cpu, 25.0);
        assert_eq!(
            report[0].observed.as_ref().map(|s| s.used),
            Some(ResourceVector::units(1, 100, 0))
        );

        assert_eq!(scheduler.capture_utilization().await, 1);
        assert_eq!(scheduler.utilization_history(cluster.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let scheduler = scheduler();
        scheduler.register_cluster(cluster_spec("c", 4)).await.unwrap();
        scheduler.submit(request("a", 4, 1)).await.unwrap();
        scheduler.submit(request("b", 4, 1)).await.unwrap();

        let status = scheduler.status().await;
        assert_eq!(status.clusters, 1);
        assert_eq!(status.deployments, 2);
        assert_eq!(status.running, 1);
        assert_eq!(status.pending, 1);
        assert_eq!(status.queue_length, 1);
        assert_eq!(status.executor, "accept-all");
    }
}
