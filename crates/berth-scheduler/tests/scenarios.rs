//! End-to-end scheduling scenarios against an in-memory store

use async_trait::async_trait;
use berth_core::{
    Allocation, BerthError, BerthResult, Clock, Cluster, ClusterSpec, Deployment, DeploymentRequest,
    ManualClock, Priority, ResourceVector, RetryPolicy, StateKind, TransitionCause,
};
use berth_runtime::{Executor, ExecutorEvent};
use berth_scheduler::{Scheduler, SchedulerOptions};
use berth_store::{MemoryStore, StateStore};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Executor that refuses to start deployments whose name is listed
#[derive(Default)]
struct ScriptedExecutor {
    refuse: Mutex<HashSet<String>>,
    stopped: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn refuse(&self, name: &str) {
        self.refuse.lock().unwrap().insert(name.to_string());
    }

    fn allow(&self, name: &str) {
        self.refuse.lock().unwrap().remove(name);
    }

    fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn start(&self, deployment: &Deployment, _: &Cluster, _: &Allocation) -> BerthResult<()> {
        if self.refuse.lock().unwrap().contains(&deployment.name) {
            return Err(BerthError::ExecutorStartFailure {
                deployment: deployment.id,
                reason: "image pull failed".to_string(),
            });
        }
        Ok(())
    }

    async fn stop(&self, deployment: &Deployment, _: &Allocation) -> BerthResult<()> {
        self.stopped.lock().unwrap().push(deployment.name.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

struct Harness {
    scheduler: Scheduler,
    executor: Arc<ScriptedExecutor>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn clock_now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

fn options() -> SchedulerOptions {
    SchedulerOptions {
        retry: RetryPolicy {
            max_failures: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter_ratio: 0.0,
        },
        preemption_search_budget: 10_000,
        history_capacity: 16,
    }
}

fn harness() -> Harness {
    let executor = Arc::new(ScriptedExecutor::default());
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let scheduler = Scheduler::new(options(), executor.clone(), store.clone(), clock.clone());
    Harness {
        scheduler,
        executor,
        store,
        clock,
    }
}

fn cluster_spec(name: &str, cpu: u64) -> ClusterSpec {
    ClusterSpec {
        id: None,
        name: name.to_string(),
        organisation_id: None,
        capacity: ResourceVector::units(cpu, 0, 0),
    }
}

async fn add_cluster(scheduler: &Scheduler, name: &str, cpu: u64) -> Cluster {
    scheduler.register_cluster(cluster_spec(name, cpu)).await.unwrap()
}

fn request(name: &str, cpu: u64, priority: u32) -> DeploymentRequest {
    DeploymentRequest::new(
        name.to_string(),
        format!("registry/{}:latest", name),
        ResourceVector::units(cpu, 0, 0),
        Priority(priority),
    )
}

#[tokio::test]
async fn higher_priority_submission_preempts_running_deployment() {
    let h = harness();
    let cluster = add_cluster(&h.scheduler, "east", 10).await;

    let d1 = h.scheduler.submit(request("d1", 10, 1)).await.unwrap();
    assert_eq!(d1.state, StateKind::Running);

    let d2 = h.scheduler.submit(request("d2", 10, 5)).await.unwrap();
    assert_eq!(d2.state, StateKind::Running);
    assert_eq!(d2.cluster_id, Some(cluster.id));

    let d1 = h.scheduler.get_deployment(d1.id).await.unwrap();
    assert_eq!(d1.kind(), StateKind::Pending);
    assert_eq!(d1.preempted_count, 1);
    assert_eq!(d1.failure_count, 0);
    let causes: Vec<TransitionCause> = d1.history.iter().map(|r| r.cause.clone()).collect();
    assert_eq!(
        causes,
        vec![
            TransitionCause::Admitted,
            TransitionCause::Started,
            TransitionCause::PreemptedBy(d2.id),
            TransitionCause::Requeued,
        ]
    );

    let pending = h.scheduler.list_pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, d1.id);
    assert_eq!(h.executor.stopped(), vec!["d1".to_string()]);

    let report = h.scheduler.cluster_report(cluster.id).await.unwrap();
    assert_eq!(report.allocated, ResourceVector::units(10, 0, 0));
}

#[tokio::test]
async fn lower_priority_submission_waits_in_queue() {
    let h = harness();
    let cluster = add_cluster(&h.scheduler, "east", 10).await;

    let d1 = h.scheduler.submit(request("d1", 10, 5)).await.unwrap();
    let d2 = h.scheduler.submit(request("d2", 10, 1)).await.unwrap();

    assert_eq!(d2.state, StateKind::Pending);
    assert!(d2.allocation.is_none());
    assert_eq!(h.scheduler.get_status(d1.id).await.unwrap().state, StateKind::Running);

    let running = h.scheduler.list_running(cluster.id).await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, d1.id);
    assert!(h.executor.stopped().is_empty());
}

#[tokio::test]
async fn equal_priority_never_preempts() {
    let h = harness();
    add_cluster(&h.scheduler, "east", 10).await;

    let d1 = h.scheduler.submit(request("d1", 10, 3)).await.unwrap();
    let d2 = h.scheduler.submit(request("d2", 10, 3)).await.unwrap();

    assert_eq!(d2.state, StateKind::Pending);
    assert_eq!(h.scheduler.get_status(d1.id).await.unwrap().state, StateKind::Running);
}

#[tokio::test]
async fn repeated_start_failures_exhaust_retry_budget() {
    let h = harness();
    let cluster = add_cluster(&h.scheduler, "east", 10).await;
    h.executor.refuse("flaky");

    let status = h.scheduler.submit(request("flaky", 4, 2)).await.unwrap();
    assert_eq!(status.state, StateKind::Pending);
    assert_eq!(status.failure_count, 1);
    let first_retry = status.next_retry_at.unwrap();
    assert_eq!(first_retry, h.clock_now() + chrono::Duration::seconds(1));

    // Still backing off: the pass skips it.
    let report = h.scheduler.reevaluate().await.unwrap();
    assert!(report.admitted.is_empty());
    assert_eq!(report.still_pending, 1);

    h.clock.advance(chrono::Duration::seconds(1));
    assert_eq!(h.scheduler.retry_due().await.unwrap(), vec![status.id]);
    let status = h.scheduler.get_status(status.id).await.unwrap();
    assert_eq!(status.failure_count, 2);
    assert_eq!(
        status.next_retry_at,
        Some(h.clock_now() + chrono::Duration::seconds(2))
    );

    h.clock.advance(chrono::Duration::seconds(2));
    let report = h.scheduler.reevaluate().await.unwrap();
    assert_eq!(report.admitted, vec![status.id]);
    assert_eq!(report.failed, vec![status.id]);

    let failed = h.scheduler.get_status(status.id).await.unwrap();
    assert_eq!(failed.state, StateKind::Failed);
    assert_eq!(failed.failure_count, 3);
    assert!(h.scheduler.list_pending().await.is_empty());

    let snapshot = h.scheduler.cluster_report(cluster.id).await.unwrap();
    assert!(snapshot.allocated.is_zero());

    let retried = h.scheduler.manual_retry(status.id).await.unwrap();
    assert_eq!(retried.state, StateKind::Pending);
    assert_eq!(retried.failure_count, 0);
    assert_eq!(h.scheduler.list_pending().await.len(), 1);

    h.executor.allow("flaky");
    let report = h.scheduler.reevaluate().await.unwrap();
    assert_eq!(report.admitted, vec![status.id]);
    assert_eq!(
        h.scheduler.get_status(status.id).await.unwrap().state,
        StateKind::Running
    );
}

#[tokio::test]
async fn runtime_failure_past_budget_is_reported() {
    let h = harness();
    add_cluster(&h.scheduler, "east", 10).await;

    let status = h.scheduler.submit(request("crashy", 2, 1)).await.unwrap();
    let id = status.id;
    let mut allocation = status.allocation.unwrap().id;

    for attempt in 1..3 {
        let after = h
            .scheduler
            .handle_event(ExecutorEvent::Failed {
                deployment_id: id,
                allocation_id: allocation,
                reason: "segfault".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(after.state, StateKind::Pending);
        assert_eq!(after.failure_count, attempt);

        h.clock.advance(chrono::Duration::minutes(1));
        h.scheduler.reevaluate().await.unwrap();
        let running = h.scheduler.get_status(id).await.unwrap();
        assert_eq!(running.state, StateKind::Running);
        allocation = running.allocation.unwrap().id;
    }

    let err = h
        .scheduler
        .report_failure(id, allocation, "segfault".to_string())
        .await
        .unwrap_err();
    assert!(matches!(err, BerthError::RetryBudgetExhausted { failures: 3, .. }));
    assert_eq!(h.scheduler.get_status(id).await.unwrap().state, StateKind::Failed);
}

#[tokio::test]
async fn reevaluate_on_empty_queue_is_a_no_op() {
    let h = harness();
    add_cluster(&h.scheduler, "east", 10).await;

    let report = h.scheduler.reevaluate().await.unwrap();
    assert_eq!(report.examined, 0);
    assert!(report.admitted.is_empty());
    assert_eq!(report.still_pending, 0);
}

#[tokio::test]
async fn reevaluate_admits_highest_priority_first() {
    let h = harness();
    let cluster = add_cluster(&h.scheduler, "east", 10).await;

    let blocker = h.scheduler.submit(request("blocker", 10, 9)).await.unwrap();
    let low = h.scheduler.submit(request("low", 5, 1)).await.unwrap();
    let high = h.scheduler.submit(request("high", 8, 5)).await.unwrap();
    assert_eq!(low.state, StateKind::Pending);
    assert_eq!(high.state, StateKind::Pending);

    let pending: Vec<_> = h.scheduler.list_pending().await.into_iter().map(|s| s.id).collect();
    assert_eq!(pending, vec![high.id, low.id]);

    h.scheduler
        .handle_event(ExecutorEvent::Completed {
            deployment_id: blocker.id,
            allocation_id: blocker.allocation.unwrap().id,
        })
        .await
        .unwrap();

    let report = h.scheduler.reevaluate().await.unwrap();
    assert_eq!(report.admitted, vec![high.id]);
    assert!(report.preempted.is_empty());
    assert_eq!(report.still_pending, 1);

    assert_eq!(h.scheduler.get_status(high.id).await.unwrap().state, StateKind::Running);
    assert_eq!(h.scheduler.get_status(low.id).await.unwrap().state, StateKind::Pending);

    let snapshot = h.scheduler.cluster_report(cluster.id).await.unwrap();
    assert_eq!(snapshot.available, ResourceVector::units(2, 0, 0));
}

#[tokio::test]
async fn blocked_cluster_is_not_taken_by_lower_priority_entries() {
    let h = harness();
    let east = add_cluster(&h.scheduler, "east", 10).await;

    let holder = h.scheduler.submit(request("holder", 10, 9)).await.unwrap();
    let big = h.scheduler.submit(request("big", 8, 5)).await.unwrap();
    let low = h.scheduler.submit(request("low", 2, 1)).await.unwrap();
    assert_eq!(big.state, StateKind::Pending);
    assert_eq!(low.state, StateKind::Pending);

    h.scheduler.confirm_completed(holder.id, None).await.unwrap();
    let filler = h.scheduler.submit(request("filler", 3, 9)).await.unwrap();
    assert_eq!(filler.state, StateKind::Running);

    // `low` would fit in the 7 free units, but `big` is waiting for them.
    let report = h.scheduler.reevaluate().await.unwrap();
    assert_eq!(report.examined, 1);
    assert!(report.admitted.is_empty());
    assert_eq!(report.still_pending, 2);

    // Entries behind a blocked one may still use other clusters.
    let west = add_cluster(&h.scheduler, "west", 2).await;
    let report = h.scheduler.reevaluate().await.unwrap();
    assert_eq!(report.admitted, vec![low.id]);
    assert_eq!(
        h.scheduler.get_status(low.id).await.unwrap().cluster_id,
        Some(west.id)
    );

    h.scheduler.confirm_completed(filler.id, None).await.unwrap();
    let report = h.scheduler.reevaluate().await.unwrap();
    assert_eq!(report.admitted, vec![big.id]);
    let snapshot = h.scheduler.cluster_report(east.id).await.unwrap();
    assert_eq!(snapshot.allocated, ResourceVector::units(8, 0, 0));
}

#[tokio::test]
async fn withdraw_removes_queued_deployment_from_store() {
    let h = harness();
    add_cluster(&h.scheduler, "east", 4).await;

    h.scheduler.submit(request("holder", 4, 5)).await.unwrap();
    let queued = h.scheduler.submit(request("queued", 4, 1)).await.unwrap();
    h.scheduler.withdraw(queued.id).await.unwrap();

    let snapshot = h.store.load().await.unwrap();
    assert_eq!(snapshot.deployments.len(), 1);
    assert!(snapshot.queue.is_empty());
}

#[tokio::test]
async fn restore_rebuilds_ledger_and_queue() {
    let h = harness();
    let cluster = add_cluster(&h.scheduler, "east", 10).await;
    let running = h.scheduler.submit(request("running", 6, 5)).await.unwrap();
    let queued = h.scheduler.submit(request("queued", 6, 1)).await.unwrap();

    let restarted = Scheduler::new(
        SchedulerOptions::default(),
        h.executor.clone(),
        h.store.clone(),
        h.clock.clone(),
    );
    assert_eq!(restarted.restore().await.unwrap(), 2);

    assert_eq!(
        restarted.get_status(running.id).await.unwrap().state,
        StateKind::Running
    );
    let pending: Vec<_> = restarted.list_pending().await.into_iter().map(|s| s.id).collect();
    assert_eq!(pending, vec![queued.id]);

    let snapshot = restarted.cluster_report(cluster.id).await.unwrap();
    assert_eq!(snapshot.allocated, ResourceVector::units(6, 0, 0));
}

#[tokio::test]
async fn preemption_evicts_fewest_lowest_priority_victims() {
    let h = harness();
    let cluster = add_cluster(&h.scheduler, "east", 10).await;

    let a = h.scheduler.submit(request("a", 4, 1)).await.unwrap();
    let b = h.scheduler.submit(request("b", 4, 2)).await.unwrap();
    h.clock.advance(chrono::Duration::seconds(30));
    let c = h.scheduler.submit(request("c", 2, 1)).await.unwrap();

    // Needs 4 with nothing free: one victim suffices and the lowest priority wins.
    let urgent = h.scheduler.submit(request("urgent", 4, 7)).await.unwrap();
    assert_eq!(urgent.state, StateKind::Running);
    assert_eq!(h.scheduler.get_status(a.id).await.unwrap().state, StateKind::Pending);
    assert_eq!(h.scheduler.get_status(b.id).await.unwrap().state, StateKind::Running);
    assert_eq!(h.scheduler.get_status(c.id).await.unwrap().state, StateKind::Running);

    let snapshot = h.scheduler.cluster_report(cluster.id).await.unwrap();
    assert_eq!(snapshot.allocated, ResourceVector::units(10, 0, 0));
}

#[tokio::test]
async fn restarts_do_not_duplicate_seeded_clusters() {
    let h = harness();

    for cycle in 0..3 {
        let scheduler = Scheduler::new(options(), h.executor.clone(), h.store.clone(), h.clock.clone());
        scheduler.restore().await.unwrap();

        // Seed entries carry no ID, as in a config file.
        match scheduler.register_cluster(cluster_spec("east", 10)).await {
            Ok(_) => assert_eq!(cycle, 0),
            Err(BerthError::ClusterExists(_)) => assert!(cycle > 0),
            Err(e) => panic!("unexpected error: {}", e),
        }
        scheduler
            .submit(request(&format!("job-{}", cycle), 10, 1))
            .await
            .unwrap();

        let clusters = scheduler.list_clusters().await;
        assert_eq!(clusters.len(), 1);
        let running = scheduler.list_running(clusters[0].id).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "job-0");
        assert_eq!(scheduler.list_pending().await.len(), cycle);

        let snapshot = scheduler.cluster_report(clusters[0].id).await.unwrap();
        assert_eq!(snapshot.allocated, ResourceVector::units(10, 0, 0));
    }

    assert_eq!(h.store.load().await.unwrap().clusters.len(), 1);
}

#[tokio::test]
async fn expired_backoff_is_reported_due_once() {
    let h = harness();
    add_cluster(&h.scheduler, "east", 4).await;
    h.executor.refuse("flaky");

    let flaky = h.scheduler.submit(request("flaky", 4, 1)).await.unwrap();
    assert_eq!(flaky.state, StateKind::Pending);
    let holder = h.scheduler.submit(request("holder", 4, 9)).await.unwrap();
    assert_eq!(holder.state, StateKind::Running);

    h.clock.advance(chrono::Duration::seconds(1));
    assert_eq!(h.scheduler.retry_due().await.unwrap(), vec![flaky.id]);

    // Still no room, but the expiry has already been acted on.
    assert!(h.scheduler.retry_due().await.unwrap().is_empty());
    let status = h.scheduler.get_status(flaky.id).await.unwrap();
    assert_eq!(status.state, StateKind::Pending);
    assert_eq!(status.failure_count, 1);
    assert!(status.next_retry_at.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_keep_ledger_and_registry_consistent() {
    let h = harness();
    let scheduler = Arc::new(h.scheduler);
    let mut clusters = Vec::new();
    for (name, cpu) in [("east", 8), ("west", 6), ("north", 4)] {
        clusters.push(add_cluster(&scheduler, name, cpu).await);
    }

    let watcher = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            for _ in 0..200 {
                for snapshot in scheduler.resource_report().await {
                    assert!(snapshot.allocated.fits_within(&snapshot.total));
                }
                tokio::task::yield_now().await;
            }
        })
    };

    let mut tasks = Vec::new();
    for i in 0..60u64 {
        let scheduler = scheduler.clone();
        tasks.push(tokio::spawn(async move {
            let status = scheduler
                .submit(request(&format!("job-{}", i), 1 + i % 4, (i % 5) as u32))
                .await?;
            match i % 3 {
                0 => {
                    if let Some(allocation) = status.allocation {
                        let _ = scheduler.confirm_completed(status.id, Some(allocation.id)).await;
                    }
                }
                1 => {
                    let _ = scheduler.withdraw(status.id).await;
                }
                _ => {}
            }
            scheduler.reevaluate().await.map(|_| ())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    watcher.await.unwrap();
    scheduler.reevaluate().await.unwrap();

    let deployments = scheduler.list_deployments().await;
    let queued: HashSet<_> = scheduler
        .list_pending()
        .await
        .into_iter()
        .map(|s| s.id)
        .collect();

    for cluster in &clusters {
        let snapshot = scheduler.cluster_report(cluster.id).await.unwrap();
        assert!(snapshot.allocated.fits_within(&snapshot.total));

        let held: Vec<&Allocation> = deployments
            .iter()
            .filter_map(|d| d.allocation.as_ref())
            .filter(|a| a.cluster_id == cluster.id)
            .collect();
        assert_eq!(held.len(), snapshot.allocations);
        let sum = held
            .iter()
            .try_fold(ResourceVector::zero(), |acc, a| acc.checked_add(&a.resources))
            .unwrap();
        assert_eq!(sum, snapshot.allocated);
    }

    let mut allocation_ids = HashSet::new();
    for d in &deployments {
        match d.state {
            StateKind::Running | StateKind::Scheduled => {
                let allocation = d.allocation.as_ref().unwrap();
                assert_eq!(allocation.deployment_id, d.id);
                assert!(allocation_ids.insert(allocation.id));
                assert!(!queued.contains(&d.id));
            }
            StateKind::Pending => {
                assert!(d.allocation.is_none());
                assert!(queued.contains(&d.id));
            }
            _ => assert!(d.allocation.is_none()),
        }
    }
}
