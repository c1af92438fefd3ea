//! Background tasks: periodic timers and the executor event pump

use berth_core::SchedulerConfig;
use berth_runtime::EventReceiver;
use berth_scheduler::Scheduler;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

/// Start the re-evaluation, retry expiry and utilization capture timers
pub fn spawn_timers(
    scheduler: Arc<Scheduler>,
    config: &SchedulerConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let s = scheduler.clone();
    handles.push(every(
        "reevaluate",
        config.reevaluate_interval_secs,
        shutdown.clone(),
        move || {
            let s = s.clone();
            async move {
                if let Err(e) = s.reevaluate().await {
                    error!(error = %e, "Periodic re-evaluation failed");
                }
            }
        },
    ));

    let s = scheduler.clone();
    handles.push(every(
        "retry",
        config.retry_check_interval_secs,
        shutdown.clone(),
        move || {
            let s = s.clone();
            async move {
                if let Err(e) = s.retry_due().await {
                    error!(error = %e, "Retry check failed");
                }
            }
        },
    ));

    handles.push(every(
        "utilization",
        config.utilization_capture_interval_secs,
        shutdown,
        move || {
            let s = scheduler.clone();
            async move {
                s.capture_utilization().await;
            }
        },
    ));

    handles
}

/// Run `tick` every `secs` seconds until shutdown; zero disables the timer
fn every<F, Fut>(
    name: &'static str,
    secs: u64,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if secs == 0 {
            debug!(timer = name, "Timer disabled");
            return;
        }
        let mut interval = tokio::time::interval(Duration::from_secs(secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.changed() => {
                    debug!(timer = name, "Timer stopped");
                    return;
                }
            }
        }
    })
}

/// Feed executor outcomes to the scheduler
///
/// Every outcome frees capacity, so each one is followed by a re-evaluation.
pub fn spawn_event_pump(
    scheduler: Arc<Scheduler>,
    mut events: EventReceiver,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };

            let deployment_id = event.deployment_id();
            match scheduler.handle_event(event).await {
                Ok(status) => {
                    debug!(deployment_id = %deployment_id, state = %status.state, "Executor event applied")
                }
                Err(e) => warn!(deployment_id = %deployment_id, error = %e, "Executor event rejected"),
            }

            if let Err(e) = scheduler.reevaluate().await {
                error!(error = %e, "Re-evaluation after executor event failed");
            }
        }
    })
}
