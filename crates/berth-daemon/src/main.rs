//! berth daemon
//!
//! Main daemon process that hosts the scheduling engine and its REST API.

mod tasks;

use anyhow::Context;
use berth_api::create_app;
use berth_core::{BerthError, DaemonConfig, ExecutorKind, LoggingConfig, SystemClock};
use berth_runtime::{
    event_channel, EventSender, Executor, ProcessExecutor, ProcessExecutorConfig,
    SimulatedExecutor,
};
use berth_scheduler::{Scheduler, SchedulerOptions};
use berth_store::{FileStore, MemoryStore, StateStore};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// berthd - priority scheduling and preemption engine
#[derive(Parser, Debug)]
#[command(name = "berthd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// JSON state file; state is kept in memory when unset
    #[arg(long)]
    state_path: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<DaemonConfig, BerthError> {
        let mut config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)?,
            None => DaemonConfig::default(),
        };

        if let Some(address) = self.address {
            config.api.address = address;
        }
        if let Some(port) = self.port {
            config.api.port = port;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.json_logs {
            config.logging.format = "json".to_string();
        }
        if let Some(path) = self.state_path {
            config.storage.state_path = Some(path);
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.with_target(false).try_init()
    };
    if let Err(e) = result {
        eprintln!("failed to install log subscriber: {}", e);
    }
}

fn build_executor(config: &DaemonConfig, events: EventSender) -> Arc<dyn Executor> {
    match config.runtime.executor {
        ExecutorKind::Simulated => Arc::new(SimulatedExecutor::new(
            Duration::from_secs(config.runtime.simulated_duration_secs),
            events,
        )),
        ExecutorKind::Process => Arc::new(ProcessExecutor::new(
            ProcessExecutorConfig {
                launcher: config.runtime.launcher.clone(),
                launcher_args: config.runtime.launcher_args.clone(),
            },
            events,
        )),
    }
}

async fn build_store(config: &DaemonConfig) -> anyhow::Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match &config.storage.state_path {
        Some(path) => Arc::new(
            FileStore::open(path.clone())
                .await
                .with_context(|| format!("opening state file {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;
    init_logging(&config.logging);

    info!("Starting berth daemon v{}", env!("CARGO_PKG_VERSION"));

    let (events, event_rx) = event_channel();
    let executor = build_executor(&config, events);
    let store = build_store(&config).await?;

    let scheduler = Arc::new(Scheduler::new(
        SchedulerOptions::from_config(&config),
        executor,
        store,
        Arc::new(SystemClock),
    ));

    let restored = scheduler
        .restore()
        .await
        .context("restoring persisted state")?;
    if restored > 0 {
        info!(deployments = restored, "Recovered deployments from store");
    }

    // Seed entries are matched to restored clusters by name.
    for spec in config.clusters.clone() {
        let name = spec.name.clone();
        let capacity = spec.capacity;
        match scheduler.register_cluster(spec).await {
            Ok(cluster) => info!(cluster_id = %cluster.id, name = %name, "Registered cluster from config"),
            Err(BerthError::ClusterExists(id)) => {
                let known = scheduler.list_clusters().await.into_iter().find(|c| c.id == id);
                match known {
                    Some(cluster) if cluster.capacity != capacity => warn!(
                        cluster_id = %id,
                        name = %name,
                        configured = %capacity,
                        persisted = %cluster.capacity,
                        "Configured capacity differs from persisted cluster, keeping persisted"
                    ),
                    _ => info!(cluster_id = %id, name = %name, "Cluster already known"),
                }
            }
            Err(e) => return Err(e).context("registering configured cluster"),
        }
    }

    if let Err(e) = scheduler.reevaluate().await {
        warn!(error = %e, "Initial re-evaluation failed");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = tasks::spawn_timers(scheduler.clone(), &config.scheduler, shutdown_rx.clone());
    handles.push(tasks::spawn_event_pump(
        scheduler.clone(),
        event_rx,
        shutdown_rx,
    ));

    let app = create_app(scheduler, config.api.cors_enabled);
    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("invalid API address")?;

    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
