//! berth CLI
//!
//! Command-line interface for interacting with the berth daemon.

mod commands;

use berth_core::{Priority, Quantity};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// berth - priority scheduling and preemption engine
#[derive(Parser, Debug)]
#[command(name = "berth")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage clusters
    Cluster {
        #[command(subcommand)]
        command: ClusterCommands,
    },

    /// Submit a deployment
    Submit {
        /// Deployment name (required unless --file is given)
        name: Option<String>,

        /// TOML deployment manifest
        #[arg(short, long, conflicts_with = "name")]
        file: Option<PathBuf>,

        /// Container image
        #[arg(long)]
        image: Option<String>,

        /// CPU cores (fractions allowed, e.g. 0.5)
        #[arg(long, default_value = "0")]
        cpu: Quantity,

        /// RAM in MB
        #[arg(long, default_value = "0")]
        ram: Quantity,

        /// Whole GPUs
        #[arg(long, default_value_t = 0)]
        gpu: u32,

        /// Priority (low, medium, high or a number)
        #[arg(long, default_value = "medium")]
        priority: Priority,

        /// Pin to a cluster (name or ID)
        #[arg(long)]
        cluster: Option<String>,

        /// Submitting user or organization
        #[arg(long)]
        owner: Option<String>,
    },

    /// Get deployment status
    Status {
        /// Deployment name or ID (optional, shows all if not provided)
        deployment: Option<String>,
    },

    /// List pending deployments in admission order
    Queue,

    /// List running deployments on a cluster
    Running {
        /// Cluster name or ID
        cluster: String,
    },

    /// Withdraw a pending deployment
    Withdraw {
        /// Deployment name or ID
        deployment: String,
    },

    /// Retry a failed deployment
    Retry {
        /// Deployment name or ID
        deployment: String,
    },

    /// Mark a deployment completed
    Complete {
        /// Deployment name or ID
        deployment: String,
    },

    /// Run a queue re-evaluation pass now
    Reevaluate,

    /// Show cluster resource usage
    Resources,

    /// Show system status
    Top,
}

#[derive(Subcommand, Debug)]
enum ClusterCommands {
    /// Register a cluster
    Add {
        /// Cluster name
        name: String,

        /// CPU cores
        #[arg(long)]
        cpu: Quantity,

        /// RAM in MB
        #[arg(long)]
        ram: Quantity,

        /// Whole GPUs
        #[arg(long, default_value_t = 0)]
        gpu: u32,

        /// Owning organization
        #[arg(long)]
        organisation: Option<String>,
    },

    /// List clusters
    Ls,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Cluster { command } => match command {
            ClusterCommands::Add {
                name,
                cpu,
                ram,
                gpu,
                organisation,
            } => {
                commands::cluster_add(&client, name, cpu, ram, gpu, organisation).await?;
            }
            ClusterCommands::Ls => {
                commands::cluster_ls(&client).await?;
            }
        },
        Commands::Submit {
            name,
            file,
            image,
            cpu,
            ram,
            gpu,
            priority,
            cluster,
            owner,
        } => {
            let request = match file {
                Some(path) => commands::read_manifest(&path)?,
                None => commands::request_from_flags(name, image, cpu, ram, gpu, priority, owner)?,
            };
            commands::submit(&client, request, cluster).await?;
        }
        Commands::Status { deployment } => {
            commands::status(&client, deployment).await?;
        }
        Commands::Queue => {
            commands::queue(&client).await?;
        }
        Commands::Running { cluster } => {
            commands::running(&client, cluster).await?;
        }
        Commands::Withdraw { deployment } => {
            commands::withdraw(&client, deployment).await?;
        }
        Commands::Retry { deployment } => {
            commands::retry(&client, deployment).await?;
        }
        Commands::Complete { deployment } => {
            commands::complete(&client, deployment).await?;
        }
        Commands::Reevaluate => {
            commands::reevaluate(&client).await?;
        }
        Commands::Resources => {
            commands::resources(&client).await?;
        }
        Commands::Top => {
            commands::top(&client).await?;
        }
    }

    Ok(())
}
