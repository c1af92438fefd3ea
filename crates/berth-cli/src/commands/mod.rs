//! CLI commands implementation

use anyhow::{Context, Result};
use berth_core::{
    Cluster, ClusterResourceSnapshot, ClusterSpec, Deployment, DeploymentManifest,
    DeploymentRequest, DeploymentStatus, EngineStatus, Priority, Quantity, ReevaluationReport,
    ResourceVector,
};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use uuid::Uuid;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub engine: EngineStatus,
}

/// Register a cluster
pub async fn cluster_add(
    client: &ApiClient,
    name: String,
    cpu: Quantity,
    ram: Quantity,
    gpu: u32,
    organisation: Option<String>,
) -> Result<()> {
    let spec = ClusterSpec {
        id: None,
        name,
        organisation_id: organisation,
        capacity: ResourceVector::new(cpu, ram, gpu),
    };

    let response = client
        .client
        .post(client.url("/api/v1/clusters"))
        .json(&spec)
        .send()
        .await?;

    if response.status().is_success() {
        let cluster: Cluster = response.json().await?;
        println!("Cluster '{}' registered", cluster.name);
        println!("  ID: {}", cluster.id);
        println!("  Capacity: {}", cluster.capacity);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to register cluster: {}", error);
    }

    Ok(())
}

/// List clusters
pub async fn cluster_ls(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/clusters"))
        .send()
        .await?;

    if response.status().is_success() {
        let clusters: Vec<Cluster> = response.json().await?;

        if clusters.is_empty() {
            println!("No clusters registered");
        } else {
            println!("{:<36} {:<20} {:<40}", "ID", "NAME", "CAPACITY");
            println!("{}", "-".repeat(96));
            for cluster in clusters {
                println!(
                    "{:<36} {:<20} {:<40}",
                    cluster.id,
                    cluster.name,
                    cluster.capacity.to_string()
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list clusters: {}", error);
    }

    Ok(())
}

/// Load a deployment request from a TOML manifest
pub fn read_manifest(path: &Path) -> Result<DeploymentRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;
    let manifest = DeploymentManifest::parse(&content)?;
    Ok(manifest.into_request())
}

/// Build a deployment request from command-line flags
pub fn request_from_flags(
    name: Option<String>,
    image: Option<String>,
    cpu: Quantity,
    ram: Quantity,
    gpu: u32,
    priority: Priority,
    owner: Option<String>,
) -> Result<DeploymentRequest> {
    let name = name.context("a deployment name or --file is required")?;
    let image = image.context("--image is required")?;

    let mut request =
        DeploymentRequest::new(name, image, ResourceVector::new(cpu, ram, gpu), priority);
    request.owner = owner.unwrap_or_default();
    Ok(request)
}

/// Submit a deployment
pub async fn submit(
    client: &ApiClient,
    mut request: DeploymentRequest,
    cluster: Option<String>,
) -> Result<()> {
    if let Some(cluster) = cluster {
        request.cluster_id = Some(parse_cluster_id(client, &cluster).await?);
    }

    let response = client
        .client
        .post(client.url("/api/v1/deployments"))
        .json(&request)
        .send()
        .await?;

    if response.status().is_success() {
        let status: DeploymentStatus = response.json().await?;
        println!("Deployment '{}' submitted", status.name);
        print_status(&status);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to submit deployment: {}", error);
    }

    Ok(())
}

/// Get deployment status
pub async fn status(client: &ApiClient, deployment: Option<String>) -> Result<()> {
    match deployment {
        Some(name) => {
            let id = parse_deployment_id(client, &name).await?;
            let response = client
                .client
                .get(client.url(&format!("/api/v1/deployments/{}", id)))
                .send()
                .await?;

            if response.status().is_success() {
                let deployment: Deployment = response.json().await?;
                print_status(&DeploymentStatus::from(&deployment));

                if !deployment.history.is_empty() {
                    println!("\nHistory:");
                    for record in &deployment.history {
                        println!(
                            "  {} {} -> {} ({})",
                            record.at.format("%Y-%m-%d %H:%M:%S"),
                            record.from,
                            record.to,
                            record.cause
                        );
                    }
                }
            } else {
                let error = response.text().await?;
                eprintln!("Deployment not found: {}", error);
            }
        }
        None => {
            let response = client
                .client
                .get(client.url("/api/v1/deployments"))
                .send()
                .await?;

            if response.status().is_success() {
                let deployments: Vec<DeploymentStatus> = response.json().await?;
                print_table(&deployments, "No deployments found");
            } else {
                let error = response.text().await?;
                eprintln!("Failed to list deployments: {}", error);
            }
        }
    }

    Ok(())
}

/// List pending deployments
pub async fn queue(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/queue"))
        .send()
        .await?;

    if response.status().is_success() {
        let pending: Vec<DeploymentStatus> = response.json().await?;
        print_table(&pending, "Queue is empty");
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get queue: {}", error);
    }

    Ok(())
}

/// List running deployments on a cluster
pub async fn running(client: &ApiClient, cluster: String) -> Result<()> {
    let id = parse_cluster_id(client, &cluster).await?;
    let response = client
        .client
        .get(client.url(&format!("/api/v1/clusters/{}/deployments", id)))
        .send()
        .await?;

    if response.status().is_success() {
        let running: Vec<DeploymentStatus> = response.json().await?;
        print_table(&running, "No running deployments");
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list running deployments: {}", error);
    }

    Ok(())
}

/// Withdraw a pending deployment
pub async fn withdraw(client: &ApiClient, deployment: String) -> Result<()> {
    let id = parse_deployment_id(client, &deployment).await?;

    let response = client
        .client
        .delete(client.url(&format!("/api/v1/deployments/{}", id)))
        .send()
        .await?;

    if response.status().is_success() {
        println!("Deployment '{}' withdrawn", deployment);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to withdraw deployment: {}", error);
    }

    Ok(())
}

/// Retry a failed deployment
pub async fn retry(client: &ApiClient, deployment: String) -> Result<()> {
    let id = parse_deployment_id(client, &deployment).await?;

    let response = client
        .client
        .post(client.url(&format!("/api/v1/deployments/{}/retry", id)))
        .send()
        .await?;

    if response.status().is_success() {
        let status: DeploymentStatus = response.json().await?;
        println!("Deployment '{}' re-queued", status.name);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to retry deployment: {}", error);
    }

    Ok(())
}

/// Mark a deployment completed
pub async fn complete(client: &ApiClient, deployment: String) -> Result<()> {
    let id = parse_deployment_id(client, &deployment).await?;

    let response = client
        .client
        .post(client.url(&format!("/api/v1/deployments/{}/complete", id)))
        .json(&json!({}))
        .send()
        .await?;

    if response.status().is_success() {
        let status: DeploymentStatus = response.json().await?;
        println!("Deployment '{}' is {}", status.name, status.state);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to complete deployment: {}", error);
    }

    Ok(())
}

/// Trigger a re-evaluation pass
pub async fn reevaluate(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .post(client.url("/api/v1/reevaluate"))
        .send()
        .await?;

    if response.status().is_success() {
        let report: ReevaluationReport = response.json().await?;
        if report.skipped {
            println!("A re-evaluation pass is already running");
        } else {
            println!(
                "Examined {}, admitted {}, preempted {}, still pending {}",
                report.examined,
                report.admitted.len(),
                report.preempted.len(),
                report.still_pending
            );
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to re-evaluate: {}", error);
    }

    Ok(())
}

/// Show per-cluster resource usage
pub async fn resources(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/resources"))
        .send()
        .await?;

    if response.status().is_success() {
        let snapshots: Vec<ClusterResourceSnapshot> = response.json().await?;

        if snapshots.is_empty() {
            println!("No clusters registered");
        }
        for snapshot in snapshots {
            println!("{} ({})", snapshot.name, snapshot.cluster_id);
            println!("  Total:     {}", snapshot.total);
            println!("  Allocated: {}", snapshot.allocated);
            println!("  Available: {}", snapshot.available);
            println!(
                "  Usage:     cpu {:.1}%  ram {:.1}%  gpu {:.1}%",
                snapshot.utilization.cpu, snapshot.utilization.ram, snapshot.utilization.gpu
            );
            if let Some(observed) = snapshot.observed {
                println!(
                    "  Observed:  {} at {}",
                    observed.used,
                    observed.sampled_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get resources: {}", error);
    }

    Ok(())
}

/// Show system status
pub async fn top(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;

    if response.status().is_success() {
        let status: StatusResponse = response.json().await?;
        let engine = status.engine;

        println!("berth v{}", status.version);
        println!();
        println!("Clusters: {}", engine.clusters);
        println!(
            "Deployments: {} ({} running, {} scheduled, {} pending, {} failed, {} completed)",
            engine.deployments,
            engine.running,
            engine.scheduled,
            engine.pending,
            engine.failed,
            engine.completed
        );
        println!("Queue length: {}", engine.queue_length);
        println!("Executor: {}  Store: {}", engine.executor, engine.store);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get status: {}", error);
    }

    Ok(())
}

/// Helper to parse deployment ID (UUID or name)
async fn parse_deployment_id(client: &ApiClient, deployment: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(deployment) {
        return Ok(id);
    }

    let response = client
        .client
        .get(client.url("/api/v1/deployments"))
        .send()
        .await?;

    if response.status().is_success() {
        let deployments: Vec<DeploymentStatus> = response.json().await?;
        if let Some(found) = deployments.into_iter().find(|d| d.name == deployment) {
            return Ok(found.id);
        }
    }

    anyhow::bail!("Deployment '{}' not found", deployment)
}

/// Helper to parse cluster ID (UUID or name)
async fn parse_cluster_id(client: &ApiClient, cluster: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(cluster) {
        return Ok(id);
    }

    let response = client
        .client
        .get(client.url("/api/v1/clusters"))
        .send()
        .await?;

    if response.status().is_success() {
        let clusters: Vec<Cluster> = response.json().await?;
        if let Some(found) = clusters.into_iter().find(|c| c.name == cluster) {
            return Ok(found.id);
        }
    }

    anyhow::bail!("Cluster '{}' not found", cluster)
}

fn print_table(deployments: &[DeploymentStatus], empty: &str) {
    if deployments.is_empty() {
        println!("{}", empty);
        return;
    }

    println!(
        "{:<36} {:<20} {:<10} {:<8} {:<30} {:<8}",
        "ID", "NAME", "STATE", "PRIORITY", "RESOURCES", "FAILURES"
    );
    println!("{}", "-".repeat(117));
    for d in deployments {
        println!(
            "{:<36} {:<20} {:<10} {:<8} {:<30} {:<8}",
            d.id,
            d.name,
            d.state.to_string(),
            d.priority.to_string(),
            d.resources.to_string(),
            d.failure_count
        );
    }
}

/// Helper to print deployment details
fn print_status(status: &DeploymentStatus) {
    println!("Deployment: {}", status.name);
    println!("  ID: {}", status.id);
    println!("  State: {}", status.state);
    println!("  Priority: {}", status.priority);
    println!("  Resources: {}", status.resources);
    if let Some(cluster) = status.cluster_id {
        println!("  Cluster: {}", cluster);
    }
    if status.failure_count > 0 {
        println!("  Failures: {}", status.failure_count);
    }
    if status.preempted_count > 0 {
        println!("  Preempted: {} times", status.preempted_count);
    }
    if let Some(at) = status.next_retry_at {
        println!("  Next retry: {}", at.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(reason) = &status.failure_reason {
        println!("  Last failure: {}", reason);
    }
}
