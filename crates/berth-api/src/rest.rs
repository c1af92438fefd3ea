//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use berth_core::{
    AllocationId, BerthError, Cluster, ClusterResourceSnapshot, ClusterSpec, Deployment,
    DeploymentRequest, DeploymentStatus, EngineStatus, ReevaluationReport, ResourceVector,
    UtilizationSample,
};
use berth_scheduler::Scheduler;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Application state shared across handlers
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Create the API router
pub fn create_router(scheduler: Arc<Scheduler>) -> Router {
    let state = Arc::new(AppState { scheduler });

    Router::new()
        .route("/api/v1/clusters", post(register_cluster).get(list_clusters))
        .route("/api/v1/clusters/:id", get(get_cluster))
        .route("/api/v1/clusters/:id/deployments", get(list_running))
        .route(
            "/api/v1/clusters/:id/utilization",
            post(record_utilization).get(utilization_history),
        )
        .route("/api/v1/deployments", post(submit_deployment).get(list_deployments))
        .route(
            "/api/v1/deployments/:id",
            get(get_deployment).delete(withdraw_deployment),
        )
        .route("/api/v1/deployments/:id/retry", post(retry_deployment))
        .route("/api/v1/deployments/:id/complete", post(complete_deployment))
        .route("/api/v1/queue", get(list_queue))
        .route("/api/v1/reevaluate", post(reevaluate))
        .route("/api/v1/resources", get(resources))
        .route("/api/v1/status", get(get_status))
        .with_state(state)
}

/// Create the router with request tracing and, optionally, permissive CORS
pub fn create_app(scheduler: Arc<Scheduler>, cors_enabled: bool) -> Router {
    let router = create_router(scheduler).layer(TraceLayer::new_for_http());
    if cors_enabled {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Map engine errors onto HTTP status codes
fn error_response(e: BerthError) -> (StatusCode, String) {
    let status = match &e {
        BerthError::ClusterNotFound(_) | BerthError::DeploymentNotFound(_) => StatusCode::NOT_FOUND,
        BerthError::ClusterExists(_)
        | BerthError::InvalidState { .. }
        | BerthError::InvalidTransition { .. } => StatusCode::CONFLICT,
        BerthError::RetryBudgetExhausted { .. }
        | BerthError::Config(_)
        | BerthError::Api(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %e, "Request failed");
    }
    (status, e.to_string())
}

/// Register a cluster
async fn register_cluster(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<ClusterSpec>,
) -> ApiResult<(StatusCode, Json<Cluster>)> {
    if spec.name.trim().is_empty() {
        return Err(error_response(BerthError::Api(
            "cluster name must not be empty".to_string(),
        )));
    }
    info!(name = %spec.name, capacity = %spec.capacity, "Registering cluster");

    let cluster = state
        .scheduler
        .register_cluster(spec)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(cluster)))
}

async fn list_clusters(State(state): State<Arc<AppState>>) -> Json<Vec<Cluster>> {
    Json(state.scheduler.list_clusters().await)
}

/// Resource accounting for one cluster
async fn get_cluster(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ClusterResourceSnapshot>> {
    let report = state
        .scheduler
        .cluster_report(id)
        .await
        .map_err(error_response)?;
    Ok(Json(report))
}

/// Running deployments on a cluster
async fn list_running(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<DeploymentStatus>>> {
    let running = state
        .scheduler
        .list_running(id)
        .await
        .map_err(error_response)?;
    Ok(Json(running))
}

/// Utilization reading pushed by a monitor
#[derive(Debug, Deserialize)]
pub struct UtilizationReport {
    pub used: ResourceVector,
    /// Defaults to the time the report was received
    #[serde(default)]
    pub sampled_at: Option<DateTime<Utc>>,
}

async fn record_utilization(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(report): Json<UtilizationReport>,
) -> ApiResult<StatusCode> {
    state
        .scheduler
        .record_utilization(UtilizationSample {
            cluster_id: id,
            used: report.used,
            sampled_at: report.sampled_at.unwrap_or_else(Utc::now),
        })
        .await
        .map_err(error_response)?;
    Ok(StatusCode::ACCEPTED)
}

async fn utilization_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<UtilizationSample>>> {
    let samples = state
        .scheduler
        .utilization_history(id)
        .await
        .map_err(error_response)?;
    Ok(Json(samples))
}

/// Submit a deployment for admission
async fn submit_deployment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeploymentRequest>,
) -> ApiResult<(StatusCode, Json<DeploymentStatus>)> {
    if req.name.trim().is_empty() || req.image.trim().is_empty() {
        return Err(error_response(BerthError::Api(
            "deployment name and image are required".to_string(),
        )));
    }
    if req.resources.is_zero() {
        return Err(error_response(BerthError::Api(
            "deployment must request at least one resource".to_string(),
        )));
    }

    let status = state
        .scheduler
        .submit(req)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(status)))
}

async fn list_deployments(State(state): State<Arc<AppState>>) -> Json<Vec<DeploymentStatus>> {
    Json(state.scheduler.list_deployments().await)
}

/// Full deployment record including its transition history
async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Deployment>> {
    let deployment = state
        .scheduler
        .get_deployment(id)
        .await
        .map_err(error_response)?;
    Ok(Json(deployment))
}

/// Withdraw a deployment that has not been admitted
async fn withdraw_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeploymentStatus>> {
    info!(deployment_id = %id, "Withdrawing deployment");

    let status = state
        .scheduler
        .withdraw(id)
        .await
        .map_err(error_response)?;
    Ok(Json(status))
}

async fn retry_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DeploymentStatus>> {
    info!(deployment_id = %id, "Manual retry requested");

    let status = state
        .scheduler
        .manual_retry(id)
        .await
        .map_err(error_response)?;
    Ok(Json(status))
}

/// Request to mark a deployment completed
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CompleteRequest {
    /// Only complete if the deployment still holds this allocation
    #[serde(default)]
    pub allocation_id: Option<AllocationId>,
}

async fn complete_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<CompleteRequest>,
) -> ApiResult<Json<DeploymentStatus>> {
    let status = state
        .scheduler
        .confirm_completed(id, req.allocation_id)
        .await
        .map_err(error_response)?;

    // Freed capacity may admit queued work.
    if let Err(e) = state.scheduler.reevaluate().await {
        warn!(error = %e, "Re-evaluation after completion failed");
    }
    Ok(Json(status))
}

/// Pending deployments in admission order
async fn list_queue(State(state): State<Arc<AppState>>) -> Json<Vec<DeploymentStatus>> {
    Json(state.scheduler.list_pending().await)
}

async fn reevaluate(State(state): State<Arc<AppState>>) -> ApiResult<Json<ReevaluationReport>> {
    let report = state.scheduler.reevaluate().await.map_err(error_response)?;
    Ok(Json(report))
}

async fn resources(State(state): State<Arc<AppState>>) -> Json<Vec<ClusterResourceSnapshot>> {
    Json(state.scheduler.resource_report().await)
}

/// System status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub engine: EngineStatus,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        engine: state.scheduler.status().await,
    })
}
