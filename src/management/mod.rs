//! Management surface of the driver.
//!
//! [`ManagementHandle`] issues commands to the node multiplexer and waits for the reply
//! on a oneshot channel; [`router`] exposes the same operations over HTTP.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::config::LoadBalancerConfig;
use crate::driver::{DriverState, ExecutorSummary, NodeCommand, NodeProtocol, StatsSnapshot};
use crate::error::{GridError, Result};
use crate::scheduler::JobSnapshot;
use crate::transport::MultiplexerHandle;

#[derive(Clone)]
pub struct ManagementHandle {
    state: Arc<DriverState>,
    nodes: MultiplexerHandle<NodeProtocol>,
}

impl ManagementHandle {
    pub fn new(state: Arc<DriverState>, nodes: MultiplexerHandle<NodeProtocol>) -> Self {
        Self { state, nodes }
    }

    pub async fn list_executors(&self) -> Result<Vec<ExecutorSummary>> {
        let (tx, rx) = oneshot::channel();
        self.nodes.send(NodeCommand::ListExecutors(tx))?;
        rx.await.map_err(|_| GridError::ChannelClosed)
    }

    pub fn statistics(&self) -> StatsSnapshot {
        let queued = self.state.queue.lock().len();
        self.state.stats.snapshot(queued)
    }

    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.state.queue.lock().snapshot()
    }

    /// Cancel a queued job and stop its units on the executors. Returns false when the
    /// job is not queued.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.nodes.send(NodeCommand::CancelJob { job_id, reply: tx })?;
        rx.await.map_err(|_| GridError::ChannelClosed)
    }

    pub async fn set_thread_pool_size(&self, executor: Uuid, size: usize) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.nodes.send(NodeCommand::SetThreads {
            executor,
            size,
            reply: tx,
        })?;
        rx.await.map_err(|_| GridError::ChannelClosed)?
    }

    pub fn load_balancer(&self) -> LoadBalancerConfig {
        self.state.bundlers.config()
    }

    /// Replace the load-balancer configuration. Returns the new factory generation.
    pub fn set_load_balancer(&self, config: LoadBalancerConfig) -> Result<u64> {
        let generation = self.state.bundlers.replace(config)?;
        let _ = self.nodes.send(NodeCommand::Wake);
        Ok(generation)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThreadsRequest {
    pub size: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub cancelled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub generation: u64,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(GridError);

impl From<GridError> for ApiError {
    fn from(e: GridError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GridError::JobNotFound(_) | GridError::ExecutorNotFound(_) => StatusCode::NOT_FOUND,
            GridError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            GridError::ChannelClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(handle: ManagementHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/executors", get(list_executors_handler))
        .route("/api/executors/:id/threads", post(set_threads_handler))
        .route("/api/statistics", get(statistics_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/:id/cancel", post(cancel_job_handler))
        .route(
            "/api/load-balancer",
            get(get_load_balancer_handler).put(set_load_balancer_handler),
        )
        .layer(cors)
        .with_state(handle)
}

/// Serve the management API until shutdown.
pub async fn serve(listener: TcpListener, handle: ManagementHandle, shutdown: CancellationToken) {
    let addr = listener.local_addr().ok();
    tracing::info!(addr = ?addr, "Starting management server");
    let app = router(handle);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Management server failed");
    }
}

async fn list_executors_handler(
    State(handle): State<ManagementHandle>,
) -> std::result::Result<Json<Vec<ExecutorSummary>>, ApiError> {
    Ok(Json(handle.list_executors().await?))
}

async fn statistics_handler(State(handle): State<ManagementHandle>) -> Json<StatsSnapshot> {
    Json(handle.statistics())
}

async fn list_jobs_handler(State(handle): State<ManagementHandle>) -> Json<Vec<JobSnapshot>> {
    Json(handle.jobs())
}

async fn cancel_job_handler(
    State(handle): State<ManagementHandle>,
    Path(job_id): Path<Uuid>,
) -> std::result::Result<Json<CancelResponse>, ApiError> {
    if handle.cancel_job(job_id).await? {
        Ok(Json(CancelResponse {
            job_id,
            cancelled: true,
        }))
    } else {
        Err(GridError::JobNotFound(job_id).into())
    }
}

async fn set_threads_handler(
    State(handle): State<ManagementHandle>,
    Path(executor): Path<Uuid>,
    Json(request): Json<ThreadsRequest>,
) -> std::result::Result<StatusCode, ApiError> {
    if request.size == 0 {
        return Err(GridError::InvalidConfig("thread pool size must be at least 1".into()).into());
    }
    handle.set_thread_pool_size(executor, request.size).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_load_balancer_handler(State(handle): State<ManagementHandle>) -> Json<LoadBalancerConfig> {
    Json(handle.load_balancer())
}

async fn set_load_balancer_handler(
    State(handle): State<ManagementHandle>,
    Json(config): Json<LoadBalancerConfig>,
) -> std::result::Result<Json<GenerationResponse>, ApiError> {
    let generation = handle.set_load_balancer(config)?;
    Ok(Json(GenerationResponse { generation }))
}
