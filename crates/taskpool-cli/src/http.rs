//! HTTP surface of the pool
//!
//! - Dashboard: `GET /nodes`, `GET /stats`
//! - Nodes: register, heartbeat, drain, poll, renew, submit result
//! - Clients: submit, inspect and cancel tasks

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use taskpool_core::app::{NodeView, PoolStats};
use taskpool_core::domain::{
    ErrorKind, Lease, LeaseToken, NodeCapabilities, NodeId, NodeStatus, Outcome, SubmitAck,
    TaskId, TaskRecord, TaskState, TaskSubmission,
};
use taskpool_core::{PoolError, TaskPool};

#[derive(Clone)]
pub struct ApiState {
    pub pool: TaskPool,
}

pub fn router(pool: TaskPool) -> Router {
    Router::new()
        .route("/nodes", get(list_nodes).post(register_node))
        .route("/nodes/{id}/heartbeat", post(heartbeat))
        .route("/nodes/{id}/drain", post(drain))
        .route("/nodes/{id}/poll", post(poll))
        .route("/stats", get(stats))
        .route("/tasks", post(submit_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/leases/renew", post(renew_lease))
        .route("/results", post(submit_result))
        .with_state(ApiState { pool })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ApiError {
    Pool(PoolError),
    BadRequest(String),
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        ApiError::Pool(err)
    }
}

pub fn status_for(err: &PoolError) -> StatusCode {
    match err {
        PoolError::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
        PoolError::TaskNotAvailable(_)
        | PoolError::InvalidTransition { .. }
        | PoolError::NodeUnavailable(_) => StatusCode::CONFLICT,
        PoolError::LeaseExpired(_) => StatusCode::GONE,
        PoolError::UnknownNode(_) | PoolError::UnknownTask(_) => StatusCode::NOT_FOUND,
        PoolError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        PoolError::InvalidConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Pool(err) => {
                if err.kind() == ErrorKind::Structural {
                    warn!(error = %err, "request rejected by the task state machine");
                }
                (
                    status_for(&err),
                    ErrorBody {
                        error: err.code().to_string(),
                        message: err.to_string(),
                    },
                )
            }
            ApiError::BadRequest(message) => {
                warn!(%message, "bad request");
                (
                    StatusCode::BAD_REQUEST,
                    ErrorBody {
                        error: "BadRequest".to_string(),
                        message,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_task_id(raw: &str) -> ApiResult<TaskId> {
    raw.parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid task id {raw:?}: {e}")))
}

// --- dashboard ---

async fn list_nodes(State(state): State<ApiState>) -> Json<Vec<NodeView>> {
    Json(state.pool.nodes())
}

async fn stats(State(state): State<ApiState>) -> Json<PoolStats> {
    Json(state.pool.stats())
}

// --- nodes ---

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub id: NodeId,
    #[serde(default)]
    pub capabilities: NodeCapabilities,
}

async fn register_node(
    State(state): State<ApiState>,
    Json(req): Json<RegisterNodeRequest>,
) -> ApiResult<Json<NodeView>> {
    if req.id.as_str().trim().is_empty() {
        return Err(ApiError::BadRequest("node id must not be empty".into()));
    }
    let record = state.pool.register_node(req.id, req.capabilities);
    Ok(Json(NodeView::from_record(&record, record.last_heartbeat)))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse<S> {
    pub status: S,
}

async fn heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse<NodeStatus>>> {
    let status = state.pool.heartbeat(&NodeId::new(id))?;
    Ok(Json(StatusResponse { status }))
}

async fn drain(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.pool.drain(&NodeId::new(id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn poll(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Response> {
    match state.pool.poll(&NodeId::new(id))? {
        Some(grant) => Ok(Json(grant).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

// --- tasks ---

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
}

async fn submit_task(
    State(state): State<ApiState>,
    Json(req): Json<TaskSubmission>,
) -> ApiResult<(StatusCode, Json<SubmitTaskResponse>)> {
    let task_id = state.pool.submit_with(req)?;
    Ok((StatusCode::CREATED, Json(SubmitTaskResponse { task_id })))
}

async fn get_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskRecord>> {
    let task_id = parse_task_id(&id)?;
    Ok(Json(state.pool.task(task_id)?))
}

async fn cancel_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse<TaskState>>> {
    let task_id = parse_task_id(&id)?;
    let status = state.pool.cancel(task_id)?;
    Ok(Json(StatusResponse { status }))
}

// --- leases & results ---

#[derive(Debug, Serialize, Deserialize)]
pub struct RenewRequest {
    pub token: LeaseToken,
}

async fn renew_lease(
    State(state): State<ApiState>,
    Json(req): Json<RenewRequest>,
) -> ApiResult<Json<Lease>> {
    Ok(Json(state.pool.renew(&req.token)?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResultRequest {
    pub token: LeaseToken,
    pub outcome: Outcome,
}

async fn submit_result(
    State(state): State<ApiState>,
    Json(req): Json<ResultRequest>,
) -> ApiResult<Json<SubmitAck>> {
    Ok(Json(state.pool.submit_result(req.token, req.outcome).await?))
}
