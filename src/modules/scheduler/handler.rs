use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::modules::scheduler::dto::*;
use crate::modules::scheduler::model::WorkerId;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::info;

#[utoipa::path(
    get,
    path = "/api/v1/workers",
    responses(
        (status = 200, description = "Connected and lingering workers plus the job queue", body = ApiResponse<WorkerListResponse>),
        (status = 401, description = "Unauthorized")
    ),
    tag = "Workers",
    security(("bearer_auth" = []))
)]
pub async fn list_workers(State(state): State<AppState>) -> impl IntoResponse {
    let scheduler = state.lifecycle.scheduler();
    let res = WorkerListResponse {
        workers: scheduler.snapshot(),
        queued_jobs: scheduler.queued_jobs(),
    };
    ApiSuccess(ApiResponse::success(res, "Workers retrieved successfully"), StatusCode::OK)
}

#[utoipa::path(
    put,
    path = "/api/v1/workers/{id}/priority",
    params(
        ("id" = u64, Path, description = "Worker ID")
    ),
    request_body = SetPriorityRequest,
    responses(
        (status = 200, description = "Priority override updated"),
        (status = 404, description = "Worker Not Found")
    ),
    tag = "Workers",
    security(("bearer_auth" = []))
)]
pub async fn set_priority(
    State(state): State<AppState>,
    Path(id): Path<WorkerId>,
    Json(req): Json<SetPriorityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.lifecycle.scheduler().set_priority_override(id, req.priority) {
        return Err(ApiError::not_found("Worker"));
    }
    info!(worker_id = id, priority = ?req.priority, "worker priority override set");
    state.lifecycle.kick().await;
    Ok(ApiSuccess(ApiResponse::success((), "Priority updated"), StatusCode::OK))
}

#[utoipa::path(
    post,
    path = "/api/v1/workers/{id}/quit",
    params(
        ("id" = u64, Path, description = "Worker ID")
    ),
    responses(
        (status = 202, description = "Quit request sent"),
        (status = 404, description = "Worker not found or not connected")
    ),
    tag = "Workers",
    security(("bearer_auth" = []))
)]
pub async fn quit_worker(
    State(state): State<AppState>,
    Path(id): Path<WorkerId>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.lifecycle.scheduler().quit(id) {
        return Err(ApiError::not_found("Worker"));
    }
    info!(worker_id = id, "quit sent to worker");
    Ok(ApiSuccess(ApiResponse::success((), "Quit requested"), StatusCode::ACCEPTED))
}
