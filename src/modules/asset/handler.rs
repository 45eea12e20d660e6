use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::modules::asset::dto::*;
use crate::modules::asset::model::Job;
use crate::modules::asset::service::AssetService;
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use uuid::Uuid;
use validator::Validate;

#[utoipa::path(
    post,
    path = "/api/v1/assets",
    request_body = CreateAssetRequest,
    responses(
        (status = 201, description = "Asset created and job queued", body = ApiResponse<AssetResponse>),
        (status = 400, description = "Bad Request"),
        (status = 401, description = "Unauthorized"),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Assets",
    security(("bearer_auth" = []))
)]
pub async fn create_asset(
    State(state): State<AppState>,
    Json(req): Json<CreateAssetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()
        .map_err(|e| ApiError(e.to_string(), StatusCode::BAD_REQUEST))?;
    let res = AssetService::create(state, req).await?;
    Ok(ApiSuccess(ApiResponse::success(res, "Asset created successfully"), StatusCode::CREATED))
}

#[utoipa::path(
    get,
    path = "/api/v1/assets/{id}",
    params(
        ("id" = Uuid, Path, description = "Asset ID")
    ),
    responses(
        (status = 200, description = "Get Asset", body = ApiResponse<AssetResponse>),
        (status = 404, description = "Asset Not Found")
    ),
    tag = "Assets",
    security(("bearer_auth" = []))
)]
pub async fn get_asset(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let res = AssetService::get(state, id).await?;
    Ok(ApiSuccess(ApiResponse::success(res, "Asset retrieved successfully"), StatusCode::OK))
}

#[utoipa::path(
    post,
    path = "/api/v1/assets/{id}/verify",
    params(
        ("id" = Uuid, Path, description = "Asset ID")
    ),
    responses(
        (status = 200, description = "Verification re-run; report is empty while the asset is still processing", body = ApiResponse<VerifyResponse>),
        (status = 404, description = "Asset Not Found")
    ),
    tag = "Assets",
    security(("bearer_auth" = []))
)]
pub async fn verify_asset(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let report = AssetService::verify(state, id).await?;
    Ok(ApiSuccess(
        ApiResponse::success(VerifyResponse { report }, "Verification finished"),
        StatusCode::OK,
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/assets/{id}/urls",
    params(
        ("id" = Uuid, Path, description = "Asset ID")
    ),
    responses(
        (status = 200, description = "Freshly signed playback URLs", body = ApiResponse<PlaybackUrlsResponse>),
        (status = 404, description = "Asset Not Found")
    ),
    tag = "Assets",
    security(("bearer_auth" = []))
)]
pub async fn playback_urls(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let res = AssetService::playback_urls(state, id).await?;
    Ok(ApiSuccess(ApiResponse::success(res, "Signed URLs issued"), StatusCode::OK))
}

#[utoipa::path(
    post,
    path = "/api/v1/jobs/{id}/enqueue",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job queued", body = ApiResponse<Job>),
        (status = 404, description = "Job Not Found"),
        (status = 409, description = "Job is not new, or already queued")
    ),
    tag = "Jobs",
    security(("bearer_auth" = []))
)]
pub async fn enqueue_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = AssetService::enqueue_job(state, id).await?;
    Ok(ApiSuccess(ApiResponse::success(job, "Job queued"), StatusCode::OK))
}

#[utoipa::path(
    delete,
    path = "/api/v1/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Queued job removed"),
        (status = 404, description = "Job is not queued")
    ),
    tag = "Jobs",
    security(("bearer_auth" = []))
)]
pub async fn remove_queued_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    AssetService::remove_queued(state, id).await?;
    Ok(ApiSuccess(ApiResponse::success((), "Queued job removed"), StatusCode::OK))
}
