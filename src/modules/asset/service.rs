use axum::http::StatusCode;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::dto::{AssetResponse, CreateAssetRequest, PlaybackUrlsResponse};
use super::model::{Asset, Job};
use super::repository::StoreError;
use super::verifier::VerificationReport;
use crate::common::response::ApiError;
use crate::modules::manifest::ManifestError;
use crate::modules::scheduler::lifecycle::EnqueueError;
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum AssetServiceError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl From<AssetServiceError> for ApiError {
    fn from(e: AssetServiceError) -> Self {
        match e {
            AssetServiceError::NotFound(what) => ApiError::not_found(what),
            AssetServiceError::Enqueue(e) => ApiError(e.to_string(), StatusCode::CONFLICT),
            AssetServiceError::Store(e) => e.into(),
            AssetServiceError::Manifest(e) => e.into(),
        }
    }
}

type Result<T> = std::result::Result<T, AssetServiceError>;

pub struct AssetService;

impl AssetService {
    /// Creates the asset with fresh key material, its job, and queues the job.
    pub async fn create(state: AppState, req: CreateAssetRequest) -> Result<AssetResponse> {
        let asset = Asset::new(req.title, req.variants, req.source_duration, req.subtitles);
        let job = Job::for_asset(&asset, req.descriptor);
        state.store.create(&asset, &job).await?;
        info!(asset_id = %asset.id, job_id = %job.id, variants = ?asset.variants, "asset created");

        state.lifecycle.enqueue(&job).await?;
        Self::get(state, asset.id).await
    }

    pub async fn get(state: AppState, id: Uuid) -> Result<AssetResponse> {
        let asset = state
            .store
            .get_asset(id)
            .await?
            .ok_or(AssetServiceError::NotFound("Asset"))?;
        let job = match asset.job_id {
            Some(job_id) => state.store.get_job(job_id).await?,
            None => None,
        };
        Ok(AssetResponse { asset, job })
    }

    /// Re-runs the finisher's verification for an asset past `processing`.
    pub async fn verify(state: AppState, id: Uuid) -> Result<Option<VerificationReport>> {
        match state.tracker.reverify(id).await {
            Err(StoreError::NotFound(_)) => Err(AssetServiceError::NotFound("Asset")),
            other => Ok(other?),
        }
    }

    /// Manual re-enqueue, e.g. after a worker rejected the assignment.
    pub async fn enqueue_job(state: AppState, job_id: Uuid) -> Result<Job> {
        let job = state
            .store
            .get_job(job_id)
            .await?
            .ok_or(AssetServiceError::NotFound("Job"))?;
        state.lifecycle.enqueue(&job).await?;
        Ok(state.store.get_job(job_id).await?.unwrap_or(job))
    }

    pub async fn remove_queued(state: AppState, job_id: Uuid) -> Result<()> {
        if state.lifecycle.scheduler().remove_queued(job_id) {
            info!(job_id = %job_id, "queued job removed");
            Ok(())
        } else {
            Err(AssetServiceError::NotFound("Queued job"))
        }
    }

    pub async fn playback_urls(state: AppState, id: Uuid) -> Result<PlaybackUrlsResponse> {
        let asset = state
            .store
            .get_asset(id)
            .await?
            .ok_or(AssetServiceError::NotFound("Asset"))?;
        Ok(PlaybackUrlsResponse {
            master: state.manifests.playback_url(&asset)?,
            keyinfo: state.manifests.keyinfo_url(asset.id)?,
        })
    }
}
