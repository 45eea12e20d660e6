use utoipa::OpenApi;
use crate::modules::asset::dto::*;
use crate::modules::scheduler::dto::*;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::modules::asset::handler::create_asset,
        crate::modules::asset::handler::get_asset,
        crate::modules::asset::handler::verify_asset,
        crate::modules::asset::handler::playback_urls,
        crate::modules::asset::handler::enqueue_job,
        crate::modules::asset::handler::remove_queued_job,
        crate::modules::scheduler::handler::list_workers,
        crate::modules::scheduler::handler::set_priority,
        crate::modules::scheduler::handler::quit_worker,
        crate::modules::manifest::handler::serve_signed,
    ),
    components(
        schemas(
            CreateAssetRequest, AssetResponse, PlaybackUrlsResponse, VerifyResponse,
            SetPriorityRequest, WorkerListResponse,
            crate::modules::asset::model::Asset,
            crate::modules::asset::model::Job,
            crate::modules::asset::model::AssetState,
            crate::modules::asset::model::JobState,
            crate::modules::asset::verifier::VerificationReport,
            crate::modules::scheduler::model::WorkerSnapshot,
            crate::modules::scheduler::model::WorkerStatus,
            crate::modules::scheduler::model::JobSlot,
        )
    ),
    tags(
        (name = "Assets", description = "Asset creation, verification and playback URLs"),
        (name = "Jobs", description = "Transcode job queue"),
        (name = "Workers", description = "Encoder worker fleet"),
        (name = "Delivery", description = "Signed playlist, key and segment delivery")
    ),
    security(
        ("bearer_auth" = [])
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

use utoipa::Modify;
use utoipa::openapi::security::{SecurityScheme, HttpAuthScheme, HttpBuilder};

pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}
