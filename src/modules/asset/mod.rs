use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub mod dto;
pub mod handler;
pub mod model;
pub mod repository;
pub mod service;
pub mod tracker;
pub mod verifier;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/assets", post(handler::create_asset))
        .route("/assets/{id}", get(handler::get_asset))
        .route("/assets/{id}/verify", post(handler::verify_asset))
        .route("/assets/{id}/urls", get(handler::playback_urls))
        .route("/jobs/{id}", axum::routing::delete(handler::remove_queued_job))
        .route("/jobs/{id}/enqueue", post(handler::enqueue_job))
        .route_layer(middleware::from_fn(crate::middleware::role::operator_guard))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::middleware::auth::auth_middleware,
        ))
}
