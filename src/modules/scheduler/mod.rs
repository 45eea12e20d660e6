use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;

use crate::state::AppState;

pub mod connection;
pub mod dispatcher;
pub mod dto;
pub mod handler;
pub mod lifecycle;
pub mod model;
pub mod protocol;
pub mod service;

/// Operator endpoints. The worker socket authenticates in-band and is
/// mounted separately.
pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/workers", get(handler::list_workers))
        .route("/workers/{id}/priority", put(handler::set_priority))
        .route("/workers/{id}/quit", post(handler::quit_worker))
        .route_layer(middleware::from_fn(crate::middleware::role::operator_guard))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::middleware::auth::auth_middleware,
        ))
}
