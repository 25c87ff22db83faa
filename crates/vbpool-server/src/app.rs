use axum::routing::{get, post};
use axum::Router;

use crate::api;
use crate::state::AppState;

pub fn build_http_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/pools", get(api::list_pools))
        .route("/pools/{pool}/vbrowsers/available", get(api::available_vbrowsers))
        .route("/pools/{pool}/vbrowsers/staging", get(api::staging_vbrowsers))
        .route("/pools/{pool}/assign", post(api::assign))
        .route("/pools/{pool}/reset/{vmid}", post(api::reset))
        .route("/pools/{pool}/heartbeat/{vmid}", post(api::heartbeat))
        .route("/pools/{pool}/snapshot", post(api::update_snapshot))
        .with_state(state)
}
