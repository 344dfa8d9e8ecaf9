//! /links handlers — uplink metrics and best-link selection.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use ferry_services::LinkMetrics;

use super::ApiState;

#[derive(Serialize)]
pub struct LinksResponse {
    pub links: Vec<LinkMetrics>,
}

pub async fn handle_links(State(state): State<ApiState>) -> Json<LinksResponse> {
    // Serve the scout's current table; the periodic scan keeps it fresh.
    Json(LinksResponse {
        links: state.scout.snapshot(),
    })
}

pub async fn handle_best_link(
    State(state): State<ApiState>,
) -> Result<Json<LinkMetrics>, (StatusCode, String)> {
    state
        .scout
        .best_link()
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "no active links".to_string()))
}

/// Force an immediate probe cycle. Takes a couple of seconds per link.
pub async fn handle_scan_links(State(state): State<ApiState>) -> Json<LinksResponse> {
    Json(LinksResponse {
        links: state.scout.scan_all().await,
    })
}
