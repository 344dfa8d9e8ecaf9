//! Shaper handlers — fault injection controls for tests and drills.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use ferry_services::ShaperConfig;

use super::ApiState;

#[derive(Deserialize)]
pub struct ShaperConfigRequest {
    #[serde(flatten)]
    pub config: ShaperConfig,
    /// Apply to one interface; absent means global.
    pub interface: Option<String>,
}

pub async fn handle_shaper_config(
    State(state): State<ApiState>,
    Json(request): Json<ShaperConfigRequest>,
) -> Json<serde_json::Value> {
    match &request.interface {
        Some(interface) => {
            state.shaper.set_link(interface, request.config.clone());
            tracing::info!(
                interface,
                loss = request.config.packet_loss,
                enabled = request.config.enabled,
                "shaper configured for interface"
            );
        }
        None => {
            state.shaper.set_global(request.config.clone());
            tracing::info!(
                loss = request.config.packet_loss,
                enabled = request.config.enabled,
                "shaper configured globally"
            );
        }
    }
    Json(serde_json::json!({ "status": "configured", "interface": request.interface }))
}

#[derive(Deserialize)]
pub struct InterfaceParam {
    pub interface: Option<String>,
}

pub async fn handle_kill_link(
    State(state): State<ApiState>,
    Query(params): Query<InterfaceParam>,
) -> Json<serde_json::Value> {
    state.shaper.kill(params.interface.as_deref());
    tracing::info!(interface = ?params.interface, "link killed");
    Json(serde_json::json!({ "status": "link_killed", "interface": params.interface }))
}

pub async fn handle_restore_link(
    State(state): State<ApiState>,
    Query(params): Query<InterfaceParam>,
) -> Json<serde_json::Value> {
    state.shaper.restore(params.interface.as_deref());
    tracing::info!(interface = ?params.interface, "link restored");
    Json(serde_json::json!({ "status": "link_restored", "interface": params.interface }))
}

pub async fn handle_shaper_reset(
    State(state): State<ApiState>,
    Query(params): Query<InterfaceParam>,
) -> Json<serde_json::Value> {
    state.shaper.reset(params.interface.as_deref());
    Json(serde_json::json!({ "status": "reset", "interface": params.interface }))
}
