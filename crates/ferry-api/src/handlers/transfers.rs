//! Transfer lifecycle handlers — start, pause, resume, cancel.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use ferry_services::EngineError;

use super::{store_error, ApiState};

#[derive(Deserialize)]
pub struct TransferRequest {
    pub file_id: String,
    pub destination_host: String,
    pub destination_port: u16,
}

pub async fn handle_start_transfer(
    State(state): State<ApiState>,
    Path(file_id): Path<String>,
    Json(request): Json<TransferRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if file_id != request.file_id {
        return Err((StatusCode::BAD_REQUEST, "file id mismatch".to_string()));
    }

    state
        .engine
        .start(
            &file_id,
            &request.destination_host,
            request.destination_port,
        )
        .map_err(|e| match e {
            EngineError::AlreadyActive(_) => (StatusCode::BAD_REQUEST, e.to_string()),
            EngineError::Store(inner) => store_error(inner),
        })?;

    Ok(Json(serde_json::json!({
        "status": "started",
        "file_id": file_id,
    })))
}

pub async fn handle_pause(
    State(state): State<ApiState>,
    Path(file_id): Path<String>,
) -> Json<serde_json::Value> {
    state.engine.pause(&file_id);
    Json(serde_json::json!({ "status": "paused", "file_id": file_id }))
}

pub async fn handle_resume(
    State(state): State<ApiState>,
    Path(file_id): Path<String>,
) -> Json<serde_json::Value> {
    state.engine.resume(&file_id);
    Json(serde_json::json!({ "status": "resumed", "file_id": file_id }))
}

pub async fn handle_cancel(
    State(state): State<ApiState>,
    Path(file_id): Path<String>,
) -> Json<serde_json::Value> {
    state.engine.cancel(&file_id);
    Json(serde_json::json!({ "status": "cancelled", "file_id": file_id }))
}
