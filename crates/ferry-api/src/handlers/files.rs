//! /files handlers — upload staging, listing, per-file status, priority.

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use ferry_core::manifest::{Priority, TransferProgress};
use ferry_services::TransferStats;

use super::{store_error, ApiState};

// ── /files/upload ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct UploadResponse {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub priority: Priority,
    pub total_chunks: u32,
    pub status: &'static str,
}

pub async fn handle_upload(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, (StatusCode, String)> {
    let mut file_data = Vec::new();
    let mut filename = String::from("uploaded_file");
    let mut priority = Priority::Standard;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        if field_name == "priority" {
            let text = field
                .text()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
            priority = text
                .parse()
                .map_err(|e: ferry_core::manifest::InvalidPriority| {
                    (StatusCode::BAD_REQUEST, e.to_string())
                })?;
        } else {
            if let Some(name) = field.file_name() {
                filename = sanitize_filename(name);
            }
            let data = field
                .bytes()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
            file_data.extend_from_slice(&data);
        }
    }

    if file_data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no file data".to_string()));
    }

    let file_id = uuid::Uuid::new_v4().to_string();
    let staged = state.upload_dir.join(format!("{file_id}_{filename}"));
    if let Some(parent) = staged.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    }
    std::fs::write(&staged, &file_data)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let size = file_data.len() as u64;
    let manifest = state
        .store
        .create(&file_id, &staged, size, state.chunk_size, priority)
        .map_err(store_error)?;

    tracing::info!(
        file_id,
        filename,
        size,
        chunks = manifest.total_chunks,
        "file staged for transfer"
    );

    Ok(Json(UploadResponse {
        file_id,
        filename,
        size,
        priority,
        total_chunks: manifest.total_chunks,
        status: "queued",
    }))
}

/// Sanitize a filename: strip path components, reject traversal attempts.
fn sanitize_filename(raw: &str) -> String {
    // Take only the final path component (handles both / and \ separators)
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);

    // Remove leading dots (no hidden files / no ".." tricks)
    let trimmed = base.trim_start_matches('.');

    let clean: String = trimmed
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if clean.is_empty() {
        "uploaded_file".to_string()
    } else {
        clean
    }
}

// ── /files ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct FileEntry {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub priority: Priority,
    pub progress: TransferProgress,
    pub status: &'static str,
    pub is_paused: bool,
}

#[derive(Serialize)]
pub struct FilesResponse {
    pub files: Vec<FileEntry>,
}

pub async fn handle_files(State(state): State<ApiState>) -> Json<FilesResponse> {
    let mut files = Vec::new();
    for file_id in state.store.list() {
        let Ok(manifest) = state.store.load(&file_id) else {
            continue;
        };
        let status = state.engine.status(&file_id);
        let is_active = status.as_ref().map(|s| s.is_active).unwrap_or(false);
        files.push(FileEntry {
            filename: manifest
                .file_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&file_id)
                .to_string(),
            size: manifest.file_size,
            priority: manifest.priority,
            progress: manifest.progress(),
            status: if is_active { "active" } else { "queued" },
            is_paused: status.map(|s| s.is_paused).unwrap_or(false),
            file_id,
        });
    }
    Json(FilesResponse { files })
}

// ── /files/{id} ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct FileStatusResponse {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    pub priority: Priority,
    pub progress: TransferProgress,
    pub stats: Option<TransferStats>,
    pub completed: bool,
}

pub async fn handle_file_status(
    State(state): State<ApiState>,
    Path(file_id): Path<String>,
) -> Result<Json<FileStatusResponse>, (StatusCode, String)> {
    let manifest = state.store.load(&file_id).map_err(store_error)?;
    Ok(Json(FileStatusResponse {
        filename: manifest
            .file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&file_id)
            .to_string(),
        size: manifest.file_size,
        priority: manifest.priority,
        progress: manifest.progress(),
        stats: state.engine.status(&file_id),
        completed: manifest.completed_at.is_some(),
        file_id,
    }))
}

// ── /files/{id}/priority ──────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PriorityUpdate {
    pub priority: String,
}

pub async fn handle_priority(
    State(state): State<ApiState>,
    Path(file_id): Path<String>,
    Json(update): Json<PriorityUpdate>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let priority: Priority = update
        .priority
        .parse()
        .map_err(|e: ferry_core::manifest::InvalidPriority| {
            (StatusCode::BAD_REQUEST, e.to_string())
        })?;
    state
        .store
        .set_priority(&file_id, priority)
        .map_err(store_error)?;
    Ok(Json(serde_json::json!({
        "status": "updated",
        "file_id": file_id,
        "priority": priority,
    })))
}
