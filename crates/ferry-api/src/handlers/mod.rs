//! HTTP API handlers — the control surface over the transfer core.

pub mod files;
pub mod links;
pub mod shaper;
pub mod telemetry;
pub mod transfers;

use std::path::PathBuf;
use std::sync::Arc;

use ferry_services::{LinkScout, LinkShaper, ManifestStore, StoreError, TransferEngine};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<ManifestStore>,
    pub scout: Arc<LinkScout>,
    pub shaper: Arc<LinkShaper>,
    pub engine: Arc<TransferEngine>,
    /// Staging directory for uploaded files awaiting transfer.
    pub upload_dir: PathBuf,
    /// Chunk size manifests are planned with.
    pub chunk_size: u32,
    /// Fan-out channel feeding WebSocket telemetry clients.
    pub telemetry: tokio::sync::broadcast::Sender<String>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

use axum::http::StatusCode;

/// Map store errors onto HTTP: missing manifests are 404, corrupt ones and
/// I/O failures are 500.
fn store_error(e: StoreError) -> (StatusCode, String) {
    match e {
        StoreError::NotFound(_) | StoreError::ChunkNotFound { .. } => {
            (StatusCode::NOT_FOUND, e.to_string())
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// Re-export handler functions for use in router setup.
pub use files::{handle_file_status, handle_files, handle_priority, handle_upload};
pub use links::{handle_best_link, handle_links, handle_scan_links};
pub use shaper::{
    handle_kill_link, handle_restore_link, handle_shaper_config, handle_shaper_reset,
};
pub use telemetry::handle_telemetry_ws;
pub use transfers::{handle_cancel, handle_pause, handle_resume, handle_start_transfer};
