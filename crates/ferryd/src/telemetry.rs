//! Telemetry bridge — progress events and link snapshots onto one
//! broadcast channel consumed by WebSocket clients.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use ferry_core::manifest::TransferProgress;
use ferry_services::{LinkScout, ProgressSink, TransferStats};

/// Interval between link_metrics frames.
const LINK_FRAME_INTERVAL: Duration = Duration::from_secs(2);

/// Progress sink that publishes `transfer_progress` frames.
pub struct TelemetrySink {
    tx: broadcast::Sender<String>,
}

impl TelemetrySink {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for TelemetrySink {
    fn on_progress(&self, file_id: &str, progress: &TransferProgress, stats: &TransferStats) {
        let frame = serde_json::json!({
            "type": "transfer_progress",
            "file_id": file_id,
            "progress": progress,
            "stats": stats,
        });
        // No subscribers is fine; frames are fire-and-forget.
        let _ = self.tx.send(frame.to_string());
    }
}

/// Periodic `link_metrics` frames from the scout's current table.
pub async fn link_metrics_loop(scout: Arc<LinkScout>, tx: broadcast::Sender<String>) {
    let mut interval = tokio::time::interval(LINK_FRAME_INTERVAL);
    loop {
        interval.tick().await;
        let frame = serde_json::json!({
            "type": "link_metrics",
            "links": scout.snapshot(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let _ = tx.send(frame.to_string());
    }
}
