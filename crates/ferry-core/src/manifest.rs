//! Manifest data model — the persistent record of a file transfer.
//!
//! A manifest is one JSON document per file: the chunk plan (offsets, sizes,
//! per-chunk xxh64 digests), per-chunk delivery status, and bookkeeping
//! timestamps. Manifests are the unit of crash recovery: a transfer resumed
//! from a reloaded manifest re-sends only chunks that were never acked.
//!
//! Statuses serialize as their lowercase names. Older manifests may contain
//! the historical `sent` status; it is accepted on load and read as
//! `in_flight`, never written.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery state of a single chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    #[default]
    Pending,
    #[serde(alias = "sent")]
    InFlight,
    Acked,
    Failed,
}

/// Transfer priority. Stored on the manifest and surfaced over the control
/// plane; the engine itself treats files independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Standard,
    Background,
}

impl std::str::FromStr for Priority {
    type Err = InvalidPriority;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "standard" => Ok(Priority::Standard),
            "background" => Ok(Priority::Background),
            other => Err(InvalidPriority(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid priority {0:?} (expected high, standard, or background)")]
pub struct InvalidPriority(pub String);

/// One fixed slice of the source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: u32,
    pub offset: u64,
    pub size: u32,
    /// xxh64 of the chunk payload, hex-encoded. Integrity only, not security.
    pub hash: String,
    #[serde(default)]
    pub status: ChunkStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub assigned_link: Option<String>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acked_at: Option<DateTime<Utc>>,
}

/// The persistent record of one file transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManifest {
    pub file_id: String,
    pub file_path: PathBuf,
    pub file_size: u64,
    /// SHA-256 of the complete file, hex-encoded. End-to-end verification.
    pub file_hash: String,
    pub total_chunks: u32,
    /// Dense in `[0, total_chunks)`. JSON keys are string-encoded integers.
    pub chunks: BTreeMap<u32, Chunk>,
    #[serde(default)]
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Sum of sizes of ACKED chunks.
    #[serde(default)]
    pub bytes_acked: u64,
}

/// Snapshot of transfer progress, derived from a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferProgress {
    pub progress: f64,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    pub chunks_complete: u32,
    pub chunks_total: u32,
}

impl FileManifest {
    /// Build a manifest from a chunk plan: one entry per digest, offsets
    /// laid out contiguously at `chunk_size` strides, the final chunk
    /// carrying the remainder.
    pub fn plan(
        file_id: impl Into<String>,
        file_path: impl Into<PathBuf>,
        file_size: u64,
        file_hash: String,
        chunk_hashes: Vec<String>,
        chunk_size: u32,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        let mut chunks = BTreeMap::new();
        for (i, hash) in chunk_hashes.into_iter().enumerate() {
            let chunk_id = i as u32;
            let offset = chunk_id as u64 * chunk_size as u64;
            let size = file_size.saturating_sub(offset).min(chunk_size as u64) as u32;
            chunks.insert(
                chunk_id,
                Chunk {
                    chunk_id,
                    offset,
                    size,
                    hash,
                    status: ChunkStatus::Pending,
                    retry_count: 0,
                    assigned_link: None,
                    sent_at: None,
                    acked_at: None,
                },
            );
        }
        FileManifest {
            file_id: file_id.into(),
            file_path: file_path.into(),
            file_size,
            file_hash,
            total_chunks: chunks.len() as u32,
            chunks,
            priority,
            created_at: now,
            updated_at: now,
            completed_at: None,
            bytes_acked: 0,
        }
    }

    /// A manifest is complete iff every chunk is ACKED.
    pub fn is_complete(&self) -> bool {
        self.chunks.values().all(|c| c.status == ChunkStatus::Acked)
    }

    pub fn progress(&self) -> TransferProgress {
        let bytes_acked: u64 = self
            .chunks
            .values()
            .filter(|c| c.status == ChunkStatus::Acked)
            .map(|c| c.size as u64)
            .sum();
        let chunks_complete = self
            .chunks
            .values()
            .filter(|c| c.status == ChunkStatus::Acked)
            .count() as u32;
        let progress = if self.file_size > 0 {
            bytes_acked as f64 / self.file_size as f64
        } else {
            0.0
        };
        TransferProgress {
            progress,
            bytes_transferred: bytes_acked,
            bytes_total: self.file_size,
            chunks_complete,
            chunks_total: self.total_chunks,
        }
    }

    /// Chunks eligible for (re)sending: PENDING and FAILED, FAILED first,
    /// then by ascending chunk id.
    pub fn pending_chunks(&self, limit: Option<usize>) -> Vec<Chunk> {
        let mut pending: Vec<Chunk> = self
            .chunks
            .values()
            .filter(|c| matches!(c.status, ChunkStatus::Pending | ChunkStatus::Failed))
            .cloned()
            .collect();
        pending.sort_by_key(|c| (c.status != ChunkStatus::Failed, c.chunk_id));
        if let Some(limit) = limit {
            pending.truncate(limit);
        }
        pending
    }

    pub fn in_flight_chunks(&self) -> Vec<Chunk> {
        self.chunks
            .values()
            .filter(|c| c.status == ChunkStatus::InFlight)
            .cloned()
            .collect()
    }
}
