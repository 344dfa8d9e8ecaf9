//! Transfer engine — the sender-side reliability and scheduling core.
//!
//! Each active file runs as one tokio task owning one UDP socket bound to
//! the currently best-scoring uplink. The task drives a sliding window of
//! chunks: fill the window from the pending queue, drain ACKs without
//! blocking, retransmit on exponential-backoff timeouts, switch uplinks
//! when the scout's answer changes, and persist every status transition
//! through the manifest store so a killed process resumes where it left off.
//!
//! Timeout arithmetic runs on monotonic instants held by the task; the
//! wall-clock timestamps in the manifest are bookkeeping only.

use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use ferry_core::config::TransferConfig;
use ferry_core::manifest::{Chunk, ChunkStatus, TransferProgress};
use ferry_core::wire::{AckPacket, DataPacket};

use crate::scout::{bind_to_interface, LinkMetrics, LinkScout};
use crate::shaper::LinkShaper;
use crate::store::{ManifestStore, StoreError};

/// How long `start` will wait for a usable uplink before giving up.
const LINK_WAIT_MAX: Duration = Duration::from_secs(10);

/// ACKs drained from the socket per tick.
const ACK_BATCH: usize = 10;

/// Inter-tick sleep of the driving loop.
const TICK: Duration = Duration::from_millis(100);

/// Receives a progress report after every progress-changing event. The
/// control plane plugs in its own implementation (e.g. a broadcaster to
/// WebSocket clients).
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, file_id: &str, progress: &TransferProgress, stats: &TransferStats);
}

/// Live counters for one transfer. `bytes_sent` is on-wire bytes after
/// compression; `compression_ratio` is wire bytes over original bytes.
#[derive(Debug, Clone, Serialize)]
pub struct TransferStats {
    pub started_at: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_original: u64,
    pub chunks_sent: u64,
    pub chunks_acked: u64,
    pub retransmissions: u64,
    pub link_switches: u64,
    pub current_link: Option<String>,
    pub compression_ratio: f64,
    pub throughput_mbps: f64,
    pub is_active: bool,
    pub is_paused: bool,
}

impl TransferStats {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            bytes_sent: 0,
            bytes_original: 0,
            chunks_sent: 0,
            chunks_acked: 0,
            retransmissions: 0,
            link_switches: 0,
            current_link: None,
            compression_ratio: 0.0,
            throughput_mbps: 0.0,
            is_active: false,
            is_paused: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transfer already active for {0}")]
    AlreadyActive(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct TransferEngine {
    store: Arc<ManifestStore>,
    scout: Arc<LinkScout>,
    shaper: Arc<LinkShaper>,
    config: TransferConfig,
    active: Arc<DashMap<String, JoinHandle<()>>>,
    paused: Arc<DashSet<String>>,
    stats: Arc<DashMap<String, Arc<Mutex<TransferStats>>>>,
    sink: Arc<RwLock<Option<Arc<dyn ProgressSink>>>>,
}

impl TransferEngine {
    pub fn new(
        store: Arc<ManifestStore>,
        scout: Arc<LinkScout>,
        shaper: Arc<LinkShaper>,
        config: TransferConfig,
    ) -> Self {
        Self {
            store,
            scout,
            shaper,
            config,
            active: Arc::new(DashMap::new()),
            paused: Arc::new(DashSet::new()),
            stats: Arc::new(DashMap::new()),
            sink: Arc::new(RwLock::new(None)),
        }
    }

    /// Install the progress reporter. Replaces any previous sink.
    pub fn set_progress_sink(&self, sink: Arc<dyn ProgressSink>) {
        *self.sink.write().expect("sink lock") = Some(sink);
    }

    /// Launch a transfer task for a registered file. Fails when a task for
    /// this file is already running or the manifest does not exist.
    pub fn start(&self, file_id: &str, host: &str, port: u16) -> Result<(), EngineError> {
        if self.is_active(file_id) {
            return Err(EngineError::AlreadyActive(file_id.to_string()));
        }

        let manifest = self.store.load(file_id)?;
        let stats = Arc::new(Mutex::new(TransferStats::new()));
        self.stats.insert(file_id.to_string(), stats.clone());
        self.paused.remove(file_id);

        let task = TransferTask {
            file_id: file_id.to_string(),
            file_path: manifest.file_path.clone(),
            dest: format!("{host}:{port}"),
            store: self.store.clone(),
            scout: self.scout.clone(),
            shaper: self.shaper.clone(),
            config: self.config.clone(),
            paused: self.paused.clone(),
            stats,
            sink: self.sink.clone(),
        };

        let id = file_id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = task.run().await {
                tracing::error!(file_id = %id, error = %e, "transfer task ended with error");
            }
        });
        self.active.insert(file_id.to_string(), handle);
        tracing::info!(file_id, host, port, "transfer started");
        Ok(())
    }

    pub fn pause(&self, file_id: &str) {
        self.paused.insert(file_id.to_string());
        tracing::info!(file_id, "transfer paused");
    }

    pub fn resume(&self, file_id: &str) {
        self.paused.remove(file_id);
        tracing::info!(file_id, "transfer resumed");
    }

    /// Abort the transfer task at its next suspension point and release its
    /// socket. The manifest keeps whatever state was last persisted.
    pub fn cancel(&self, file_id: &str) {
        if let Some((_, handle)) = self.active.remove(file_id) {
            handle.abort();
            tracing::info!(file_id, "transfer cancelled");
        }
        self.paused.remove(file_id);
    }

    pub fn is_active(&self, file_id: &str) -> bool {
        self.active
            .get(file_id)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Live counters for a transfer. Retained after completion so late
    /// status queries still see the final numbers.
    pub fn status(&self, file_id: &str) -> Option<TransferStats> {
        let cell = self.stats.get(file_id)?;
        let mut stats = cell.lock().expect("stats lock").clone();
        stats.is_active = self.is_active(file_id);
        stats.is_paused = self.paused.contains(file_id);
        if let Ok(progress) = self.store.get_progress(file_id) {
            stats.throughput_mbps = throughput_mbps(&stats, &progress);
        }
        Some(stats)
    }
}

fn throughput_mbps(stats: &TransferStats, progress: &TransferProgress) -> f64 {
    let elapsed = (Utc::now() - stats.started_at).num_milliseconds() as f64 / 1000.0;
    if elapsed <= 0.0 || progress.bytes_transferred == 0 {
        return 0.0;
    }
    progress.bytes_transferred as f64 * 8.0 / (elapsed * 1_000_000.0)
}

// ── The per-file transfer task ────────────────────────────────────────────────

struct TransferTask {
    file_id: String,
    file_path: std::path::PathBuf,
    dest: String,
    store: Arc<ManifestStore>,
    scout: Arc<LinkScout>,
    shaper: Arc<LinkShaper>,
    config: TransferConfig,
    paused: Arc<DashSet<String>>,
    stats: Arc<Mutex<TransferStats>>,
    sink: Arc<RwLock<Option<Arc<dyn ProgressSink>>>>,
}

impl TransferTask {
    async fn run(self) -> anyhow::Result<()> {
        let dest = resolve(&self.dest).await?;

        // Chunks that were on the wire when a previous run died were never
        // acked; they go back to pending before the window refills.
        let reset = self.store.reset_in_flight(&self.file_id)?;
        if reset > 0 {
            tracing::info!(file_id = %self.file_id, reset, "demoted stale in-flight chunks");
        }

        // Wait briefly for a usable uplink before starting the loop.
        let wait_started = Instant::now();
        while self.scout.best_link().is_none() {
            if wait_started.elapsed() >= LINK_WAIT_MAX {
                anyhow::bail!("no usable uplink after {}s", LINK_WAIT_MAX.as_secs());
            }
            tracing::info!(file_id = %self.file_id, "waiting for a usable uplink");
            self.scout.scan_all().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let mut socket: Option<UdpSocket> = None;
        let mut current_link: Option<LinkMetrics> = None;
        // Monotonic clock per in-flight chunk, authoritative for timeouts.
        let mut sent_instants: HashMap<u32, Instant> = HashMap::new();

        while !self.store.is_complete(&self.file_id)? {
            while self.paused.contains(&self.file_id) {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }

            let best = match self.scout.best_link() {
                Some(best) => best,
                None => {
                    tracing::debug!(file_id = %self.file_id, "no uplink available, rescanning");
                    self.scout.scan_all().await;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            // Compare by interface name: scans produce fresh metric values
            // for the same physical link every few seconds.
            let changed = current_link
                .as_ref()
                .map(|c| c.interface != best.interface)
                .unwrap_or(true);
            if changed {
                match bind_to_interface(&best.interface, best.ip_address) {
                    Ok(s) => {
                        socket = Some(s);
                        current_link = Some(best.clone());
                        let mut stats = self.stats.lock().expect("stats lock");
                        stats.current_link = Some(best.interface.clone());
                        stats.link_switches += 1;
                        tracing::info!(
                            file_id = %self.file_id,
                            interface = %best.interface,
                            ip = %best.ip_address,
                            "switched uplink"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            file_id = %self.file_id,
                            interface = %best.interface,
                            error = %e,
                            "could not bind to uplink"
                        );
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                }
            }
            let sock = match socket.as_ref() {
                Some(sock) => sock,
                None => continue,
            };

            self.drain_acks(sock, &mut sent_instants)?;

            let in_flight = self.store.get_in_flight(&self.file_id)?;
            let available = self.config.window.saturating_sub(in_flight.len());
            if available > 0 {
                let pending = self.store.get_pending(&self.file_id, Some(available))?;
                for chunk in pending {
                    self.send_chunk(&chunk, sock, &best, dest, &mut sent_instants)
                        .await?;
                }
            }

            self.check_timeouts(sock, &best, dest, &mut sent_instants)
                .await?;

            self.report_progress();
            tokio::time::sleep(TICK).await;
        }

        self.store.mark_completed(&self.file_id)?;
        self.report_progress();
        tracing::info!(file_id = %self.file_id, "transfer complete");
        Ok(())
    }

    /// Send one chunk (first send or retransmission).
    ///
    /// The shaper sits between the engine and the socket: a shaper drop
    /// leaves the chunk in flight with its prior `sent_at`, so recovery
    /// comes from the timeout path exactly as it would for network loss.
    /// Retry counters are not touched here, and the send stamp (persisted
    /// and local) is refreshed only when a packet actually goes out.
    async fn send_chunk(
        &self,
        chunk: &Chunk,
        sock: &UdpSocket,
        link: &LinkMetrics,
        dest: SocketAddr,
        sent_instants: &mut HashMap<u32, Instant>,
    ) -> Result<(), StoreError> {
        // First sends transition the chunk, stamping `sent_at` and
        // resetting a failed chunk's attempt counter. Retransmissions are
        // already in flight and keep their prior stamp until the send
        // clears the shaper.
        let was_in_flight = chunk.status == ChunkStatus::InFlight;
        if !was_in_flight {
            self.store.update_chunk_status(
                &self.file_id,
                chunk.chunk_id,
                ChunkStatus::InFlight,
                Some(&link.interface),
            )?;
            sent_instants.insert(chunk.chunk_id, Instant::now());
        }

        let data = match self.read_chunk(chunk).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(
                    file_id = %self.file_id,
                    chunk_id = chunk.chunk_id,
                    error = %e,
                    "chunk read failed"
                );
                self.store.update_chunk_status(
                    &self.file_id,
                    chunk.chunk_id,
                    ChunkStatus::Failed,
                    None,
                )?;
                sent_instants.remove(&chunk.chunk_id);
                return Ok(());
            }
        };

        let compressed = compress(&data);
        let (payload, is_compressed) = if compressed.len() < data.len() {
            (compressed, true)
        } else {
            (data.clone(), false)
        };

        let chunk_hash: [u8; 8] = match hex::decode(&chunk.hash)
            .ok()
            .and_then(|h| h.try_into().ok())
        {
            Some(hash) => hash,
            None => {
                tracing::error!(
                    file_id = %self.file_id,
                    chunk_id = chunk.chunk_id,
                    "manifest carries an invalid chunk hash"
                );
                self.store.update_chunk_status(
                    &self.file_id,
                    chunk.chunk_id,
                    ChunkStatus::Failed,
                    None,
                )?;
                sent_instants.remove(&chunk.chunk_id);
                return Ok(());
            }
        };

        let packet = DataPacket {
            file_id: self.file_id.clone(),
            chunk_id: chunk.chunk_id,
            offset: chunk.offset,
            original_size: data.len() as u32,
            compressed: is_compressed,
            chunk_hash,
            payload: Bytes::from(payload),
        };
        let wire = match packet.encode() {
            Ok(wire) => wire,
            Err(e) => {
                tracing::error!(
                    file_id = %self.file_id,
                    chunk_id = chunk.chunk_id,
                    error = %e,
                    "chunk does not fit a datagram"
                );
                self.store.update_chunk_status(
                    &self.file_id,
                    chunk.chunk_id,
                    ChunkStatus::Failed,
                    None,
                )?;
                sent_instants.remove(&chunk.chunk_id);
                return Ok(());
            }
        };

        if !self.shaper.should_send(Some(&link.interface)) {
            tracing::debug!(
                file_id = %self.file_id,
                chunk_id = chunk.chunk_id,
                "packet dropped by shaper, timeout will retransmit"
            );
            return Ok(());
        }
        let delay = self.shaper.delay(Some(&link.interface));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match sock.send_to(&wire, dest).await {
            Ok(_) => {
                // The packet is on the wire; retransmissions refresh the
                // persisted stamp now, never on a drop.
                if was_in_flight {
                    self.store.update_chunk_status(
                        &self.file_id,
                        chunk.chunk_id,
                        ChunkStatus::InFlight,
                        Some(&link.interface),
                    )?;
                }
                sent_instants.insert(chunk.chunk_id, Instant::now());
                let mut stats = self.stats.lock().expect("stats lock");
                stats.bytes_sent += wire.len() as u64;
                stats.bytes_original += data.len() as u64;
                stats.chunks_sent += 1;
                if stats.bytes_original > 0 {
                    stats.compression_ratio = stats.bytes_sent as f64 / stats.bytes_original as f64;
                }
            }
            Err(e) => {
                tracing::debug!(
                    file_id = %self.file_id,
                    chunk_id = chunk.chunk_id,
                    error = %e,
                    "send failed"
                );
                self.store.update_chunk_status(
                    &self.file_id,
                    chunk.chunk_id,
                    ChunkStatus::Failed,
                    None,
                )?;
                sent_instants.remove(&chunk.chunk_id);
            }
        }
        Ok(())
    }

    /// Read this chunk's slice of the source file.
    async fn read_chunk(&self, chunk: &Chunk) -> std::io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.file_path).await?;
        file.seek(std::io::SeekFrom::Start(chunk.offset)).await?;
        let mut data = vec![0u8; chunk.size as usize];
        file.read_exact(&mut data).await?;
        Ok(data)
    }

    /// Drain pending ACKs without blocking, a bounded batch per tick.
    /// ACKs for other files on this socket are discarded; malformed
    /// datagrams are dropped.
    fn drain_acks(
        &self,
        sock: &UdpSocket,
        sent_instants: &mut HashMap<u32, Instant>,
    ) -> Result<(), StoreError> {
        let mut buf = [0u8; 2048];
        for _ in 0..ACK_BATCH {
            let n = match sock.try_recv_from(&mut buf) {
                Ok((n, _)) => n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!(file_id = %self.file_id, error = %e, "ack recv failed");
                    break;
                }
            };

            let ack = match AckPacket::decode(&buf[..n]) {
                Ok(ack) => ack,
                Err(_) => continue,
            };
            if ack.file_id != self.file_id {
                continue;
            }

            match self.store.update_chunk_status(
                &self.file_id,
                ack.chunk_id,
                ChunkStatus::Acked,
                None,
            ) {
                Ok(true) => {
                    sent_instants.remove(&ack.chunk_id);
                    self.stats.lock().expect("stats lock").chunks_acked += 1;
                    tracing::debug!(file_id = %self.file_id, chunk_id = ack.chunk_id, "acked");
                }
                // Duplicate ACK for an already-acked chunk.
                Ok(false) => {}
                // ACK naming a chunk we never planned: drop it.
                Err(StoreError::ChunkNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Retransmit chunks whose backoff window has elapsed; exhaust into
    /// FAILED. The n-th retransmission fires no earlier than
    /// `retry_delay_base * 2^(n-1)` after the previous send.
    async fn check_timeouts(
        &self,
        sock: &UdpSocket,
        link: &LinkMetrics,
        dest: SocketAddr,
        sent_instants: &mut HashMap<u32, Instant>,
    ) -> Result<(), StoreError> {
        let base = self.config.retry_delay_base();
        for chunk in self.store.get_in_flight(&self.file_id)? {
            let sent = match sent_instants.get(&chunk.chunk_id) {
                Some(sent) => *sent,
                None => {
                    // No local clock for this chunk; start one now.
                    sent_instants.insert(chunk.chunk_id, Instant::now());
                    continue;
                }
            };

            let timeout = base.mul_f64(2f64.powi(chunk.retry_count.min(16) as i32));
            if sent.elapsed() <= timeout {
                continue;
            }

            if chunk.retry_count < self.config.max_retries {
                let retry = self.store.bump_retry(&self.file_id, chunk.chunk_id)?;
                self.stats.lock().expect("stats lock").retransmissions += 1;
                tracing::debug!(
                    file_id = %self.file_id,
                    chunk_id = chunk.chunk_id,
                    retry,
                    max = self.config.max_retries,
                    "timeout, retransmitting"
                );
                self.send_chunk(&chunk, sock, link, dest, sent_instants)
                    .await?;
            } else {
                tracing::warn!(
                    file_id = %self.file_id,
                    chunk_id = chunk.chunk_id,
                    "retries exhausted, marking chunk failed"
                );
                self.store.update_chunk_status(
                    &self.file_id,
                    chunk.chunk_id,
                    ChunkStatus::Failed,
                    None,
                )?;
                sent_instants.remove(&chunk.chunk_id);
            }
        }
        Ok(())
    }

    fn report_progress(&self) {
        let sink = match self.sink.read().expect("sink lock").clone() {
            Some(sink) => sink,
            None => return,
        };
        let progress = match self.store.get_progress(&self.file_id) {
            Ok(progress) => progress,
            Err(_) => return,
        };
        let mut stats = self.stats.lock().expect("stats lock").clone();
        stats.is_active = true;
        stats.is_paused = self.paused.contains(&self.file_id);
        stats.throughput_mbps = throughput_mbps(&stats, &progress);
        sink.on_progress(&self.file_id, &progress, &stats);
    }
}

async fn resolve(dest: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(dest)
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("destination {dest} did not resolve"))
}

/// zlib at level 6 — applied only when it strictly shrinks the payload.
fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(6));
    // Writing to a Vec cannot fail.
    encoder.write_all(data).expect("in-memory compression");
    encoder.finish().expect("in-memory compression")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_shrinks_redundant_data() {
        let data = vec![7u8; 65536];
        let out = compress(&data);
        assert!(out.len() < data.len());
    }

    #[test]
    fn compress_round_trips() {
        use std::io::Read;
        let data: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let packed = compress(&data);
        let mut back = Vec::new();
        flate2::read::ZlibDecoder::new(&packed[..])
            .read_to_end(&mut back)
            .unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn throughput_is_zero_before_any_progress() {
        let stats = TransferStats::new();
        let progress = TransferProgress {
            progress: 0.0,
            bytes_transferred: 0,
            bytes_total: 1024,
            chunks_complete: 0,
            chunks_total: 1,
        };
        assert_eq!(throughput_mbps(&stats, &progress), 0.0);
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let base = Duration::from_secs(1);
        assert_eq!(base.mul_f64(2f64.powi(0)), Duration::from_secs(1));
        assert_eq!(base.mul_f64(2f64.powi(3)), Duration::from_secs(8));
    }
}
