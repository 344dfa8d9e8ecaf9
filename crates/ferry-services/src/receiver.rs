//! Receiver-side reassembler — verifies chunks, acks them, rebuilds files.
//!
//! One UDP socket, no session state. Every valid DATA datagram is stored
//! keyed by `(file_id, chunk_id)` and acked back to the sender's address;
//! anything malformed, undecompressable, or failing its digest is dropped
//! silently — the sender's timeout path retransmits. Storage is idempotent,
//! so the protocol is at-least-once delivery with at-most-once effect under
//! arbitrary reordering, loss, and duplication.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;

use ferry_core::digest::chunk_digest;
use ferry_core::wire::{AckPacket, DataPacket};

pub struct Reassembler {
    output_dir: PathBuf,
    received: DashMap<String, BTreeMap<u32, Bytes>>,
    expected: DashMap<String, u32>,
}

impl Reassembler {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir).ok();
        Self {
            output_dir,
            received: DashMap::new(),
            expected: DashMap::new(),
        }
    }

    /// Register the expected chunk count for a file. Once that many
    /// distinct chunks are present the output file is written
    /// automatically. Without a registration, reconstruction waits for an
    /// explicit `write_file` call (out-of-band completion).
    pub fn expect(&self, file_id: &str, total_chunks: u32) {
        self.expected.insert(file_id.to_string(), total_chunks);
    }

    /// Bind `0.0.0.0:port` and serve until aborted.
    pub async fn serve(&self, port: u16) -> anyhow::Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        tracing::info!(port, dir = %self.output_dir.display(), "receiver listening");
        self.run(socket).await
    }

    /// Serve on an already-bound socket.
    pub async fn run(&self, socket: UdpSocket) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, addr) = socket.recv_from(&mut buf).await?;
            if let Some(ack) = self.process_datagram(&buf[..n]) {
                match ack.encode() {
                    Ok(wire) => {
                        if let Err(e) = socket.send_to(&wire, addr).await {
                            tracing::debug!(error = %e, "ack send failed");
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "ack encode failed"),
                }
            }
        }
    }

    /// Validate and store one datagram. Returns the ACK to emit, or None
    /// when the datagram must be dropped silently.
    fn process_datagram(&self, data: &[u8]) -> Option<AckPacket> {
        let packet = DataPacket::decode(data).ok()?;

        let payload = if packet.compressed {
            let mut out = Vec::with_capacity(packet.original_size as usize);
            let mut decoder = flate2::read::ZlibDecoder::new(&packet.payload[..]);
            decoder.read_to_end(&mut out).ok()?;
            out
        } else {
            packet.payload.to_vec()
        };

        if payload.len() != packet.original_size as usize {
            tracing::debug!(
                file_id = %packet.file_id,
                chunk_id = packet.chunk_id,
                "decompressed size mismatch, dropping"
            );
            return None;
        }

        if chunk_digest(&payload) != packet.chunk_hash {
            tracing::debug!(
                file_id = %packet.file_id,
                chunk_id = packet.chunk_id,
                "chunk digest mismatch, dropping"
            );
            return None;
        }

        // Idempotent store: a duplicate overwrites with identical bytes.
        let have = {
            let mut entry = self.received.entry(packet.file_id.clone()).or_default();
            entry.insert(packet.chunk_id, Bytes::from(payload));
            entry.len() as u32
        };
        tracing::debug!(
            file_id = %packet.file_id,
            chunk_id = packet.chunk_id,
            have,
            "chunk stored"
        );

        if let Some(total) = self.expected.get(&packet.file_id).map(|t| *t) {
            if have >= total {
                match self.write_file(&packet.file_id) {
                    Ok(path) => tracing::info!(
                        file_id = %packet.file_id,
                        chunks = have,
                        path = %path.display(),
                        "file reassembled"
                    ),
                    Err(e) => tracing::warn!(
                        file_id = %packet.file_id,
                        error = %e,
                        "file reassembly failed"
                    ),
                }
            }
        }

        Some(AckPacket {
            file_id: packet.file_id,
            chunk_id: packet.chunk_id,
        })
    }

    /// Concatenate stored payloads by ascending chunk id into
    /// `<output_dir>/<file_id>.bin`. Re-running overwrites with the same
    /// bytes. Chunks stay in memory so late duplicates still get acked.
    pub fn write_file(&self, file_id: &str) -> anyhow::Result<PathBuf> {
        let chunks = self
            .received
            .get(file_id)
            .ok_or_else(|| anyhow::anyhow!("no chunks received for {file_id}"))?;

        let mut out = Vec::new();
        for payload in chunks.values() {
            out.extend_from_slice(payload);
        }

        let path = self.output_dir.join(format!("{file_id}.bin"));
        std::fs::write(&path, out)?;
        Ok(path)
    }

    /// Distinct chunks stored for a file.
    pub fn chunks_received(&self, file_id: &str) -> usize {
        self.received.get(file_id).map(|c| c.len()).unwrap_or(0)
    }

    /// File ids with at least one stored chunk.
    pub fn in_progress(&self) -> Vec<String> {
        self.received.iter().map(|e| e.key().clone()).collect()
    }
}
