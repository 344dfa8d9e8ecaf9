//! Ferry integration test harness.
//!
//! These tests drive the library crates end-to-end over loopback UDP: a
//! real transfer engine sending to a real reassembler, with the shaper
//! injecting loss and blackouts. No root, no namespaces — every fault is
//! simulated at the send path, which is indistinguishable from network
//! loss to the engine.

mod transfer;
mod wire;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use ferry_core::config::{ScanConfig, ScoreWeights, TransferConfig};
use ferry_core::manifest::Priority;
use ferry_services::{
    LinkMetrics, LinkScout, LinkShaper, ManifestStore, Reassembler, TransferEngine,
};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fresh scratch directory per test.
pub fn temp_dir(tag: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "ferry-it-{}-{}-{}",
        tag,
        std::process::id(),
        id
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Write a deterministic, non-repeating test file.
pub fn write_source(dir: &std::path::Path, len: usize) -> PathBuf {
    let path = dir.join("source.bin");
    let data: Vec<u8> = (0..len)
        .map(|i| ((i * 31 + i / 65536) % 251) as u8)
        .collect();
    std::fs::write(&path, &data).unwrap();
    path
}

/// A loopback uplink the scout will report. `bind_to_interface` falls back
/// to binding the address when the name is not a real device, so any name
/// works against 127.0.0.1.
pub fn loopback_link(scout: &LinkScout, name: &str, rtt_ms: f64) {
    scout.record(LinkMetrics {
        interface: name.to_string(),
        ip_address: Ipv4Addr::LOCALHOST,
        throughput_mbps: 90.0,
        rtt_ms,
        packet_loss: 0.0,
        jitter_ms: 1.0,
        stability_score: 0.95,
        link_score: 0.0,
        is_active: true,
        last_updated: Utc::now(),
    });
}

/// Engine stack wired for tests: store on a temp dir, empty scout table
/// (tests pin their own links), default shaper.
pub struct Rig {
    pub store: Arc<ManifestStore>,
    pub scout: Arc<LinkScout>,
    pub shaper: Arc<LinkShaper>,
    pub engine: Arc<TransferEngine>,
}

pub fn rig(manifest_dir: &std::path::Path, transfer: TransferConfig) -> Rig {
    let store = Arc::new(ManifestStore::new(manifest_dir).unwrap());
    let scout = Arc::new(LinkScout::new(ScanConfig::default(), ScoreWeights::default()));
    let shaper = Arc::new(LinkShaper::new());
    let engine = Arc::new(TransferEngine::new(
        store.clone(),
        scout.clone(),
        shaper.clone(),
        transfer,
    ));
    Rig {
        store,
        scout,
        shaper,
        engine,
    }
}

pub fn fast_transfer_config() -> TransferConfig {
    TransferConfig {
        retry_delay_base_ms: 200,
        ..TransferConfig::default()
    }
}

/// Start a reassembler on an ephemeral loopback port.
pub async fn spawn_receiver(
    output_dir: &std::path::Path,
) -> (Arc<Reassembler>, SocketAddr, tokio::task::JoinHandle<()>) {
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let reassembler = Arc::new(Reassembler::new(output_dir));
    let task = {
        let reassembler = reassembler.clone();
        tokio::spawn(async move {
            let _ = reassembler.run(socket).await;
        })
    };
    (reassembler, addr, task)
}

/// Poll until the predicate holds or the deadline passes.
pub async fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, predicate: F) {
    let started = std::time::Instant::now();
    while !predicate() {
        assert!(
            started.elapsed() < timeout,
            "timed out after {:?} waiting for {}",
            timeout,
            what
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Register a file with the store from a freshly written source.
pub fn stage_file(store: &ManifestStore, dir: &std::path::Path, len: usize, id: &str) -> PathBuf {
    let src = write_source(dir, len);
    store
        .create(id, &src, len as u64, 65536, Priority::Standard)
        .unwrap();
    src
}
