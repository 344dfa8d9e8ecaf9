//! Link scout — enumerates local uplinks, probes them, and scores each.
//!
//! Every scan walks the non-loopback interfaces that carry an IPv4 address,
//! probes each for ~2 seconds at ~10 Hz against a well-known endpoint from a
//! socket bound to that interface, and folds the samples into a composite
//! 0..1 link score. The transfer engine asks `best_link()` each tick and
//! rebinds its socket when the answer changes.
//!
//! Probing must never take the scout down: an interface that cannot be
//! probed keeps its previous metrics or, on first failure, gets conservative
//! defaults so transfers can still make progress on boxes where the probe
//! endpoint is unreachable (CI, offline demos). Warnings are logged once per
//! interface.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;

use ferry_core::config::{ScanConfig, ScoreWeights};

/// Measured quality of one uplink.
#[derive(Debug, Clone, Serialize)]
pub struct LinkMetrics {
    pub interface: String,
    pub ip_address: Ipv4Addr,
    pub throughput_mbps: f64,
    pub rtt_ms: f64,
    pub packet_loss: f64,
    pub jitter_ms: f64,
    pub stability_score: f64,
    pub link_score: f64,
    pub is_active: bool,
    pub last_updated: DateTime<Utc>,
}

pub struct LinkScout {
    config: ScanConfig,
    weights: ScoreWeights,
    metrics: DashMap<String, LinkMetrics>,
    warned: DashSet<String>,
}

impl LinkScout {
    pub fn new(config: ScanConfig, weights: ScoreWeights) -> Self {
        Self {
            config,
            weights,
            metrics: DashMap::new(),
            warned: DashSet::new(),
        }
    }

    /// Probe every active interface and refresh the metrics table.
    /// Returns the fresh metrics sorted best-first.
    pub async fn scan_all(&self) -> Vec<LinkMetrics> {
        let interfaces = self.active_interfaces();
        let duration = Duration::from_secs(self.config.duration_secs);

        let mut probes = JoinSet::new();
        for (name, ip) in interfaces {
            let probe_addr = self.config.probe_addr.clone();
            probes.spawn(probe_interface(name, ip, probe_addr, duration));
        }

        let mut fresh = Vec::new();
        while let Some(result) = probes.join_next().await {
            match result {
                Ok(outcome) => fresh.push(self.settle(outcome)),
                Err(e) => tracing::warn!(error = %e, "interface probe task failed"),
            }
        }

        for metric in &mut fresh {
            metric.link_score = self.score(metric);
            self.metrics.insert(metric.interface.clone(), metric.clone());
        }
        fresh.sort_by(|a, b| b.link_score.total_cmp(&a.link_score));
        fresh
    }

    /// Turn a probe outcome into metrics. A failed probe keeps the previous
    /// metrics when there are any, else conservative defaults; the warning
    /// is logged once per interface.
    fn settle(&self, outcome: ProbeOutcome) -> LinkMetrics {
        let detail = match outcome.result {
            ProbeResult::Measured(metrics) => return metrics,
            ProbeResult::NoSamples => "no RTT samples".to_string(),
            ProbeResult::SocketFailed(e) => e.to_string(),
        };
        if self.warned.insert(outcome.interface.clone()) {
            tracing::warn!(
                interface = %outcome.interface,
                detail,
                "could not probe interface, using previous or estimated metrics"
            );
        }
        self.metrics
            .get(&outcome.interface)
            .map(|m| m.clone())
            .unwrap_or_else(|| default_metrics(&outcome.interface, outcome.ip))
    }

    /// Non-loopback interfaces with an IPv4 address. Falls back to loopback
    /// when nothing else exists so single-host demos still have an uplink.
    fn active_interfaces(&self) -> Vec<(String, Ipv4Addr)> {
        let all = match if_addrs::get_if_addrs() {
            Ok(all) => all,
            Err(e) => {
                tracing::warn!(error = %e, "interface enumeration failed");
                return Vec::new();
            }
        };

        let mut interfaces: Vec<(String, Ipv4Addr)> = all
            .iter()
            .filter(|i| !i.is_loopback())
            .filter_map(|i| match i.ip() {
                std::net::IpAddr::V4(ip) => Some((i.name.clone(), ip)),
                std::net::IpAddr::V6(_) => None,
            })
            .collect();

        if interfaces.is_empty() {
            if let Some(lo) = all.iter().find_map(|i| match (i.is_loopback(), i.ip()) {
                (true, std::net::IpAddr::V4(ip)) => Some((i.name.clone(), ip)),
                _ => None,
            }) {
                if self.warned.insert(format!("fallback:{}", lo.0)) {
                    tracing::warn!("no active interfaces found, falling back to loopback");
                }
                interfaces.push(lo);
            }
        }

        interfaces
    }

    /// Composite link score in 0..1. Inactive links score 0.
    fn score(&self, m: &LinkMetrics) -> f64 {
        if !m.is_active {
            return 0.0;
        }
        let throughput_norm = (m.throughput_mbps / 100.0).min(1.0);
        let rtt_norm = (1.0 - m.rtt_ms / 200.0).max(0.0);
        let loss_norm = 1.0 - m.packet_loss;

        let score = self.weights.throughput * throughput_norm
            + self.weights.rtt * rtt_norm
            + self.weights.loss * loss_norm
            + self.weights.stability * m.stability_score;
        score.clamp(0.0, 1.0)
    }

    /// The highest-scoring link at or above the minimum score; below the
    /// threshold, any active link; otherwise none.
    pub fn best_link(&self) -> Option<LinkMetrics> {
        let all: Vec<LinkMetrics> = self.metrics.iter().map(|e| e.value().clone()).collect();

        let best = all
            .iter()
            .filter(|m| m.is_active && m.link_score >= self.config.min_link_score)
            .max_by(|a, b| a.link_score.total_cmp(&b.link_score));
        if let Some(best) = best {
            return Some(best.clone());
        }
        all.into_iter()
            .filter(|m| m.is_active)
            .max_by(|a, b| a.link_score.total_cmp(&b.link_score))
    }

    /// Record externally measured metrics for an interface, scoring them
    /// with the configured weights. Lets harnesses and fault drills pin a
    /// known link without waiting for a probe cycle.
    pub fn record(&self, mut metrics: LinkMetrics) {
        metrics.link_score = self.score(&metrics);
        self.metrics.insert(metrics.interface.clone(), metrics);
    }

    /// Current metrics, best-first. Does not probe.
    pub fn snapshot(&self) -> Vec<LinkMetrics> {
        let mut all: Vec<LinkMetrics> = self.metrics.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.link_score.total_cmp(&a.link_score));
        all
    }

    /// Periodic scan loop. Runs until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.interval_secs);
        loop {
            let links = self.scan_all().await;
            tracing::debug!(links = links.len(), "interface scan complete");
            tokio::time::sleep(interval).await;
        }
    }
}

// ── Probing ───────────────────────────────────────────────────────────────────

struct ProbeOutcome {
    interface: String,
    ip: Ipv4Addr,
    result: ProbeResult,
}

enum ProbeResult {
    Measured(LinkMetrics),
    NoSamples,
    SocketFailed(std::io::Error),
}

/// Probe one interface: short datagrams at ~10 Hz for the scan duration,
/// tallying RTT samples against replies.
async fn probe_interface(
    interface: String,
    ip: Ipv4Addr,
    probe_addr: String,
    duration: Duration,
) -> ProbeOutcome {
    let target: SocketAddr = match probe_addr.parse() {
        Ok(addr) => addr,
        Err(_) => {
            return ProbeOutcome {
                interface,
                ip,
                result: ProbeResult::SocketFailed(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "invalid probe address",
                )),
            }
        }
    };

    let socket = match bind_to_interface(&interface, ip) {
        Ok(s) => s,
        Err(e) => {
            return ProbeOutcome {
                interface,
                ip,
                result: ProbeResult::SocketFailed(e),
            }
        }
    };

    let mut rtt_samples: Vec<f64> = Vec::new();
    let mut sent = 0u32;
    let mut received = 0u32;
    let mut reply = [0u8; 1024];

    let started = Instant::now();
    while started.elapsed() < duration {
        let send_time = Instant::now();
        if socket.send_to(b"probe", target).await.is_err() {
            break;
        }
        sent += 1;

        match tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut reply)).await {
            Ok(Ok(_)) => {
                rtt_samples.push(send_time.elapsed().as_secs_f64() * 1000.0);
                received += 1;
            }
            Ok(Err(_)) | Err(_) => {}
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if rtt_samples.is_empty() {
        return ProbeOutcome {
            interface,
            ip,
            result: ProbeResult::NoSamples,
        };
    }

    let rtt_ms = mean(&rtt_samples);
    let jitter_ms = stdev(&rtt_samples, rtt_ms);
    let packet_loss = if sent > 0 {
        1.0 - received as f64 / sent as f64
    } else {
        1.0
    };
    let stability_score = (1.0 - jitter_ms / 100.0 - packet_loss).clamp(0.0, 1.0);

    ProbeOutcome {
        ip,
        result: ProbeResult::Measured(LinkMetrics {
            interface: interface.clone(),
            ip_address: ip,
            throughput_mbps: throughput_estimate(&interface),
            rtt_ms,
            packet_loss,
            jitter_ms,
            stability_score,
            link_score: 0.0,
            is_active: true,
            last_updated: Utc::now(),
        }),
        interface,
    }
}

/// A UDP socket routed through a specific interface: SO_BINDTODEVICE where
/// the platform and privileges allow it, otherwise bound to the interface's
/// address, which gives the same routing without elevation.
pub fn bind_to_interface(interface: &str, ip: Ipv4Addr) -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    #[cfg(target_os = "linux")]
    let bound_to_device = socket.bind_device(Some(interface.as_bytes())).is_ok();
    #[cfg(not(target_os = "linux"))]
    let bound_to_device = false;
    let _ = interface;

    if !bound_to_device {
        let addr = SocketAddr::new(ip.into(), 0);
        socket.bind(&addr.into())?;
    }

    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Coarse throughput estimate from interface tx counters, capped at
/// 100 Mbps. Defaults to 10 Mbps where counters are unavailable.
fn throughput_estimate(interface: &str) -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(text) = std::fs::read_to_string("/proc/net/dev") {
            for line in text.lines() {
                let line = line.trim();
                if let Some(rest) = line.strip_prefix(&format!("{interface}:")) {
                    let fields: Vec<&str> = rest.split_whitespace().collect();
                    // Field 8 is cumulative tx bytes.
                    if let Some(tx_bytes) = fields.get(8).and_then(|f| f.parse::<f64>().ok()) {
                        return (tx_bytes / (1024.0 * 1024.0) * 0.1).min(100.0);
                    }
                }
            }
        }
    }
    let _ = interface;
    10.0
}

/// Conservative metrics for an interface that could not be probed. Wired
/// and wireless NIC names get a stronger estimate than tunnels and the like.
fn default_metrics(interface: &str, ip: Ipv4Addr) -> LinkMetrics {
    let looks_physical = interface.starts_with("en") || interface.starts_with("eth");
    let (throughput_mbps, rtt_ms, jitter_ms, stability_score) = if looks_physical {
        (50.0, 30.0, 2.0, 0.85)
    } else {
        (10.0, 50.0, 5.0, 0.8)
    };
    LinkMetrics {
        interface: interface.to_string(),
        ip_address: ip,
        throughput_mbps,
        rtt_ms,
        packet_loss: 0.0,
        jitter_ms,
        stability_score,
        link_score: 0.0,
        is_active: true,
        last_updated: Utc::now(),
    }
}

fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

fn stdev(samples: &[f64], mean: f64) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>()
        / (samples.len() - 1) as f64;
    variance.sqrt()
}
