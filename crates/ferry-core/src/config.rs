//! Configuration system for Ferry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FERRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ferry/config.toml
//!   3. ~/.config/ferry/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub transfer: TransferConfig,
    pub scan: ScanConfig,
    pub score_weights: ScoreWeights,
    pub paths: PathsConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Fixed chunk size in bytes.
    pub chunk_size: u32,
    /// Upper bound on concurrently outstanding chunks per file.
    pub window: usize,
    /// Retransmissions before a chunk is marked failed.
    pub max_retries: u32,
    /// Base of the exponential retransmission backoff, in milliseconds.
    pub retry_delay_base_ms: u64,
    /// EWMA smoothing factor. Reserved for RTT-adaptive timeouts.
    pub adaptive_rtt_alpha: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Seconds between interface scans.
    pub interval_secs: u64,
    /// Seconds each interface is probed per scan.
    pub duration_secs: u64,
    /// Links scoring below this are ignored unless nothing else is active.
    pub min_link_score: f64,
    /// Well-known reachable endpoint probes are sent to.
    pub probe_addr: String,
}

/// Weights combining normalized link metrics into the 0..1 link score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub throughput: f64,
    pub rtt: f64,
    pub loss: f64,
    pub stability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Where manifests are persisted, one JSON document per file id.
    pub manifest_dir: PathBuf,
    /// Staging directory for uploaded files awaiting transfer.
    pub upload_dir: PathBuf,
    /// Where the receiver writes reconstructed files.
    pub receive_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            window: 10,
            max_retries: 3,
            retry_delay_base_ms: 1000,
            adaptive_rtt_alpha: 0.125,
        }
    }
}

impl TransferConfig {
    pub fn retry_delay_base(&self) -> Duration {
        Duration::from_millis(self.retry_delay_base_ms)
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            duration_secs: 2,
            min_link_score: 0.05,
            probe_addr: "8.8.8.8:53".to_string(),
        }
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            throughput: 0.4,
            rtt: 0.3,
            loss: 0.2,
            stability: 0.1,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            manifest_dir: data_dir().join("manifests"),
            upload_dir: data_dir().join("uploads"),
            receive_dir: data_dir().join("received"),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ferry")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("ferry")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FerryConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            FerryConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FERRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FerryConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply FERRY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FERRY_TRANSFER__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.transfer.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("FERRY_TRANSFER__WINDOW") {
            if let Ok(n) = v.parse() {
                self.transfer.window = n;
            }
        }
        if let Ok(v) = std::env::var("FERRY_TRANSFER__MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.transfer.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("FERRY_SCAN__PROBE_ADDR") {
            self.scan.probe_addr = v;
        }
        if let Ok(v) = std::env::var("FERRY_PATHS__MANIFEST_DIR") {
            self.paths.manifest_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FERRY_API__PORT") {
            if let Ok(p) = v.parse() {
                self.api.port = p;
            }
        }
    }
}
