//! Link shaper — fault injection for outbound sends, used in tests and
//! fault drills.
//!
//! A global config plus per-interface overrides; the interface config wins
//! when present. Disabled (the default) the shaper is an identity: every
//! packet passes, every delay is zero. Its drops are indistinguishable from
//! network loss to the engine — retries come from the timeout path only.

use std::sync::RwLock;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Delay reported for a killed link. Long enough that every in-flight
/// chunk times out before the send would have happened.
const KILLED_LINK_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaperConfig {
    /// Probability in [0, 1] that an outbound packet is dropped.
    pub packet_loss: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub enabled: bool,
    /// Total blackout: every send drops and delays report ≥ 10 s.
    pub kill_link: bool,
}

#[derive(Default)]
pub struct LinkShaper {
    global: RwLock<ShaperConfig>,
    per_link: DashMap<String, ShaperConfig>,
}

impl LinkShaper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_global(&self, config: ShaperConfig) {
        *self.global.write().expect("shaper lock") = config;
    }

    pub fn set_link(&self, interface: &str, config: ShaperConfig) {
        self.per_link.insert(interface.to_string(), config);
    }

    /// Effective config for an interface: its own when set, else global.
    pub fn effective(&self, interface: Option<&str>) -> ShaperConfig {
        if let Some(name) = interface {
            if let Some(cfg) = self.per_link.get(name) {
                return cfg.clone();
            }
        }
        self.global.read().expect("shaper lock").clone()
    }

    /// Should this packet go out? False means the caller drops it on the
    /// floor and lets the retransmission timeout recover.
    pub fn should_send(&self, interface: Option<&str>) -> bool {
        let config = self.effective(interface);
        if !config.enabled {
            return true;
        }
        if config.kill_link {
            return false;
        }
        !(config.packet_loss > 0.0 && rand::thread_rng().gen::<f64>() < config.packet_loss)
    }

    /// Artificial latency to apply before the real send.
    pub fn delay(&self, interface: Option<&str>) -> Duration {
        let config = self.effective(interface);
        if !config.enabled {
            return Duration::ZERO;
        }
        if config.kill_link {
            return KILLED_LINK_DELAY;
        }

        let mut total_ms = config.latency_ms;
        if config.jitter_ms > 0.0 {
            let jitter: f64 = rand::thread_rng().gen_range(-config.jitter_ms..=config.jitter_ms);
            total_ms += jitter;
        }
        Duration::from_secs_f64((total_ms / 1000.0).max(0.0))
    }

    /// Simulate a dead link, globally or for one interface.
    pub fn kill(&self, interface: Option<&str>) {
        match interface {
            Some(name) => {
                let mut cfg = self.effective(Some(name));
                cfg.kill_link = true;
                cfg.enabled = true;
                self.per_link.insert(name.to_string(), cfg);
            }
            None => {
                let mut global = self.global.write().expect("shaper lock");
                global.kill_link = true;
                global.enabled = true;
            }
        }
    }

    /// Revive a killed link. The shaper disables itself when no loss
    /// remains configured.
    pub fn restore(&self, interface: Option<&str>) {
        match interface {
            Some(name) => {
                if let Some(mut cfg) = self.per_link.get_mut(name) {
                    cfg.kill_link = false;
                    if cfg.packet_loss == 0.0 {
                        cfg.enabled = false;
                    }
                }
            }
            None => {
                let mut global = self.global.write().expect("shaper lock");
                global.kill_link = false;
                if global.packet_loss == 0.0 {
                    global.enabled = false;
                }
            }
        }
    }

    /// Clear one interface's override, or everything.
    pub fn reset(&self, interface: Option<&str>) {
        match interface {
            Some(name) => {
                self.per_link.remove(name);
            }
            None => {
                self.per_link.clear();
                *self.global.write().expect("shaper lock") = ShaperConfig::default();
            }
        }
    }
}
