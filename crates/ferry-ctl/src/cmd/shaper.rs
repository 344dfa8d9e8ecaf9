//! Shaper commands — fault injection controls.

use anyhow::Result;
use serde_json::Value;

use super::http::{base_url, post_json, post_json_body};

pub async fn cmd_set(
    port: u16,
    packet_loss: f64,
    latency_ms: f64,
    jitter_ms: f64,
    interface: Option<&str>,
) -> Result<()> {
    let body = serde_json::json!({
        "packet_loss": packet_loss,
        "latency_ms": latency_ms,
        "jitter_ms": jitter_ms,
        "enabled": true,
        "kill_link": false,
        "interface": interface,
    });
    let _: Value = post_json_body(&format!("{}/shaper/config", base_url(port)), &body).await?;

    let scope = interface.unwrap_or("all interfaces");
    println!(
        "Shaper on {}: loss {:.0}%, latency {} ms, jitter {} ms",
        scope,
        packet_loss * 100.0,
        latency_ms,
        jitter_ms,
    );
    Ok(())
}

pub async fn cmd_action(port: u16, action: &str, interface: Option<&str>) -> Result<()> {
    let url = match interface {
        Some(name) => format!("{}/shaper/{}?interface={}", base_url(port), action, name),
        None => format!("{}/shaper/{}", base_url(port), action),
    };
    let resp: Value = post_json(&url).await?;
    println!(
        "{} ({})",
        resp["status"].as_str().unwrap_or(action),
        interface.unwrap_or("global"),
    );
    Ok(())
}
