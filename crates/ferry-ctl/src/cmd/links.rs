//! Link commands — uplink metrics and best-link selection.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct LinksResponse {
    links: Vec<Link>,
}

#[derive(Deserialize)]
struct Link {
    interface: String,
    ip_address: String,
    throughput_mbps: f64,
    rtt_ms: f64,
    packet_loss: f64,
    jitter_ms: f64,
    link_score: f64,
    is_active: bool,
}

pub async fn cmd_links(port: u16) -> Result<()> {
    let resp: LinksResponse = get_json(&format!("{}/links", base_url(port))).await?;

    if resp.links.is_empty() {
        println!("No links scanned yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════════════════════════");
    println!("  Uplinks");
    println!("═══════════════════════════════════════════════════════════");
    for link in &resp.links {
        let state = if link.is_active { "up" } else { "down" };
        println!("  {:12} {:16} [{}]", link.interface, link.ip_address, state);
        println!(
            "      score {:.2}  rtt {:.1} ms  jitter {:.1} ms  loss {:.1}%  ~{:.0} Mbps",
            link.link_score,
            link.rtt_ms,
            link.jitter_ms,
            link.packet_loss * 100.0,
            link.throughput_mbps,
        );
    }
    Ok(())
}

pub async fn cmd_scan(port: u16) -> Result<()> {
    println!("Probing uplinks (takes a few seconds)...");
    let resp: LinksResponse =
        super::http::post_json(&format!("{}/links/scan", base_url(port))).await?;
    println!("Scanned {} uplinks.", resp.links.len());
    for link in &resp.links {
        println!(
            "  {:12} {:16} score {:.2}",
            link.interface, link.ip_address, link.link_score
        );
    }
    Ok(())
}

pub async fn cmd_best_link(port: u16) -> Result<()> {
    let link: Link = get_json(&format!("{}/links/best", base_url(port))).await?;
    println!(
        "{} ({}) — score {:.2}, rtt {:.1} ms, loss {:.1}%",
        link.interface,
        link.ip_address,
        link.link_score,
        link.rtt_ms,
        link.packet_loss * 100.0,
    );
    Ok(())
}
