//! ferryd — Ferry transfer daemon.
//!
//! Default mode runs the sender side: manifest store, link scout, transfer
//! engine, and the HTTP/WebSocket control surface. `ferryd recv [port]
//! [dir]` runs the receiver-side reassembler standalone on the peer host.

mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};

use ferry_core::config::FerryConfig;
use ferry_services::{LinkScout, LinkShaper, ManifestStore, Reassembler, TransferEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing — RUST_LOG controls verbosity
    // e.g. RUST_LOG=debug cargo run -p ferryd
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = FerryConfig::load().context("failed to load configuration")?;

    if args.first().map(String::as_str) == Some("recv") {
        return run_receiver(&args[1..], &config).await;
    }

    run_daemon(config).await
}

async fn run_receiver(args: &[String], config: &FerryConfig) -> Result<()> {
    let port: u16 = match args.first() {
        Some(raw) => raw.parse().context("receiver port must be a number")?,
        None => 9000,
    };
    let dir = args
        .get(1)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| config.paths.receive_dir.clone());

    tracing::info!(port, dir = %dir.display(), "ferryd starting in receiver mode");
    Reassembler::new(dir).serve(port).await
}

async fn run_daemon(config: FerryConfig) -> Result<()> {
    let config_path = FerryConfig::write_default_if_missing()?;
    tracing::info!(config = %config_path.display(), "ferryd starting");

    std::fs::create_dir_all(&config.paths.upload_dir)
        .with_context(|| format!("creating {}", config.paths.upload_dir.display()))?;

    let store = Arc::new(ManifestStore::new(&config.paths.manifest_dir)?);
    let scout = Arc::new(LinkScout::new(
        config.scan.clone(),
        config.score_weights.clone(),
    ));
    let shaper = Arc::new(LinkShaper::new());
    let engine = Arc::new(TransferEngine::new(
        store.clone(),
        scout.clone(),
        shaper.clone(),
        config.transfer.clone(),
    ));

    // Telemetry fan-out: the engine's progress sink and the periodic link
    // snapshot both feed WebSocket clients through one broadcast channel.
    let (telemetry_tx, _) = tokio::sync::broadcast::channel(64);
    engine.set_progress_sink(Arc::new(telemetry::TelemetrySink::new(telemetry_tx.clone())));

    let scout_task = tokio::spawn(scout.clone().run());
    let telemetry_task = tokio::spawn(telemetry::link_metrics_loop(
        scout.clone(),
        telemetry_tx.clone(),
    ));

    let state = ferry_api::ApiState {
        store,
        scout,
        shaper,
        engine,
        upload_dir: config.paths.upload_dir.clone(),
        chunk_size: config.transfer.chunk_size,
        telemetry: telemetry_tx,
    };
    let api_task = tokio::spawn(async move {
        ferry_api::serve(state, &config.api.host, config.api.port).await
    });

    // These run forever; reaching select catches panics and bind failures.
    tokio::select! {
        r = scout_task     => tracing::error!("scout task exited: {:?}", r),
        r = telemetry_task => tracing::error!("telemetry task exited: {:?}", r),
        r = api_task       => tracing::error!("api task exited: {:?}", r),
    }

    Ok(())
}
