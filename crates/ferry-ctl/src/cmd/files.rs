//! File commands — upload, listing, status, priority.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use super::http::{base_url, get_json, put_json_body};

#[derive(Deserialize)]
struct UploadResponse {
    file_id: String,
    filename: String,
    size: u64,
    priority: String,
    total_chunks: u32,
}

#[derive(Deserialize)]
struct FilesResponse {
    files: Vec<FileEntry>,
}

#[derive(Deserialize)]
struct FileEntry {
    file_id: String,
    filename: String,
    size: u64,
    priority: String,
    progress: Progress,
    status: String,
    is_paused: bool,
}

#[derive(Deserialize)]
struct Progress {
    progress: f64,
    chunks_complete: u32,
    chunks_total: u32,
}

pub async fn cmd_upload(port: u16, path: &str, priority: Option<&str>) -> Result<()> {
    use reqwest::multipart;

    let file_data =
        std::fs::read(path).with_context(|| format!("failed to read file: {}", path))?;

    let filename = std::path::Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string();

    let mut form = multipart::Form::new()
        .part("file", multipart::Part::bytes(file_data).file_name(filename));
    if let Some(priority) = priority {
        form = form.text("priority", priority.to_string());
    }

    let resp: UploadResponse = reqwest::Client::new()
        .post(format!("{}/files/upload", base_url(port)))
        .multipart(form)
        .send()
        .await
        .context("failed to upload file to daemon")?
        .json()
        .await
        .context("failed to parse upload response")?;

    println!("File staged for transfer:");
    println!("  File id  : {}", resp.file_id);
    println!("  Filename : {}", resp.filename);
    println!("  Bytes    : {}", resp.size);
    println!("  Chunks   : {}", resp.total_chunks);
    println!("  Priority : {}", resp.priority);
    println!();
    println!("Start it with: ferry-ctl transfer {} <host> <port>", resp.file_id);

    Ok(())
}

pub async fn cmd_files(port: u16) -> Result<()> {
    let resp: FilesResponse = get_json(&format!("{}/files", base_url(port))).await?;

    if resp.files.is_empty() {
        println!("No files registered.");
        return Ok(());
    }

    println!("═══════════════════════════════════════════════════════════");
    println!("  Files");
    println!("═══════════════════════════════════════════════════════════");
    for file in &resp.files {
        let pct = file.progress.progress * 100.0;
        let paused = if file.is_paused { " (paused)" } else { "" };
        println!("  {} — {}", file.file_id, file.filename);
        println!(
            "      {:>7} bytes  {:>5.1}%  {}/{} chunks  [{}{}] {}",
            file.size,
            pct,
            file.progress.chunks_complete,
            file.progress.chunks_total,
            file.status,
            paused,
            file.priority,
        );
    }

    Ok(())
}

pub async fn cmd_status(port: u16, file_id: &str) -> Result<()> {
    let resp: Value = get_json(&format!("{}/files/{}", base_url(port), file_id)).await?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

pub async fn cmd_priority(port: u16, file_id: &str, priority: &str) -> Result<()> {
    let body = serde_json::json!({ "priority": priority });
    let resp: Value = put_json_body(
        &format!("{}/files/{}/priority", base_url(port), file_id),
        &body,
    )
    .await?;
    println!("Priority updated: {}", resp["priority"].as_str().unwrap_or(priority));
    Ok(())
}
