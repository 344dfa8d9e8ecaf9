//! Transfer lifecycle commands.

use anyhow::Result;
use serde_json::Value;

use super::http::{base_url, post_json, post_json_body};

pub async fn cmd_transfer(port: u16, file_id: &str, host: &str, dest_port: u16) -> Result<()> {
    let body = serde_json::json!({
        "file_id": file_id,
        "destination_host": host,
        "destination_port": dest_port,
    });
    let resp: Value = post_json_body(
        &format!("{}/files/{}/transfer", base_url(port), file_id),
        &body,
    )
    .await?;

    println!(
        "Transfer {} → {}:{}",
        resp["status"].as_str().unwrap_or("started"),
        host,
        dest_port
    );
    println!("Watch it with: ferry-ctl status {}", file_id);
    Ok(())
}

pub async fn cmd_lifecycle(port: u16, file_id: &str, action: &str) -> Result<()> {
    let resp: Value =
        post_json(&format!("{}/files/{}/{}", base_url(port), file_id, action)).await?;
    println!(
        "{}: {}",
        resp["status"].as_str().unwrap_or(action),
        file_id
    );
    Ok(())
}
