//! ferry-ctl — command-line interface for the Ferry daemon.

use anyhow::{Context, Result};

mod cmd;

const DEFAULT_PORT: u16 = 8080;

fn print_usage() {
    println!("Usage: ferry-ctl [--port <port>] <command>");
    println!();
    println!("Files");
    println!("  upload <file>                   Stage a file for transfer");
    println!("  upload <file> --priority <p>    Stage with priority (high|standard|background)");
    println!("  files                           List registered files and their progress");
    println!("  status <file_id>                Detailed status of one file");
    println!("  priority <file_id> <p>          Change a file's priority");
    println!();
    println!("Transfers");
    println!("  transfer <file_id> <host> <port>  Start sending to a receiver");
    println!("  pause <file_id>                 Pause an active transfer");
    println!("  resume <file_id>                Resume a paused transfer");
    println!("  cancel <file_id>                Cancel a transfer");
    println!();
    println!("Links");
    println!("  links                           Show all uplinks with scores");
    println!("  links best                      Show the currently selected uplink");
    println!("  links scan                      Probe all uplinks now");
    println!();
    println!("Shaper (fault injection)");
    println!("  shaper set <loss> [latency_ms] [jitter_ms] [--interface <i>]");
    println!("  shaper kill [--interface <i>]   Simulate a dead link");
    println!("  shaper restore [--interface <i>]");
    println!("  shaper reset [--interface <i>]");
    println!();
    println!(
        "Options:\n  --port <port>                   API port (default: {})",
        DEFAULT_PORT
    );
    println!();
    println!("Examples:");
    println!("  ferry-ctl upload backup.tar --priority high");
    println!("  ferry-ctl transfer 4f1c... 192.168.1.20 9000");
    println!("  ferry-ctl shaper set 0.3");
    println!("  ferry-ctl shaper kill --interface eth0");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port and --interface options wherever they appear.
    let mut port = DEFAULT_PORT;
    let mut interface: Option<String> = None;
    let mut remaining: Vec<String> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            "--interface" => {
                i += 1;
                interface = Some(
                    args.get(i)
                        .context("--interface requires a value")?
                        .clone(),
                );
            }
            _ => remaining.push(args[i].clone()),
        }
        i += 1;
    }

    // Handle upload with optional priority flag.
    if remaining.first().map(String::as_str) == Some("upload") && remaining.len() >= 2 {
        let path = remaining[1].clone();
        let mut priority = None;
        let mut j = 2;
        while j < remaining.len() {
            match remaining[j].as_str() {
                "--priority" => {
                    j += 1;
                    priority = remaining.get(j).cloned();
                }
                other => anyhow::bail!("Unknown option: {}", other),
            }
            j += 1;
        }
        return cmd::files::cmd_upload(port, &path, priority.as_deref()).await;
    }

    let remaining_refs: Vec<&str> = remaining.iter().map(|s| s.as_str()).collect();
    match remaining_refs.as_slice() {
        ["files"] => cmd::files::cmd_files(port).await,
        ["status", file_id] => cmd::files::cmd_status(port, file_id).await,
        ["priority", file_id, priority] => cmd::files::cmd_priority(port, file_id, priority).await,
        ["transfer", file_id, host, dest_port] => {
            let dest_port: u16 = dest_port.parse().context("destination port must be a number")?;
            cmd::transfers::cmd_transfer(port, file_id, host, dest_port).await
        }
        ["pause", file_id] => cmd::transfers::cmd_lifecycle(port, file_id, "pause").await,
        ["resume", file_id] => cmd::transfers::cmd_lifecycle(port, file_id, "resume").await,
        ["cancel", file_id] => cmd::transfers::cmd_lifecycle(port, file_id, "cancel").await,
        ["links"] => cmd::links::cmd_links(port).await,
        ["links", "best"] => cmd::links::cmd_best_link(port).await,
        ["links", "scan"] => cmd::links::cmd_scan(port).await,
        ["shaper", "set", loss, rest @ ..] => {
            let loss: f64 = loss.parse().context("loss must be a number in [0, 1]")?;
            let latency: f64 = rest
                .first()
                .map(|v| v.parse())
                .transpose()
                .context("latency_ms must be a number")?
                .unwrap_or(0.0);
            let jitter: f64 = rest
                .get(1)
                .map(|v| v.parse())
                .transpose()
                .context("jitter_ms must be a number")?
                .unwrap_or(0.0);
            cmd::shaper::cmd_set(port, loss, latency, jitter, interface.as_deref()).await
        }
        ["shaper", "kill"] => cmd::shaper::cmd_action(port, "kill-link", interface.as_deref()).await,
        ["shaper", "restore"] => {
            cmd::shaper::cmd_action(port, "restore-link", interface.as_deref()).await
        }
        ["shaper", "reset"] => cmd::shaper::cmd_action(port, "reset", interface.as_deref()).await,
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
