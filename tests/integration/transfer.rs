//! End-to-end transfer scenarios over loopback UDP.

use crate::*;

use std::time::Duration;

use ferry_core::digest::file_digest;
use ferry_services::ShaperConfig;

/// 2 MiB, one clean link: every chunk sent once, everything acked, output
/// byte-exact.
#[tokio::test]
async fn baseline_transfer_completes_exactly() {
    let dir = temp_dir("baseline");
    let r = rig(&dir.join("manifests"), ferry_core::config::TransferConfig::default());
    loopback_link(&r.scout, "lo-test", 1.0);
    let src = stage_file(&r.store, &dir, 2 * 1024 * 1024, "base-1");

    let (recv, addr, recv_task) = spawn_receiver(&dir.join("received")).await;
    recv.expect("base-1", 32);

    r.engine.start("base-1", "127.0.0.1", addr.port()).unwrap();

    let store = r.store.clone();
    wait_for("transfer completion", Duration::from_secs(30), || {
        // Window bound holds at every observation point.
        assert!(store.get_in_flight("base-1").unwrap().len() <= 10);
        store.is_complete("base-1").unwrap()
    })
    .await;

    let engine = r.engine.clone();
    wait_for("task shutdown", Duration::from_secs(5), || {
        !engine.is_active("base-1")
    })
    .await;

    let stats = r.engine.status("base-1").unwrap();
    assert_eq!(stats.chunks_sent, 32);
    assert_eq!(stats.chunks_acked, 32);
    assert_eq!(stats.retransmissions, 0);

    let progress = r.store.get_progress("base-1").unwrap();
    assert_eq!(progress.bytes_transferred, 2 * 1024 * 1024);
    assert!((progress.progress - 1.0).abs() < 1e-9);

    let manifest = r.store.load("base-1").unwrap();
    assert!(manifest.completed_at.is_some());

    assert_eq!(recv.chunks_received("base-1"), 32);
    let out = recv.write_file("base-1").unwrap();
    assert_eq!(file_digest(&out).unwrap(), file_digest(&src).unwrap());

    recv_task.abort();
    let _ = std::fs::remove_dir_all(&dir);
}

/// A second start for an active file is rejected.
#[tokio::test]
async fn start_is_idempotent_per_file() {
    let dir = temp_dir("double-start");
    let r = rig(&dir.join("manifests"), fast_transfer_config());
    loopback_link(&r.scout, "lo-test", 1.0);
    stage_file(&r.store, &dir, 256 * 1024, "dbl-1");

    // Blackout keeps the first task alive while we try again.
    r.shaper.kill(None);

    let (_recv, addr, recv_task) = spawn_receiver(&dir.join("received")).await;
    r.engine.start("dbl-1", "127.0.0.1", addr.port()).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = r.engine.start("dbl-1", "127.0.0.1", addr.port());
    assert!(matches!(
        second,
        Err(ferry_services::EngineError::AlreadyActive(_))
    ));

    // Unknown files are rejected outright.
    assert!(r.engine.start("missing", "127.0.0.1", addr.port()).is_err());

    r.engine.cancel("dbl-1");
    recv_task.abort();
    let _ = std::fs::remove_dir_all(&dir);
}

/// 30% outbound loss: the timeout path retransmits until everything lands;
/// the output is still byte-exact.
#[tokio::test]
async fn lossy_link_converges_with_retransmissions() {
    let dir = temp_dir("loss30");
    let r = rig(&dir.join("manifests"), fast_transfer_config());
    loopback_link(&r.scout, "lo-test", 1.0);
    let src = stage_file(&r.store, &dir, 2 * 1024 * 1024, "loss-1");

    r.shaper.set_global(ShaperConfig {
        packet_loss: 0.3,
        enabled: true,
        ..Default::default()
    });

    let (recv, addr, recv_task) = spawn_receiver(&dir.join("received")).await;
    recv.expect("loss-1", 32);

    r.engine.start("loss-1", "127.0.0.1", addr.port()).unwrap();

    let store = r.store.clone();
    wait_for("lossy transfer completion", Duration::from_secs(60), || {
        assert!(store.get_in_flight("loss-1").unwrap().len() <= 10);
        store.is_complete("loss-1").unwrap()
    })
    .await;

    let stats = r.engine.status("loss-1").unwrap();
    assert!(stats.retransmissions > 0, "30% loss must force retransmits");
    assert_eq!(stats.chunks_acked, 32);

    assert_eq!(recv.chunks_received("loss-1"), 32);
    let out = recv.write_file("loss-1").unwrap();
    assert_eq!(file_digest(&out).unwrap(), file_digest(&src).unwrap());

    recv_task.abort();
    let _ = std::fs::remove_dir_all(&dir);
}

/// Kill the best uplink mid-transfer: the engine rebinds to the runner-up,
/// finishes, and no acked chunk regresses.
#[tokio::test]
async fn dead_uplink_triggers_switch_and_completion() {
    let dir = temp_dir("killlink");
    let r = rig(&dir.join("manifests"), fast_transfer_config());
    let src = stage_file(&r.store, &dir, 2 * 1024 * 1024, "kill-1");

    // Two uplinks; ferry-a scores higher and is picked first.
    loopback_link(&r.scout, "ferry-a", 1.0);
    loopback_link(&r.scout, "ferry-b", 60.0);

    let (recv, addr, recv_task) = spawn_receiver(&dir.join("received")).await;
    recv.expect("kill-1", 32);

    r.engine.start("kill-1", "127.0.0.1", addr.port()).unwrap();

    let store = r.store.clone();
    wait_for("mid-transfer progress", Duration::from_secs(30), || {
        store.get_progress("kill-1").unwrap().progress >= 0.3
    })
    .await;

    let acked_at_kill = r.store.get_progress("kill-1").unwrap().chunks_complete;

    // The link dies: sends black-hole and the next scan reports it down.
    r.shaper.kill(Some("ferry-a"));
    let mut dead = r
        .scout
        .snapshot()
        .into_iter()
        .find(|m| m.interface == "ferry-a")
        .unwrap();
    dead.is_active = false;
    r.scout.record(dead);

    let store = r.store.clone();
    wait_for("completion after switch", Duration::from_secs(60), || {
        store.is_complete("kill-1").unwrap()
    })
    .await;

    let stats = r.engine.status("kill-1").unwrap();
    assert_eq!(stats.current_link.as_deref(), Some("ferry-b"));
    assert!(
        stats.link_switches >= 2,
        "initial bind plus at least one failover"
    );

    // Progress is monotone across the switch.
    let progress = r.store.get_progress("kill-1").unwrap();
    assert!(progress.chunks_complete >= acked_at_kill);
    assert_eq!(progress.chunks_complete, 32);

    let out = recv.write_file("kill-1").unwrap();
    assert_eq!(file_digest(&out).unwrap(), file_digest(&src).unwrap());

    recv_task.abort();
    let _ = std::fs::remove_dir_all(&dir);
}

/// Kill the process halfway (simulated by aborting the task), reload from
/// disk, and finish: only the chunks that were never acked get sent.
#[tokio::test]
async fn restart_resumes_without_resending_acked_chunks() {
    let dir = temp_dir("restart");
    let manifests = dir.join("manifests");

    let first = rig(&manifests, ferry_core::config::TransferConfig::default());
    loopback_link(&first.scout, "lo-test", 1.0);
    let src = stage_file(&first.store, &dir, 1024 * 1024, "res-1");

    // Slow each send down so the halfway point is observable.
    first.shaper.set_global(ShaperConfig {
        latency_ms: 50.0,
        enabled: true,
        ..Default::default()
    });

    let (recv, addr, recv_task) = spawn_receiver(&dir.join("received")).await;
    recv.expect("res-1", 16);

    first.engine.start("res-1", "127.0.0.1", addr.port()).unwrap();

    let store = first.store.clone();
    wait_for("half transferred", Duration::from_secs(30), || {
        store.get_progress("res-1").unwrap().progress >= 0.5
    })
    .await;

    // "kill -9": the task dies at a suspension point, state stays on disk.
    first.engine.cancel("res-1");

    // A fresh process: new store (cold cache), new engine, same manifest dir.
    let second = rig(&manifests, ferry_core::config::TransferConfig::default());
    loopback_link(&second.scout, "lo-test", 1.0);
    let acked_before = second.store.get_progress("res-1").unwrap().chunks_complete;
    assert!(acked_before >= 8, "expected ≥ 50% acked, got {acked_before}");

    second.engine.start("res-1", "127.0.0.1", addr.port()).unwrap();

    let store = second.store.clone();
    wait_for("resumed completion", Duration::from_secs(30), || {
        store.is_complete("res-1").unwrap()
    })
    .await;

    // Clean link, so the second run sends exactly the remainder.
    let stats = second.engine.status("res-1").unwrap();
    assert_eq!(stats.chunks_sent, (16 - acked_before) as u64);
    assert_eq!(stats.retransmissions, 0);

    let out = recv.write_file("res-1").unwrap();
    assert_eq!(file_digest(&out).unwrap(), file_digest(&src).unwrap());

    recv_task.abort();
    let _ = std::fs::remove_dir_all(&dir);
}

/// Total blackout longer than the whole backoff schedule: chunks exhaust
/// their retries and surface as FAILED; the file never claims completion.
#[tokio::test]
async fn sustained_blackout_marks_chunks_failed() {
    let dir = temp_dir("blackout");
    let config = ferry_core::config::TransferConfig {
        retry_delay_base_ms: 100,
        max_retries: 2,
        ..Default::default()
    };
    let r = rig(&dir.join("manifests"), config);
    loopback_link(&r.scout, "lo-test", 1.0);
    stage_file(&r.store, &dir, 100_000, "dark-1");

    r.shaper.kill(None);

    let (recv, addr, recv_task) = spawn_receiver(&dir.join("received")).await;
    r.engine.start("dark-1", "127.0.0.1", addr.port()).unwrap();

    // FAILED is transient (the loop resurrects with a fresh counter), so
    // poll tightly to observe it.
    let store = r.store.clone();
    let started = std::time::Instant::now();
    let mut saw_failed = false;
    while started.elapsed() < Duration::from_secs(10) {
        let manifest = store.load("dark-1").unwrap();
        if manifest
            .chunks
            .values()
            .any(|c| c.status == ferry_core::manifest::ChunkStatus::Failed)
        {
            saw_failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(saw_failed, "no chunk ever reached FAILED under blackout");

    let stats = r.engine.status("dark-1").unwrap();
    assert!(stats.retransmissions >= 2);
    assert!(!r.store.is_complete("dark-1").unwrap());
    assert_eq!(recv.chunks_received("dark-1"), 0);

    r.engine.cancel("dark-1");
    recv_task.abort();
    let _ = std::fs::remove_dir_all(&dir);
}

/// A shaper-dropped retransmission leaves the persisted `sent_at`
/// untouched: only a packet that actually goes out refreshes the stamp,
/// and recovery stays purely timeout-driven.
#[tokio::test]
async fn shaper_drop_preserves_sent_at() {
    let dir = temp_dir("dropstamp");
    // Wide backoff schedule so the chunk cannot exhaust into FAILED (which
    // legitimately restamps on resurrection) while we observe it.
    let config = ferry_core::config::TransferConfig {
        retry_delay_base_ms: 300,
        max_retries: 5,
        ..Default::default()
    };
    let r = rig(&dir.join("manifests"), config);
    loopback_link(&r.scout, "lo-test", 1.0);
    stage_file(&r.store, &dir, 4096, "drop-1");

    // Every packet drops, the first send included.
    r.shaper.set_global(ShaperConfig {
        packet_loss: 1.0,
        enabled: true,
        ..Default::default()
    });

    let (_recv, addr, recv_task) = spawn_receiver(&dir.join("received")).await;
    r.engine.start("drop-1", "127.0.0.1", addr.port()).unwrap();

    let store = r.store.clone();
    wait_for("first send stamp", Duration::from_secs(10), || {
        store.load("drop-1").unwrap().chunks[&0].sent_at.is_some()
    })
    .await;
    let first_stamp = r.store.load("drop-1").unwrap().chunks[&0].sent_at;

    // At least one timeout-driven retransmission fires, and drops too.
    let engine = r.engine.clone();
    wait_for("a retransmission", Duration::from_secs(10), || {
        engine.status("drop-1").unwrap().retransmissions >= 1
    })
    .await;

    let chunk = r.store.load("drop-1").unwrap().chunks[&0].clone();
    assert_eq!(chunk.status, ferry_core::manifest::ChunkStatus::InFlight);
    assert_eq!(
        chunk.sent_at, first_stamp,
        "dropped retransmission must not restamp sent_at"
    );
    assert!(chunk.retry_count >= 1, "retry accounting stays timeout-driven");

    r.engine.cancel("drop-1");
    recv_task.abort();
    let _ = std::fs::remove_dir_all(&dir);
}

/// Duplicate DATA datagrams are stored once and re-acked every time.
#[tokio::test]
async fn duplicate_data_is_idempotent_and_reacked() {
    use bytes::Bytes;
    use ferry_core::digest::chunk_digest;
    use ferry_core::wire::{AckPacket, DataPacket};

    let dir = temp_dir("dup");
    let (recv, addr, recv_task) = spawn_receiver(&dir.join("received")).await;

    let payload = b"duplicate delivery test payload";
    let wire = DataPacket {
        file_id: "dup-1".to_string(),
        chunk_id: 0,
        offset: 0,
        original_size: payload.len() as u32,
        compressed: false,
        chunk_hash: chunk_digest(payload),
        payload: Bytes::from_static(payload),
    }
    .encode()
    .unwrap();

    let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 256];
    for _ in 0..2 {
        sender.send_to(&wire, addr).await.unwrap();
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), sender.recv_from(&mut buf))
            .await
            .expect("ack deadline")
            .unwrap();
        let ack = AckPacket::decode(&buf[..n]).unwrap();
        assert_eq!(ack.file_id, "dup-1");
        assert_eq!(ack.chunk_id, 0);
    }

    assert_eq!(recv.chunks_received("dup-1"), 1);

    recv_task.abort();
    let _ = std::fs::remove_dir_all(&dir);
}

/// Pause stalls progress; resume finishes the job.
#[tokio::test]
async fn pause_and_resume_round_trip() {
    let dir = temp_dir("pause");
    let r = rig(&dir.join("manifests"), fast_transfer_config());
    loopback_link(&r.scout, "lo-test", 1.0);
    let src = stage_file(&r.store, &dir, 512 * 1024, "pse-1");

    // Latency keeps the transfer running long enough to pause it.
    r.shaper.set_global(ShaperConfig {
        latency_ms: 40.0,
        enabled: true,
        ..Default::default()
    });

    let (recv, addr, recv_task) = spawn_receiver(&dir.join("received")).await;
    recv.expect("pse-1", 8);

    r.engine.start("pse-1", "127.0.0.1", addr.port()).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    r.engine.pause("pse-1");

    // Let in-flight acks settle, then confirm progress is frozen.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let frozen = r.store.get_progress("pse-1").unwrap().chunks_complete;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        r.store.get_progress("pse-1").unwrap().chunks_complete,
        frozen
    );
    assert!(r.engine.status("pse-1").unwrap().is_paused);

    r.engine.resume("pse-1");
    let store = r.store.clone();
    wait_for("completion after resume", Duration::from_secs(30), || {
        store.is_complete("pse-1").unwrap()
    })
    .await;

    let out = recv.write_file("pse-1").unwrap();
    assert_eq!(file_digest(&out).unwrap(), file_digest(&src).unwrap());

    recv_task.abort();
    let _ = std::fs::remove_dir_all(&dir);
}
