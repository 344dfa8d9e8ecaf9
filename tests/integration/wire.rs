//! Wire format checks across a real socket pair.

use std::time::Duration;

use bytes::Bytes;

use ferry_core::digest::chunk_digest;
use ferry_core::wire::{AckPacket, DataPacket, MAX_DATAGRAM};

/// A full-size chunk survives a real UDP hop byte-for-byte.
#[tokio::test]
async fn max_chunk_survives_a_udp_hop() {
    let a = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let payload: Vec<u8> = (0..65536u32).map(|i| (i % 253) as u8).collect();
    let packet = DataPacket {
        file_id: "wire-hop".to_string(),
        chunk_id: 41,
        offset: 41 * 65536,
        original_size: payload.len() as u32,
        compressed: false,
        chunk_hash: chunk_digest(&payload),
        payload: Bytes::from(payload),
    };
    let wire = packet.encode().unwrap();
    assert!(wire.len() <= MAX_DATAGRAM);

    a.send_to(&wire, b.local_addr().unwrap()).await.unwrap();

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), b.recv_from(&mut buf))
        .await
        .expect("datagram deadline")
        .unwrap();

    let received = DataPacket::decode(&buf[..n]).unwrap();
    assert_eq!(received, packet);
}

/// ACKs and DATA share the channel without aliasing.
#[tokio::test]
async fn ack_and_data_coexist_on_one_socket() {
    let a = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let data = DataPacket {
        file_id: "mix".to_string(),
        chunk_id: 1,
        offset: 0,
        original_size: 4,
        compressed: false,
        chunk_hash: chunk_digest(b"mixx"),
        payload: Bytes::from_static(b"mixx"),
    }
    .encode()
    .unwrap();
    let ack = AckPacket {
        file_id: "mix".to_string(),
        chunk_id: 1,
    }
    .encode()
    .unwrap();

    a.send_to(&data, b.local_addr().unwrap()).await.unwrap();
    a.send_to(&ack, b.local_addr().unwrap()).await.unwrap();

    let mut buf = vec![0u8; 2048];
    let mut got_data = false;
    let mut got_ack = false;
    for _ in 0..2 {
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), b.recv_from(&mut buf))
            .await
            .expect("datagram deadline")
            .unwrap();
        if let Ok(p) = AckPacket::decode(&buf[..n]) {
            assert_eq!(p.chunk_id, 1);
            got_ack = true;
        } else {
            let p = DataPacket::decode(&buf[..n]).unwrap();
            assert_eq!(p.chunk_id, 1);
            got_data = true;
        }
    }
    assert!(got_data && got_ack);
}
