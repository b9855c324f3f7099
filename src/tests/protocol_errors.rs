//! Abuse and malformed-stream scenarios.

use std::time::Duration;

use pretty_assertions::assert_eq;
use tq_protocol::{Packet, PacketType};

use super::{spawn_server, TestClient};

#[tokio::test]
async fn oversize_length_prefix_disconnects_before_payload() {
    let harness = spawn_server().await;
    let mut client = TestClient::connect(harness.addr).await.unwrap();

    // A declared length of 2000 in the first (dummy) frame slot.
    client
        .send_plaintext(&2000u16.to_le_bytes())
        .await
        .unwrap();
    client.expect_close(Duration::from_secs(3)).await.unwrap();
}

#[tokio::test]
async fn oversize_frame_after_handshake_disconnects() {
    let harness = spawn_server().await;
    let mut client = TestClient::connect(harness.addr).await.unwrap();
    client.handshake().await.unwrap();

    // An encrypted frame whose header declares 2000 bytes.
    let mut bogus = vec![0u8; 64];
    bogus[..2].copy_from_slice(&2000u16.to_le_bytes());
    client.send_encrypted(&bogus).await.unwrap();
    client.expect_close(Duration::from_secs(3)).await.unwrap();
}

#[tokio::test]
async fn flood_of_frames_disconnects() {
    let harness = spawn_server().await;
    let mut client = TestClient::connect(harness.addr).await.unwrap();
    client.handshake().await.unwrap();

    // Eleven well-formed 32-byte frames in one burst: inside the 100 ms
    // window, over the 10-packet budget.
    for _ in 0..11 {
        client
            .send_frame(PacketType::C_MSG_TALK, |p| p.write_bytes(&[0u8; 20]))
            .await
            .unwrap();
    }
    client.expect_close(Duration::from_secs(3)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.server.registry().count(), 0);
}

#[tokio::test]
async fn repeated_malformed_frames_exhaust_the_error_budget() {
    let harness = spawn_server().await;
    let mut client = TestClient::connect(harness.addr).await.unwrap();
    client.handshake().await.unwrap();

    // Valid framing, wrong trailing signature: dropped as non-fatal until
    // five in a row have accumulated.
    for _ in 0..5 {
        let mut packet = Packet::build(PacketType::C_MSG_TALK);
        packet.write_bytes(&[1, 2, 3, 4]).unwrap();
        let wire = packet.finalize_with(b"XXXXXXXX");
        client.send_encrypted(&wire).await.unwrap();
    }
    client.expect_close(Duration::from_secs(3)).await.unwrap();
}

#[tokio::test]
async fn garbage_key_exchange_response_disconnects() {
    let harness = spawn_server().await;
    let mut client = TestClient::connect(harness.addr).await.unwrap();

    // Dummy frame, then a response blob whose key record is junk rather
    // than hex.
    client
        .send_plaintext(&{
            let mut dummy = vec![0u8; 16];
            dummy[..2].copy_from_slice(&16u16.to_le_bytes());
            dummy
        })
        .await
        .unwrap();

    let mut blob = vec![0u8; 11];
    blob.extend_from_slice(&4i32.to_le_bytes());
    blob.extend_from_slice(&[0xAA; 4]);
    blob.extend_from_slice(&8i32.to_le_bytes());
    blob.extend_from_slice(b"ZZZZZZZZ");
    client.send_encrypted(&blob).await.unwrap();

    client.expect_close(Duration::from_secs(3)).await.unwrap();
}
