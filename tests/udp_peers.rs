use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use nexus_net::codec::raw::RawCodec;
use nexus_net::codec::ByteOrder;
use nexus_net::config::UdpConfig;
use nexus_net::dispatch::DispatchConfig;
use nexus_net::server::NetServerBuilder;

const PING_ID: u16 = 1;
const PONG_ID: u16 = 2;

fn framed(id: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + payload.len());
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[tokio::test]
async fn udp_server_tracks_one_agent_per_peer() {
    let codec = Arc::new(RawCodec::new(ByteOrder::BigEndian));
    codec
        .set_raw_handler(
            PING_ID,
            Arc::new(|agent, _id, payload, _user_data| {
                agent.send_raw_message(PONG_ID, payload);
            }),
        )
        .unwrap();

    let connects = Arc::new(AtomicU32::new(0));
    let connects_clone = connects.clone();
    let server = NetServerBuilder::new(codec)
        .on_connect(move |_agent| {
            connects_clone.fetch_add(1, Ordering::SeqCst);
        })
        .build();

    let mut config = UdpConfig::default();
    config.addr = "127.0.0.1:17991".to_string();

    let handle = server
        .start_udp(config.clone(), DispatchConfig::default())
        .await
        .expect("udp server binds");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let client_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client_a.connect(&config.addr).await.unwrap();
    let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client_b.connect(&config.addr).await.unwrap();

    client_a.send(&framed(PING_ID, b"from-a")).await.unwrap();
    client_b.send(&framed(PING_ID, b"from-b")).await.unwrap();

    let mut buf = [0u8; 64];
    let len = tokio::time::timeout(Duration::from_millis(200), client_a.recv(&mut buf))
        .await
        .expect("reply within timeout")
        .unwrap();
    assert_eq!(&buf[..2], &PONG_ID.to_be_bytes());
    assert_eq!(&buf[2..len], b"from-a");

    let len = tokio::time::timeout(Duration::from_millis(200), client_b.recv(&mut buf))
        .await
        .expect("reply within timeout")
        .unwrap();
    assert_eq!(&buf[2..len], b"from-b");

    tokio::time::sleep(Duration::from_millis(20)).await;
    // Each distinct peer address gets its own agent and its own
    // on_connect firing exactly once.
    assert_eq!(connects.load(Ordering::SeqCst), 2);

    // A second datagram from the same peer reuses the existing agent:
    // no further on_connect fires.
    client_a.send(&framed(PING_ID, b"again")).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_millis(200), client_a.recv(&mut buf))
        .await
        .expect("second reply within timeout")
        .unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 2);

    handle.shutdown().await;
}
