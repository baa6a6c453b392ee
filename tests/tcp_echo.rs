use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use nexus_net::codec::raw::RawCodec;
use nexus_net::codec::ByteOrder;
use nexus_net::config::TcpConfig;
use nexus_net::dispatch::DispatchConfig;
use nexus_net::server::NetServerBuilder;

const PING_ID: u16 = 1;
const PONG_ID: u16 = 2;

fn framed(id: u16, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + payload.len());
    body.extend_from_slice(&id.to_be_bytes());
    body.extend_from_slice(payload);
    let mut out = Vec::with_capacity(2 + body.len());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

#[tokio::test]
async fn tcp_server_echoes_ping_as_pong() {
    let codec = Arc::new(RawCodec::new(ByteOrder::BigEndian));
    codec
        .set_raw_handler(
            PING_ID,
            Arc::new(move |agent, _id, payload, _user_data| {
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

    let mut config = TcpConfig::default();
    config.addr = "127.0.0.1:17881".to_string();

    let handle = server
        .start_tcp(config.clone(), DispatchConfig::default())
        .await
        .expect("tcp server binds");

    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut stream = TcpStream::connect(&config.addr).await.expect("client connects");
    stream.write_all(&framed(PING_ID, b"hello")).await.unwrap();

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();

    assert_eq!(&body[..2], &PONG_ID.to_be_bytes());
    assert_eq!(&body[2..], b"hello");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    drop(stream);
    handle.shutdown().await;
}

#[tokio::test]
async fn tcp_server_closes_connections_over_the_frame_bound() {
    let codec = Arc::new(RawCodec::new(ByteOrder::BigEndian));
    codec.set_raw_handler(PING_ID, Arc::new(|_agent, _id, _payload, _user| {})).unwrap();
    let server = NetServerBuilder::new(codec).build();

    let mut config = TcpConfig::default();
    config.addr = "127.0.0.1:17882".to_string();
    config.max_msg_len = 8;

    let handle = server
        .start_tcp(config.clone(), DispatchConfig::default())
        .await
        .expect("tcp server binds");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut stream = TcpStream::connect(&config.addr).await.expect("client connects");
    stream.write_all(&framed(PING_ID, &vec![0u8; 64])).await.unwrap();

    let mut buf = [0u8; 1];
    let result = tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await;
    match result {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(_)) => panic!("server should not have written anything back"),
        Err(_) => panic!("server did not close the connection in time"),
    }

    handle.shutdown().await;
}
