use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use nexus_net::codec::binary::BinaryCodec;
use nexus_net::codec::raw::RawCodec;
use nexus_net::codec::ByteOrder;
use nexus_net::server::{ClientKind, Handlers, NetClient};

/// A bare listener that accepts a connection and immediately drops the
/// socket — standing in for "a listener that drops the connection"
/// so the client's reconnect loop has to redial. The client's `run`
/// loop never writes on its own (it only reads, matching the source's
/// `TCPClient`), so the trigger here is connection loss, not a frame
/// count.
async fn flaky_listener(addr: &str, accepts: Arc<AtomicU32>, token: CancellationToken) {
    let listener = TcpListener::bind(addr).await.unwrap();
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => return,
            result = listener.accept() => result,
        };
        match accepted {
            Ok((stream, _)) => {
                accepts.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
            Err(_) => continue,
        }
    }
}

#[tokio::test]
async fn client_reconnects_after_the_listener_drops_it() {
    let addr = "127.0.0.1:17993";
    let accepts = Arc::new(AtomicU32::new(0));
    let listener_token = CancellationToken::new();
    let listener_task = tokio::spawn(flaky_listener(addr, accepts.clone(), listener_token.clone()));

    tokio::time::sleep(Duration::from_millis(20)).await;

    let codec = Arc::new(RawCodec::new(ByteOrder::BigEndian));
    let handle = NetClient::connect(addr, ClientKind::Tcp, codec, Handlers::default());

    // The default connect_interval is 3s; give the client enough time
    // for an initial connect, disconnect, and one redial cycle.
    tokio::time::sleep(Duration::from_millis(3800)).await;

    assert!(
        accepts.load(Ordering::SeqCst) >= 2,
        "expected at least two accepted connections (initial + reconnect), saw {}",
        accepts.load(Ordering::SeqCst)
    );

    listener_token.cancel();
    let _ = listener_task.await;
    handle.shutdown().await;
}

#[derive(Debug, Serialize, Deserialize)]
struct Probe {
    nonce: u32,
}

impl nexus_net::codec::WireMessage for Probe {
    fn type_name() -> &'static str {
        "Probe"
    }
}

#[tokio::test]
async fn client_send_fails_while_no_connection_is_up() {
    let codec = Arc::new(BinaryCodec::new(ByteOrder::BigEndian));
    codec.register::<Probe>().unwrap();
    // No listener is bound on this port, so the client never connects;
    // sending must surface an error rather than hang or panic.
    let handle = NetClient::connect("127.0.0.1:17994", ClientKind::Tcp, codec, Handlers::default());
    let result = handle.client.send(&Probe { nonce: 1 }).await;
    assert!(result.is_err());
    handle.shutdown().await;
}
