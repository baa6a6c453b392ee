//! UDP transport: one [`UdpTransport`] per peer, sharing the server's
//! single bound socket. Inbound datagrams are demultiplexed by the
//! server's accept loop (see `server::udp`) keyed on a `TrackingKey`
//! and pushed into this transport's inbox; there is no per-peer socket
//! to read from directly, since UDP has none.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use super::{FrameReader, FrameWriter, Transport};
use crate::errors::{NetworkError, Result};
use crate::framing::UdpFraming;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    framing: UdpFraming,
    inbox: mpsc::Receiver<Vec<u8>>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, framing: UdpFraming, inbox: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            socket,
            peer,
            framing,
            inbox,
        }
    }
}

impl Transport for UdpTransport {
    type Reader = UdpReader;
    type Writer = UdpWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (
            UdpReader { inbox: self.inbox },
            UdpWriter {
                socket: self.socket,
                peer: self.peer,
                framing: self.framing,
            },
        )
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

pub struct UdpReader {
    inbox: mpsc::Receiver<Vec<u8>>,
}

#[async_trait]
impl FrameReader for UdpReader {
    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        self.inbox.recv().await.ok_or(NetworkError::ConnectionClosed)
    }
}

pub struct UdpWriter {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    framing: UdpFraming,
}

#[async_trait]
impl FrameWriter for UdpWriter {
    async fn write_frame(&mut self, fragments: &[Bytes]) -> Result<()> {
        let total_len: usize = fragments.iter().map(|f| f.len()).sum();
        let mut payload = Vec::with_capacity(total_len);
        for fragment in fragments {
            payload.extend_from_slice(fragment);
        }
        self.framing.check(&payload)?;
        self.socket.send_to(&payload, self.peer).await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        // No per-peer socket to close; the server owns the shared
        // listening socket's lifetime.
    }
}
