//! TCP transport: length-prefixed framing over a [`tokio::net::TcpStream`].
//!
//! `SO_LINGER(0)` is applied once, at accept/dial time, only here —
//! never by downcasting a generic connection handle the way the source
//! this was modeled on did (see the design notes on the reset-on-close
//! bug). A connection that was never a raw TCP socket (e.g. a TLS
//! stream layered on top) simply never goes through this constructor,
//! so there is nothing to downcast.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::warn;

use super::{FrameReader, FrameWriter, Transport};
use crate::errors::Result;
use crate::framing::TcpFraming;

pub struct TcpTransport {
    stream: TcpStream,
    framing: TcpFraming,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, framing: TcpFraming) -> Self {
        if let Err(err) = stream.set_linger(Some(Duration::from_secs(0))) {
            warn!(error = %err, "failed to set SO_LINGER(0) on accepted socket");
        }
        Self { stream, framing }
    }
}

impl Transport for TcpTransport {
    type Reader = TcpReader;
    type Writer = TcpWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (read, write) = self.stream.into_split();
        (
            TcpReader {
                read,
                framing: self.framing.clone(),
            },
            TcpWriter {
                write,
                framing: self.framing,
            },
        )
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.local_addr().ok()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

pub struct TcpReader {
    read: OwnedReadHalf,
    framing: TcpFraming,
}

#[async_trait]
impl FrameReader for TcpReader {
    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        self.framing.read(&mut self.read).await
    }
}

pub struct TcpWriter {
    write: OwnedWriteHalf,
    framing: TcpFraming,
}

#[async_trait]
impl FrameWriter for TcpWriter {
    async fn write_frame(&mut self, fragments: &[Bytes]) -> Result<()> {
        self.framing.write(&mut self.write, fragments).await
    }

    async fn shutdown(&mut self) {
        use tokio::io::AsyncWriteExt;
        let _ = self.write.shutdown().await;
    }
}
