//! WebSocket transport: binary frames over a `tokio-tungstenite`
//! stream. Framing is delegated entirely to the WebSocket protocol
//! itself — there is no extra length prefix, since each `Message::Binary`
//! already carries its own boundary.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{FrameReader, FrameWriter, Transport};
use crate::errors::{NetworkError, Result};
use crate::framing::UdpFraming as SizeBounds;

pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    bounds: SizeBounds,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        stream: WebSocketStream<S>,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        bounds: SizeBounds,
    ) -> Self {
        Self {
            stream,
            local_addr,
            remote_addr,
            bounds,
        }
    }
}

impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Reader = WsReader<S>;
    type Writer = WsWriter<S>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.stream.split();
        (
            WsReader {
                stream,
                bounds: self.bounds,
            },
            WsWriter { sink },
        )
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

pub struct WsReader<S> {
    stream: futures::stream::SplitStream<WebSocketStream<S>>,
    bounds: SizeBounds,
}

#[async_trait]
impl<S> FrameReader for WsReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        loop {
            let msg = self
                .stream
                .next()
                .await
                .ok_or(NetworkError::ConnectionClosed)?
                .map_err(|e| NetworkError::WebSocket(e.to_string()))?;
            match msg {
                Message::Binary(data) => {
                    self.bounds.check(&data)?;
                    return Ok(data);
                }
                Message::Close(_) => return Err(NetworkError::ConnectionClosed),
                // Ping/Pong/Text frames carry no application payload for
                // this transport; tungstenite answers pings internally.
                _ => continue,
            }
        }
    }
}

pub struct WsWriter<S> {
    sink: futures::stream::SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait]
impl<S> FrameWriter for WsWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn write_frame(&mut self, fragments: &[Bytes]) -> Result<()> {
        let total_len: usize = fragments.iter().map(|f| f.len()).sum();
        let mut payload = Vec::with_capacity(total_len);
        for fragment in fragments {
            payload.extend_from_slice(fragment);
        }
        self.sink
            .send(Message::Binary(payload))
            .await
            .map_err(|e| NetworkError::WebSocket(e.to_string()))
    }

    async fn shutdown(&mut self) {
        let _ = self.sink.close().await;
    }
}
