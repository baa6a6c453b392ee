//! The per-connection agent: couples a [`Connection`] to a codec and
//! exposes the small, dyn-safe surface ([`AgentRef`]) that message
//! handlers receive, plus richer typed helpers for the code that owns
//! the concrete `Agent<T, C>`.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::codec::{Frame, MessageCodec, WireMessage};
use crate::connection::{Connection, Transport};
use crate::errors::Result;

/// Which listener produced this agent. Mirrors the transport kind so
/// handlers that care (rare) can branch on it without downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    Tcp,
    Udp,
    Ws,
}

/// The capability surface handed to message handlers. Deliberately
/// excludes only what Rust's object-safety rules actually force out —
/// the codec's generic `register::<M>`/`send_message::<M>`, which
/// reference a type parameter with no stand-in on a trait object.
/// Everything else an `Agent<T, C>` can do (query or close the
/// connection, read its addresses) is non-generic and stays here, so a
/// handler never needs the concrete `Agent<T, C>` just to close or
/// inspect the connection it was called on.
pub trait AgentRef: Send + Sync {
    fn connection_id(&self) -> u64;
    fn send_raw_message(&self, id: u16, payload: &[u8]) -> bool;
    fn is_closed(&self) -> bool;
    fn close(&self);
    fn destroy(&self);
    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// A live connection paired with the codec that speaks its wire
/// format. One `Agent` is created per accepted/dialed transport and
/// lives until `on_close` fires.
pub struct Agent<T: Transport, C: MessageCodec> {
    connection: Arc<Connection<T>>,
    codec: Arc<C>,
    kind: AgentKind,
    connection_id: AtomicU64,
    user_data: RwLock<Option<Box<dyn Any + Send + Sync>>>,
    last_active: AtomicI64,
    epoch: Instant,
}

impl<T: Transport, C: MessageCodec> Agent<T, C> {
    pub fn new(connection: Arc<Connection<T>>, codec: Arc<C>, kind: AgentKind) -> Self {
        Self {
            connection,
            codec,
            kind,
            connection_id: AtomicU64::new(0),
            user_data: RwLock::new(None),
            last_active: AtomicI64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn connection(&self) -> &Arc<Connection<T>> {
        &self.connection
    }

    /// Assigned once by the owning pool when an agent is drawn from it.
    pub fn set_connection_id(&self, id: u64) {
        self.connection_id.store(id, Ordering::Release);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connection.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.connection.remote_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn close(&self) {
        self.connection.close();
    }

    pub fn destroy(&self) {
        self.connection.destroy();
    }

    /// Marshals and queues a registered message type.
    pub fn send_message<M: WireMessage>(&self, msg: &M) -> Result<bool> {
        let fragments = self.codec.marshal(msg)?;
        Ok(self.connection.queue_write(fragments))
    }

    pub fn set_user_data<D: Any + Send + Sync>(&self, data: D) {
        *self.user_data.write() = Some(Box::new(data));
    }

    pub fn with_user_data<R>(&self, f: impl FnOnce(Option<&(dyn Any + Send + Sync)>) -> R) -> R {
        let guard = self.user_data.read();
        f(guard.as_deref())
    }

    /// Resets the idle timer; called once per inbound message so the
    /// reaper (see `pool::reaper`) can find truly idle agents.
    pub fn touch(&self) {
        self.last_active.store(self.epoch.elapsed().as_secs() as i64, Ordering::Release);
    }

    pub fn idle_for(&self) -> std::time::Duration {
        let last = self.last_active.load(Ordering::Acquire);
        let now = self.epoch.elapsed().as_secs() as i64;
        std::time::Duration::from_secs((now - last).max(0) as u64)
    }

    /// Decodes and routes one inbound frame through the codec.
    pub fn handle_frame(self: &Arc<Self>, data: &[u8], user_data: &(dyn Any + Send + Sync)) -> Result<()>
    where
        Self: AgentRef,
    {
        self.touch();
        let frame: Frame = self.codec.unmarshal(data)?;
        self.codec.route(self.as_ref(), frame, user_data)
    }

    /// Routes an already-decoded frame. Used by the dispatch loop,
    /// which decodes in the connection's read task but serializes the
    /// handler invocation itself onto one task.
    pub fn route_frame(self: &Arc<Self>, frame: Frame, user_data: &(dyn Any + Send + Sync)) -> Result<()>
    where
        Self: AgentRef,
    {
        self.codec.route(self.as_ref(), frame, user_data)
    }
}

impl<T: Transport, C: MessageCodec> AgentRef for Agent<T, C> {
    fn connection_id(&self) -> u64 {
        self.connection_id.load(Ordering::Acquire)
    }

    fn send_raw_message(&self, id: u16, payload: &[u8]) -> bool {
        let byte_order = self.codec.byte_order();
        let id_bytes = match byte_order {
            crate::codec::ByteOrder::LittleEndian => id.to_le_bytes(),
            crate::codec::ByteOrder::BigEndian => id.to_be_bytes(),
        };
        let fragments = vec![
            bytes::Bytes::copy_from_slice(&id_bytes),
            bytes::Bytes::copy_from_slice(payload),
        ];
        self.connection.queue_write(fragments)
    }

    fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    fn close(&self) {
        self.connection.close();
    }

    fn destroy(&self) {
        self.connection.destroy();
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.connection.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.connection.remote_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::binary::BinaryCodec;
    use crate::codec::ByteOrder;
    use crate::connection::FrameReader;
    use crate::connection::FrameWriter;
    use async_trait::async_trait;

    struct NoopReader;
    #[async_trait]
    impl FrameReader for NoopReader {
        async fn read_frame(&mut self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }
    struct NoopWriter;
    #[async_trait]
    impl FrameWriter for NoopWriter {
        async fn write_frame(&mut self, _fragments: &[bytes::Bytes]) -> Result<()> {
            Ok(())
        }
        async fn shutdown(&mut self) {}
    }
    struct NoopTransport;
    impl Transport for NoopTransport {
        type Reader = NoopReader;
        type Writer = NoopWriter;
        fn split(self) -> (Self::Reader, Self::Writer) {
            (NoopReader, NoopWriter)
        }
        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    #[tokio::test]
    async fn touch_resets_idle_duration() {
        let conn = Arc::new(Connection::new(NoopTransport, 4));
        let codec = Arc::new(BinaryCodec::new(ByteOrder::BigEndian));
        codec.freeze();
        let agent = Agent::new(conn, codec, AgentKind::Tcp);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        agent.touch();
        assert_eq!(agent.idle_for().as_secs(), 0);
    }

    #[tokio::test]
    async fn connection_id_round_trips() {
        let conn = Arc::new(Connection::new(NoopTransport, 4));
        let codec = Arc::new(BinaryCodec::new(ByteOrder::BigEndian));
        codec.freeze();
        let agent = Agent::new(conn, codec, AgentKind::Tcp);
        agent.set_connection_id(42);
        assert_eq!(AgentRef::connection_id(&agent), 42);
    }
}
