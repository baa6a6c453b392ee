//! Transport-agnostic connection wrapper: a bounded write queue drained
//! by a dedicated writer task, plus an atomic closed flag. One
//! `Connection<T>` is created per accepted/dialed transport and handed
//! to an [`crate::agent::Agent`].

pub mod tcp;
pub mod udp;
pub mod ws;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::Result;

/// The read half of a split [`Transport`]. Owned exclusively by the
/// task driving an agent's receive loop.
#[async_trait]
pub trait FrameReader: Send + 'static {
    async fn read_frame(&mut self) -> Result<Vec<u8>>;
}

/// The write half of a split [`Transport`]. Owned exclusively by the
/// writer task spawned in [`Connection::new`].
#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn write_frame(&mut self, fragments: &[Bytes]) -> Result<()>;

    /// Best-effort shutdown of the underlying transport. Called once
    /// when the write queue drains after `close()`, or immediately on
    /// `destroy()`.
    async fn shutdown(&mut self);
}

/// A connectable, framed network transport that can be split into an
/// independent read half and write half.
pub trait Transport: Send + 'static {
    type Reader: FrameReader;
    type Writer: FrameWriter;

    fn split(self) -> (Self::Reader, Self::Writer);
    fn local_addr(&self) -> Option<SocketAddr>;
    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// A sentinel sent down the write queue to ask the writer task to shut
/// the transport down once every already-queued write has flushed —
/// the same "send nil, range-loop breaks on it" idiom as the source
/// this is modeled on, expressed as `Option::None` instead of a nil
/// byte slice.
type WriteItem = Option<Vec<Bytes>>;

pub struct Connection<T: Transport> {
    tx: Mutex<Option<mpsc::Sender<WriteItem>>>,
    reader: Mutex<Option<T::Reader>>,
    closed: Arc<AtomicBool>,
    closed_signal: CancellationToken,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl<T: Transport> Connection<T> {
    /// Splits `transport`, spawns the writer task with a queue of
    /// `pending_write_num` slots, and returns the connection plus its
    /// still-unclaimed read half bundled inside.
    pub fn new(transport: T, pending_write_num: usize) -> Self {
        let local_addr = transport.local_addr();
        let remote_addr = transport.remote_addr();
        let (reader, mut writer) = transport.split();
        let (tx, mut rx) = mpsc::channel::<WriteItem>(pending_write_num.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let closed_for_task = closed.clone();

        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Some(fragments) => {
                        if let Err(err) = writer.write_frame(&fragments).await {
                            debug!(error = %err, "write error, closing connection");
                            break;
                        }
                    }
                    None => break,
                }
            }
            closed_for_task.store(true, Ordering::Release);
            writer.shutdown().await;
        });

        Self {
            tx: Mutex::new(Some(tx)),
            reader: Mutex::new(Some(reader)),
            closed,
            closed_signal: CancellationToken::new(),
            local_addr,
            remote_addr,
        }
    }

    /// Takes ownership of the read half. Returns `None` if already
    /// taken — a connection's receive loop runs on exactly one task.
    pub fn take_reader(&self) -> Option<T::Reader> {
        self.reader.lock().take()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A token cancelled the moment `close()` or `destroy()` runs.
    /// Select on `.cancelled()` alongside `read_frame()` in a receive
    /// loop so a peer that never sends anything and never closes its
    /// own side still unblocks promptly once someone else — the idle
    /// reaper, an external `shutdown()` — closes this connection.
    pub fn closed_signal(&self) -> CancellationToken {
        self.closed_signal.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Queues a message for the writer task. Returns `false` (and, on
    /// a full queue, forcibly destroys the connection) if the message
    /// could not be queued — the caller must treat the message as
    /// dropped, never retried.
    pub fn queue_write(&self, fragments: Vec<Bytes>) -> bool {
        if self.is_closed() {
            return false;
        }
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else { return false };
        match tx.try_send(Some(fragments)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("write queue full, destroying connection");
                drop(guard);
                self.destroy();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Graceful close: lets already-queued writes flush, then shuts the
    /// transport down. Idempotent. Cancels `closed_signal` immediately
    /// so a blocked receive loop unblocks right away — only the write
    /// side waits for the queue to drain.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        let guard = self.tx.lock();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.try_send(None);
        }
        self.closed_signal.cancel();
    }

    /// Immediate close: drops the write queue right away, so the writer
    /// task's `shutdown()` runs without draining pending writes, and
    /// cancels `closed_signal` so a blocked receive loop unblocks too.
    pub fn destroy(&self) {
        self.closed.store(true, Ordering::Release);
        self.tx.lock().take();
        self.closed_signal.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct MockReader;
    #[async_trait]
    impl FrameReader for MockReader {
        async fn read_frame(&mut self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    struct MockWriter {
        writes: Arc<AtomicUsize>,
    }
    #[async_trait]
    impl FrameWriter for MockWriter {
        async fn write_frame(&mut self, _fragments: &[Bytes]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn shutdown(&mut self) {}
    }

    struct MockTransport {
        writes: Arc<AtomicUsize>,
    }
    impl Transport for MockTransport {
        type Reader = MockReader;
        type Writer = MockWriter;
        fn split(self) -> (Self::Reader, Self::Writer) {
            (MockReader, MockWriter { writes: self.writes })
        }
        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    #[tokio::test]
    async fn queued_writes_reach_the_writer_task() {
        let writes = Arc::new(AtomicUsize::new(0));
        let conn = Connection::new(MockTransport { writes: writes.clone() }, 8);
        assert!(conn.queue_write(vec![Bytes::from_static(b"a")]));
        assert!(conn.queue_write(vec![Bytes::from_static(b"b")]));
        // Give the spawned writer task a chance to run.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(writes.load(Ordering::SeqCst), 2);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn destroy_marks_closed_and_rejects_further_writes() {
        let writes = Arc::new(AtomicUsize::new(0));
        let conn = Connection::new(MockTransport { writes }, 8);
        conn.destroy();
        assert!(conn.is_closed());
        assert!(!conn.queue_write(vec![Bytes::from_static(b"late")]));
    }
}
