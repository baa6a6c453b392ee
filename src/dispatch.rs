//! The serialized dispatch loop: a single task drains a bounded event
//! channel and invokes message handlers one at a time, interleaved with
//! a fixed-tick `on_loop` callback and a periodic reaper sweep.
//!
//! Framing and decode happen concurrently, off this task, in each
//! connection's own read loop — only the handler invocation itself is
//! serialized here, matching `routine_safe = true` in the config. A
//! server built with `routine_safe = false` skips this loop entirely
//! and calls `Agent::route_frame` directly from the read task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::interval;
use tracing::debug;

use crate::agent::Agent;
use crate::codec::{Frame, MessageCodec};
use crate::connection::Transport;

/// Tunables for the dispatch loop. Defaults match the 1024-capacity
/// event channel, 30ms loop tick, and 10s reaper sweep this was
/// modeled on; all three are configurable here instead of compiled in.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub channel_capacity: usize,
    pub loop_tick: Duration,
    pub reaper_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            loop_tick: Duration::from_millis(30),
            reaper_interval: Duration::from_secs(10),
        }
    }
}

/// One decoded inbound message, queued for serialized routing.
pub struct DispatchEvent<T: Transport, C: MessageCodec> {
    pub agent: Arc<Agent<T, C>>,
    pub frame: Frame,
    pub user_data: Arc<dyn std::any::Any + Send + Sync>,
}

/// A handle for pushing events into a running dispatch loop and asking
/// it to stop.
pub struct Dispatcher<T: Transport, C: MessageCodec> {
    tx: mpsc::Sender<DispatchEvent<T, C>>,
    shutdown: Arc<Notify>,
}

impl<T: Transport, C: MessageCodec> Clone for Dispatcher<T, C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T: Transport, C: MessageCodec> Dispatcher<T, C> {
    /// Spawns the dispatch loop. `on_loop` runs once per tick;
    /// `on_reap` runs once per reaper interval (typically sweeping one
    /// or more agent pools for idle connections).
    pub fn spawn<F, R>(config: DispatchConfig, on_loop: F, on_reap: R) -> Self
    where
        F: Fn() + Send + 'static,
        R: Fn() + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<DispatchEvent<T, C>>(config.channel_capacity.max(1));
        let shutdown = Arc::new(Notify::new());
        let shutdown_for_task = shutdown.clone();

        tokio::spawn(async move {
            let mut loop_tick = interval(config.loop_tick);
            let mut reaper_tick = interval(config.reaper_interval);
            // The first tick of `interval` fires immediately; skip it so
            // `on_loop`/`on_reap` don't run before the server has started.
            loop_tick.tick().await;
            reaper_tick.tick().await;

            loop {
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Some(event) => {
                                if let Err(err) = event.agent.route_frame(event.frame, event.user_data.as_ref()) {
                                    debug!(error = %err, "route message error");
                                }
                            }
                            None => break,
                        }
                    }
                    _ = loop_tick.tick() => {
                        on_loop();
                    }
                    _ = reaper_tick.tick() => {
                        on_reap();
                    }
                    _ = shutdown_for_task.notified() => {
                        break;
                    }
                }
            }
        });

        Self { tx, shutdown }
    }

    /// Queues a decoded message for routing. Blocks the calling
    /// connection's read loop while the channel is full — deliberately,
    /// so a slow dispatch loop applies backpressure to readers instead
    /// of silently dropping messages. Returns `false` only once the
    /// dispatch loop itself has shut down.
    pub async fn push(&self, event: DispatchEvent<T, C>) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Runs `fut`, logging (rather than panicking the process) if it
/// returns an error — used by callers that spawn fire-and-forget tasks
/// off the dispatch loop, e.g. a connection's read loop.
pub async fn log_errors<E: std::fmt::Display>(fut: impl Future<Output = Result<(), E>>) {
    if let Err(err) = fut.await {
        debug!(error = %err, "background task ended with an error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentKind};
    use crate::codec::raw::RawCodec;
    use crate::codec::ByteOrder;
    use crate::connection::{Connection, FrameReader, FrameWriter, Transport};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;

    struct NoopReader;
    #[async_trait]
    impl FrameReader for NoopReader {
        async fn read_frame(&mut self) -> Result<Vec<u8>, crate::errors::NetworkError> {
            std::future::pending().await
        }
    }
    struct NoopWriter;
    #[async_trait]
    impl FrameWriter for NoopWriter {
        async fn write_frame(&mut self, _fragments: &[bytes::Bytes]) -> Result<(), crate::errors::NetworkError> {
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

    /// Pushes five events back to back, faster than the single dispatch
    /// task could possibly drain them one at a time, then checks they
    /// were routed in push order — the loop only has one consumer task,
    /// so there's no way for a later id to route ahead of an earlier one.
    #[tokio::test]
    async fn events_route_one_at_a_time_in_push_order() {
        let order: Arc<StdMutex<Vec<u16>>> = Arc::new(StdMutex::new(Vec::new()));
        let codec = Arc::new(RawCodec::new(ByteOrder::BigEndian));
        for id in 0..5u16 {
            let order = order.clone();
            codec
                .set_raw_handler(
                    id,
                    Arc::new(move |_agent, id, _payload, _user| {
                        order.lock().unwrap().push(id);
                    }),
                )
                .unwrap();
        }
        codec.freeze();

        let conn = Arc::new(Connection::new(NoopTransport, 4));
        let agent = Arc::new(Agent::new(conn, codec, AgentKind::Tcp));

        let dispatcher: Dispatcher<NoopTransport, RawCodec> = Dispatcher::spawn(
            DispatchConfig {
                channel_capacity: 8,
                loop_tick: Duration::from_secs(3600),
                reaper_interval: Duration::from_secs(3600),
            },
            || {},
            || {},
        );

        for id in 0..5u16 {
            let event = DispatchEvent {
                agent: agent.clone(),
                frame: Frame::Raw {
                    id,
                    payload: bytes::Bytes::new(),
                },
                user_data: Arc::new(()),
            };
            assert!(dispatcher.push(event).await);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        dispatcher.shutdown();
    }

    #[tokio::test]
    async fn on_loop_fires_once_per_tick() {
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticks_clone = ticks.clone();
        let _dispatcher: Dispatcher<NoopTransport, RawCodec> = Dispatcher::spawn(
            DispatchConfig {
                channel_capacity: 8,
                loop_tick: Duration::from_millis(10),
                reaper_interval: Duration::from_secs(3600),
            },
            move || {
                ticks_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            },
            || {},
        );

        tokio::time::sleep(Duration::from_millis(55)).await;
        let count = ticks.load(std::sync::atomic::Ordering::SeqCst);
        assert!((3..=8).contains(&count), "expected a handful of ticks, got {count}");
    }
}
