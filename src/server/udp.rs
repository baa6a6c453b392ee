//! UDP server: one bound socket, a `TrackingKey`-keyed agent map behind
//! one `parking_lot::RwLock`. Idle and explicitly-closed peers are
//! swept off the map by the dispatch loop's periodic reaper tick (see
//! `dispatch::Dispatcher`), the same 10s cadence `mainproc.go`'s
//! `loopUdpAgentPool` used.
//!
//! The agents map uses a single `HashMap::entry` call to look up or
//! create a peer's agent. The source this was modeled on instead did a
//! plain map read, checked `ok`, and only then created+inserted under a
//! second, separate lock acquisition — a classic check-then-act race
//! where two datagrams arriving back-to-back for a brand new peer could
//! both see "not found" and both create an agent. `entry()` closes that
//! window: the lookup and the insert happen atomically under one
//! write-lock acquisition.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentKind};
use crate::codec::{MessageCodec, WireMessage};
use crate::config::UdpConfig;
use crate::connection::udp::UdpTransport;
use crate::connection::Connection;
use crate::dispatch::{DispatchConfig, DispatchEvent, Dispatcher};
use crate::errors::{NetworkError, Result};
use crate::framing::UdpFraming;

use super::{Handlers, ServerHandle};

/// Identifies a UDP peer for agent demultiplexing. IP + port is enough
/// for a bound socket; there is no separate "zone" id to track since
/// Rust's `SocketAddr` already encodes the scope id for IPv6 link-local
/// addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TrackingKey(SocketAddr);

type SharedAgent<C> = Arc<Agent<UdpTransport, C>>;
type AgentMap<C> = RwLock<HashMap<TrackingKey, SharedAgent<C>>>;

pub(crate) async fn start<C: MessageCodec + 'static>(
    config: UdpConfig,
    dispatch_config: DispatchConfig,
    codec: Arc<C>,
    handlers: Handlers,
) -> crate::errors::Result<ServerHandle> {
    let socket = Arc::new(UdpSocket::bind(&config.addr).await?);
    info!(addr = %config.addr, "udp server listening");

    let token = CancellationToken::new();
    let agents: Arc<AgentMap<C>> = Arc::new(RwLock::new(HashMap::new()));

    let loop_handlers = handlers.clone();
    let reap_agents = agents.clone();
    let reap_handlers = handlers.clone();
    let timeout = config.timeout();
    let dispatcher: Dispatcher<UdpTransport, C> = Dispatcher::spawn(
        dispatch_config,
        move || loop_handlers.fire_loop(),
        move || reap_idle_peers(&reap_agents, timeout, &reap_handlers),
    );

    let accept_task = tokio::spawn(run_recv_loop(socket, config, codec, handlers, dispatcher, agents.clone(), token.clone()));

    // UDP has no per-connection reader task to track: peers live in one
    // shared map and are destroyed in place, so `conn_tasks` stays empty.
    let conn_tasks: Arc<parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let destroy_agents = agents;
    let destroy_all: Box<dyn Fn() + Send + Sync> = Box::new(move || {
        for agent in destroy_agents.read().values() {
            agent.destroy();
        }
    });

    Ok(ServerHandle::new(token, vec![accept_task], None, conn_tasks, destroy_all))
}

fn reap_idle_peers<C: MessageCodec + 'static>(agents: &Arc<AgentMap<C>>, timeout: std::time::Duration, handlers: &Handlers) {
    let idle: Vec<TrackingKey> = agents
        .read()
        .iter()
        .filter(|(_, agent)| agent.is_closed() || (!timeout.is_zero() && agent.idle_for() > timeout))
        .map(|(key, _)| *key)
        .collect();
    if idle.is_empty() {
        return;
    }
    let mut map = agents.write();
    for key in idle {
        if let Some(agent) = map.remove(&key) {
            agent.destroy();
            handlers.fire_close(agent.as_ref());
        }
    }
}

async fn run_recv_loop<C: MessageCodec + 'static>(
    socket: Arc<UdpSocket>,
    config: UdpConfig,
    codec: Arc<C>,
    handlers: Handlers,
    dispatcher: Dispatcher<UdpTransport, C>,
    agents: Arc<AgentMap<C>>,
    token: CancellationToken,
) {
    let framing = UdpFraming::new(config.min_msg_len, config.max_msg_len);
    let mut buf = vec![0u8; framing.max_len()];

    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            result = socket.recv_from(&mut buf) => result,
        };

        let (len, peer) = match received {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "udp read error");
                break;
            }
        };

        if len == 0 || len < config.min_msg_len {
            continue;
        }

        let agent = get_or_create_agent(&agents, peer, &socket, &framing, &codec, &handlers, config.max_conn_num);
        let Some(agent) = agent else { continue };

        let data = buf[..len].to_vec();
        if config.routine_safe {
            match codec.unmarshal(&data) {
                Ok(frame) => {
                    let event = DispatchEvent {
                        agent,
                        frame,
                        user_data: Arc::new(()),
                    };
                    let _ = dispatcher.push(event).await;
                }
                Err(err) => debug!(error = %err, %peer, "udp decode error"),
            }
        } else if let Err(err) = agent.handle_frame(&data, &()) {
            debug!(error = %err, %peer, "udp route error");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn get_or_create_agent<C: MessageCodec + 'static>(
    agents: &Arc<AgentMap<C>>,
    peer: SocketAddr,
    socket: &Arc<UdpSocket>,
    framing: &UdpFraming,
    codec: &Arc<C>,
    handlers: &Handlers,
    max_conn_num: usize,
) -> Option<SharedAgent<C>> {
    let key = TrackingKey(peer);
    {
        let existing = agents.read();
        if let Some(agent) = existing.get(&key) {
            return Some(agent.clone());
        }
    }

    let mut map = agents.write();
    match map.entry(key) {
        std::collections::hash_map::Entry::Occupied(entry) => Some(entry.get().clone()),
        std::collections::hash_map::Entry::Vacant(entry) => {
            if map.len() >= max_conn_num {
                debug!(%peer, "udp too many connections, dropping");
                return None;
            }
            // The inbox channel exists for API symmetry with TCP/WS
            // transports but is never read from: the recv loop above is
            // the only reader of the shared socket and routes each
            // datagram to its agent directly, the same way the source's
            // accept loop calls `agent.Run(data)` without ever going
            // through the per-connection `ReadMsg`.
            let (_inbox_tx, inbox_rx) = tokio::sync::mpsc::channel(1);
            let transport = UdpTransport::new(socket.clone(), peer, *framing, inbox_rx);
            let connection = Arc::new(Connection::new(transport, 128));
            let agent = Arc::new(Agent::new(connection, codec.clone(), AgentKind::Udp));
            handlers.fire_connect(agent.as_ref());
            entry.insert(agent.clone());
            Some(agent)
        }
    }
}

/// A single dial/reconnect UDP client connection, grounded on the
/// source's `UDPClient`: a foreground read loop plus a side task that
/// closes the connection after `timeout` seconds of inactivity (the
/// same 10s watchdog cadence as `goRun`).
pub struct UdpClient<C: MessageCodec + 'static> {
    config: UdpConfig,
    codec: Arc<C>,
    handlers: Handlers,
    agent: tokio::sync::RwLock<Option<Arc<Agent<UdpTransport, C>>>>,
}

impl<C: MessageCodec + 'static> UdpClient<C> {
    pub fn new(config: UdpConfig, codec: Arc<C>, handlers: Handlers) -> Arc<Self> {
        Arc::new(Self {
            config,
            codec,
            handlers,
            agent: tokio::sync::RwLock::new(None),
        })
    }

    /// Runs the dial/reconnect loop until `token` is cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let framing = UdpFraming::new(self.config.min_msg_len, self.config.max_msg_len);
        loop {
            let socket = tokio::select! {
                _ = token.cancelled() => return,
                socket = dial_with_retry(&self.config.addr, self.config.connect_interval(), &token) => {
                    match socket {
                        Some(s) => s,
                        None => return,
                    }
                }
            };
            let socket = Arc::new(socket);
            let peer = match socket.peer_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    warn!(error = %err, "udp client has no peer address after connect");
                    continue;
                }
            };

            // The inbox channel exists for API symmetry with the other
            // transports but is never fed: the read loop below reads the
            // connected socket directly and routes each datagram inline.
            let (_inbox_tx, inbox_rx) = tokio::sync::mpsc::channel(1);
            let transport = UdpTransport::new(socket.clone(), peer, framing, inbox_rx);
            let connection = Arc::new(Connection::new(transport, 128));
            let agent = Arc::new(Agent::new(connection, self.codec.clone(), AgentKind::Udp));
            let closed_signal = agent.connection().closed_signal();
            *self.agent.write().await = Some(agent.clone());
            self.handlers.fire_connect(agent.as_ref());

            let watchdog = spawn_idle_watchdog(agent.clone(), self.config.timeout(), token.clone());

            let mut buf = vec![0u8; framing.max_len()];
            loop {
                let received = tokio::select! {
                    _ = token.cancelled() => break,
                    _ = closed_signal.cancelled() => break,
                    result = socket.recv(&mut buf) => result,
                };
                match received {
                    Ok(len) if len >= self.config.min_msg_len => {
                        if let Err(err) = agent.handle_frame(&buf[..len], &()) {
                            warn!(error = %err, "udp client route error");
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        debug!(error = %err, "udp client read error");
                        break;
                    }
                }
            }

            watchdog.abort();
            agent.destroy();
            self.handlers.fire_close(agent.as_ref());
            *self.agent.write().await = None;

            if !self.config.reconnect || token.is_cancelled() {
                return;
            }
            tokio::time::sleep(self.config.connect_interval()).await;
        }
    }

    /// Sends a registered message on the current connection, if any.
    pub async fn send<M: WireMessage>(&self, msg: &M) -> Result<bool> {
        match self.agent.read().await.as_ref() {
            Some(agent) => agent.send_message(msg),
            None => Err(NetworkError::ConnectionClosed),
        }
    }
}

fn spawn_idle_watchdog<C: MessageCodec + 'static>(
    agent: Arc<Agent<UdpTransport, C>>,
    timeout: Duration,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if timeout.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if agent.idle_for() > timeout {
                        agent.destroy();
                        return;
                    }
                }
            }
        }
    })
}

async fn dial_with_retry(addr: &str, interval: Duration, token: &CancellationToken) -> Option<UdpSocket> {
    loop {
        tokio::select! {
            _ = token.cancelled() => return None,
            result = connect(addr) => {
                match result {
                    Ok(socket) => return Some(socket),
                    Err(err) => {
                        warn!(%addr, error = %err, "udp connect error, retrying");
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }
    }
}

async fn connect(addr: &str) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;
    Ok(socket)
}
