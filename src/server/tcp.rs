//! TCP server accept loop and client dial loop(s).
//!
//! The accept loop backs off exponentially (5ms doubling to a 1s cap)
//! on transient `accept()` errors, exactly as the source this was
//! modeled on. `max_conn_num` is wired straight through from config —
//! the source's copy-paste bug where `MaxConnNum` silently took
//! `MinMsgLen`'s value is not reproduced.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentKind, AgentRef};
use crate::codec::MessageCodec;
use crate::config::TcpConfig;
use crate::connection::tcp::TcpTransport;
use crate::connection::{Connection, FrameReader};
use crate::dispatch::{DispatchConfig, DispatchEvent, Dispatcher};
use crate::framing::{LenFieldWidth, TcpFraming};
use crate::pool::{self, Pool};

use super::{destroy_all_agents, Handlers, ServerHandle};

fn framing_for(config: &TcpConfig) -> TcpFraming {
    let width = match config.len_msg_len {
        1 => LenFieldWidth::One,
        4 => LenFieldWidth::Four,
        _ => LenFieldWidth::Two,
    };
    let byte_order = if config.little_endian {
        crate::codec::ByteOrder::LittleEndian
    } else {
        crate::codec::ByteOrder::BigEndian
    };
    TcpFraming::new(width, config.min_msg_len, config.max_msg_len, byte_order)
}

pub(crate) async fn start<C: MessageCodec + 'static>(
    config: TcpConfig,
    dispatch_config: DispatchConfig,
    codec: Arc<C>,
    handlers: Handlers,
) -> crate::errors::Result<ServerHandle> {
    let listener = TcpListener::bind(&config.addr).await?;
    info!(addr = %config.addr, "tcp server listening");

    let token = CancellationToken::new();
    let pool: Arc<Pool<Option<Arc<Agent<TcpTransport, C>>>>> = Arc::new(Pool::new());

    let reaper_pool = pool.clone();
    let timeout = config.timeout();
    let loop_handlers = handlers.clone();
    let reap_handlers = handlers.clone();
    let dispatcher: Dispatcher<TcpTransport, C> = Dispatcher::spawn(
        dispatch_config,
        move || loop_handlers.fire_loop(),
        move || {
            pool::reap_idle(
                &reaper_pool,
                timeout,
                |slot| slot.as_ref().map(|a| a.idle_for()).unwrap_or_default(),
                |slot| {
                    if let Some(agent) = slot {
                        if !agent.is_closed() {
                            agent.close();
                            reap_handlers.fire_close(agent.as_ref());
                        }
                    }
                },
            );
        },
    );

    let conn_tasks: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let destroy_all = destroy_all_agents(pool.clone());

    let accept_task = tokio::spawn(run_accept_loop(
        listener,
        config,
        codec,
        handlers,
        dispatcher,
        pool,
        token.clone(),
        conn_tasks.clone(),
    ));

    Ok(ServerHandle::new(token, vec![accept_task], None, conn_tasks, destroy_all))
}

#[allow(clippy::too_many_arguments)]
async fn run_accept_loop<C: MessageCodec + 'static>(
    listener: TcpListener,
    config: TcpConfig,
    codec: Arc<C>,
    handlers: Handlers,
    dispatcher: Dispatcher<TcpTransport, C>,
    pool: Arc<Pool<Option<Arc<Agent<TcpTransport, C>>>>>,
    token: CancellationToken,
    conn_tasks: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
) {
    let framing = framing_for(&config);
    let mut backoff = Duration::ZERO;

    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            result = listener.accept() => result,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => {
                backoff = Duration::ZERO;
                pair
            }
            Err(err) => {
                backoff = if backoff.is_zero() {
                    Duration::from_millis(5)
                } else {
                    (backoff * 2).min(Duration::from_secs(1))
                };
                warn!(error = %err, delay = ?backoff, "accept error, retrying");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        if pool.used_count() >= config.max_conn_num {
            debug!(%peer, "too many connections, dropping");
            drop(stream);
            continue;
        }

        pool.reserve(|| None);
        let handle = pool.get();

        let task = spawn_agent(
            stream,
            peer,
            handle,
            &framing,
            config.pending_write_num,
            config.routine_safe,
            codec.clone(),
            handlers.clone(),
            dispatcher.clone(),
            pool.clone(),
        );
        conn_tasks.lock().push(task);
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_agent<C: MessageCodec + 'static>(
    stream: TcpStream,
    _peer: SocketAddr,
    handle: pool::Handle,
    framing: &TcpFraming,
    pending_write_num: usize,
    routine_safe: bool,
    codec: Arc<C>,
    handlers: Handlers,
    dispatcher: Dispatcher<TcpTransport, C>,
    pool: Arc<Pool<Option<Arc<Agent<TcpTransport, C>>>>>,
) -> JoinHandle<()> {
    let transport = TcpTransport::new(stream, framing.clone());
    let connection = Arc::new(Connection::new(transport, pending_write_num));
    let reader = connection.take_reader().expect("fresh connection owns its reader");
    let agent = Arc::new(Agent::new(connection, codec.clone(), AgentKind::Tcp));
    agent.set_connection_id(handle.raw());
    let closed_signal = agent.connection().closed_signal();
    pool.with_mut(handle, |slot| *slot = Some(agent.clone()));

    handlers.fire_connect(agent.as_ref());

    tokio::spawn(async move {
        let mut reader = reader;
        loop {
            let frame = tokio::select! {
                _ = closed_signal.cancelled() => break,
                frame = reader.read_frame() => frame,
            };
            match frame {
                Ok(data) => {
                    if routine_safe {
                        match codec.unmarshal(&data) {
                            Ok(frame) => {
                                let event = DispatchEvent {
                                    agent: agent.clone(),
                                    frame,
                                    user_data: Arc::new(()),
                                };
                                if !dispatcher.push(event).await {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, "decode error, closing agent");
                                break;
                            }
                        }
                    } else if let Err(err) = agent.handle_frame(&data, &()) {
                        warn!(error = %err, "route error, closing agent");
                        break;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "read error, closing agent");
                    break;
                }
            }
        }

        agent.destroy();
        handlers.fire_close(agent.as_ref());
        pool.with_mut(handle, |slot| *slot = None);
        pool.free(handle);
    })
}

use crate::codec::WireMessage;
use crate::errors::{NetworkError, Result};

/// A single auto-reconnecting TCP client connection, grounded on the
/// source's `TCPClient`: dial, run the agent until it errors out, then
/// (if `reconnect` is set) sleep `connect_interval` and dial again.
pub struct TcpClient<C: MessageCodec + 'static> {
    config: TcpConfig,
    codec: Arc<C>,
    handlers: Handlers,
    agent: tokio::sync::RwLock<Option<Arc<Agent<TcpTransport, C>>>>,
}

impl<C: MessageCodec + 'static> TcpClient<C> {
    pub fn new(config: TcpConfig, codec: Arc<C>, handlers: Handlers) -> Arc<Self> {
        Arc::new(Self {
            config,
            codec,
            handlers,
            agent: tokio::sync::RwLock::new(None),
        })
    }

    /// Runs the dial/reconnect loop until `token` is cancelled. Awaits
    /// forever (modulo reconnects) unless `reconnect` is false, in
    /// which case it returns after the first connection drops.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let framing = framing_for(&self.config);
        loop {
            let stream = tokio::select! {
                _ = token.cancelled() => return,
                stream = dial_with_retry(&self.config.addr, self.config.connect_interval(), &token) => {
                    match stream {
                        Some(s) => s,
                        None => return,
                    }
                }
            };

            let transport = TcpTransport::new(stream, framing.clone());
            let connection = Arc::new(Connection::new(transport, self.config.pending_write_num));
            let mut reader = connection.take_reader().expect("fresh connection owns its reader");
            let agent = Arc::new(Agent::new(connection, self.codec.clone(), AgentKind::Tcp));
            let closed_signal = agent.connection().closed_signal();
            *self.agent.write().await = Some(agent.clone());

            self.handlers.fire_connect(agent.as_ref());

            loop {
                let frame = tokio::select! {
                    _ = closed_signal.cancelled() => break,
                    frame = reader.read_frame() => frame,
                };
                match frame {
                    Ok(data) => {
                        if let Err(err) = agent.handle_frame(&data, &()) {
                            warn!(error = %err, "client route error");
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "client connection closed");
                        break;
                    }
                }
            }

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

/// A pool of `conn_num` independent auto-reconnecting connections to the
/// same address, grounded on the source's `TCPClients`: each slot dials
/// and reconnects on its own; `shutdown` cancels every slot and waits
/// for all of them to finish, mirroring `TCPClients.Close()`'s
/// `wg.Wait()`.
pub struct TcpClients<C: MessageCodec + 'static> {
    clients: Vec<Arc<TcpClient<C>>>,
    token: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<C: MessageCodec + 'static> TcpClients<C> {
    pub fn start(conn_num: usize, config: TcpConfig, codec: Arc<C>, handlers: Handlers) -> Arc<Self> {
        let token = CancellationToken::new();
        let conn_num = conn_num.max(1);
        let mut clients = Vec::with_capacity(conn_num);
        let mut tasks = Vec::with_capacity(conn_num);
        for _ in 0..conn_num {
            let client = TcpClient::new(config.clone(), codec.clone(), handlers.clone());
            tasks.push(tokio::spawn(client.clone().run(token.clone())));
            clients.push(client);
        }
        Arc::new(Self {
            clients,
            token,
            tasks: parking_lot::Mutex::new(tasks),
        })
    }

    pub fn clients(&self) -> &[Arc<TcpClient<C>>] {
        &self.clients
    }

    /// Cancels every slot's dial/reconnect loop and waits for all of
    /// them to return. Idempotent: a second call just awaits an
    /// already-empty task list.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn dial_with_retry(addr: &str, interval: Duration, token: &CancellationToken) -> Option<TcpStream> {
    loop {
        tokio::select! {
            _ = token.cancelled() => return None,
            result = TcpStream::connect(addr) => {
                match result {
                    Ok(stream) => return Some(stream),
                    Err(err) => {
                        warn!(%addr, error = %err, "connect error, retrying");
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }
    }
}
