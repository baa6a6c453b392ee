//! WebSocket server: an HTTP-less accept loop over a raw `TcpListener`,
//! upgrading each connection straight to a WebSocket handshake via
//! `tokio-tungstenite`. The source this was modeled on ran a full
//! `net/http` server and upgraded inside a handler; skipping the HTTP
//! router is a deliberate simplification since this crate has no other
//! use for one.
//!
//! TLS (behind the `tls` feature) wraps the accepted `TcpStream` in a
//! `tokio_rustls::TlsAcceptor` before the WebSocket handshake, loading
//! `cert_file`/`key_file` once at startup exactly as the source's
//! `tls.LoadX509KeyPair` call.

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentKind};
use crate::codec::MessageCodec;
use crate::config::WsConfig;
use crate::connection::ws::WsTransport;
use crate::connection::{Connection, FrameReader};
use crate::framing::UdpFraming as SizeBounds;
use crate::pool::Pool;

use super::{destroy_all_agents, Handlers, ServerHandle};

pub(crate) async fn start<C: MessageCodec + 'static>(config: WsConfig, codec: Arc<C>, handlers: Handlers) -> crate::errors::Result<ServerHandle> {
    let listener = TcpListener::bind(&config.addr).await?;
    info!(addr = %config.addr, "websocket server listening");
    let token = CancellationToken::new();

    let use_tls = config.cert_file.is_some() || config.key_file.is_some();
    let conn_tasks: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let (task, destroy_all): (JoinHandle<()>, Box<dyn Fn() + Send + Sync>) = if use_tls {
        #[cfg(feature = "tls")]
        {
            let acceptor = Arc::new(build_tls_acceptor(&config).await?);
            let pool = Arc::new(Pool::new());
            let destroy_pool = pool.clone();
            let task = tokio::spawn(run_accept_loop(
                listener,
                move |stream| {
                    let acceptor = acceptor.clone();
                    async move { acceptor.accept(stream).await.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)) }
                },
                config,
                codec,
                handlers,
                pool,
                token.clone(),
                conn_tasks.clone(),
            ));
            (task, destroy_all_agents(destroy_pool))
        }
        #[cfg(not(feature = "tls"))]
        {
            return Err(crate::errors::NetworkError::InvalidConfig(
                "cert_file/key_file set but this build has the \"tls\" feature disabled".to_string(),
            ));
        }
    } else {
        let pool = Arc::new(Pool::new());
        let destroy_pool = pool.clone();
        let task = tokio::spawn(run_accept_loop(
            listener,
            |stream| async move { Ok(stream) },
            config,
            codec,
            handlers,
            pool,
            token.clone(),
            conn_tasks.clone(),
        ));
        (task, destroy_all_agents(destroy_pool))
    };

    Ok(ServerHandle::new(token, vec![task], None, conn_tasks, destroy_all))
}

#[cfg(feature = "tls")]
async fn build_tls_acceptor(config: &WsConfig) -> crate::errors::Result<tokio_rustls::TlsAcceptor> {
    use crate::errors::NetworkError;
    use rustls::{Certificate, NoClientAuth, PrivateKey, ServerConfig};

    let cert_path = config
        .cert_file
        .as_deref()
        .ok_or_else(|| NetworkError::InvalidConfig("cert_file is required when key_file is set".to_string()))?;
    let key_path = config
        .key_file
        .as_deref()
        .ok_or_else(|| NetworkError::InvalidConfig("key_file is required when cert_file is set".to_string()))?;

    let cert_bytes = tokio::fs::read(cert_path).await?;
    let key_bytes = tokio::fs::read(key_path).await?;

    let certs = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .map_err(|_| NetworkError::InvalidConfig(format!("could not parse certificate chain at {cert_path}")))?
        .into_iter()
        .map(Certificate)
        .collect::<Vec<_>>();

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_bytes.as_slice())
        .map_err(|_| NetworkError::InvalidConfig(format!("could not parse private key at {key_path}")))?;
    let key = PrivateKey(keys.pop().ok_or_else(|| NetworkError::InvalidConfig(format!("no private key found in {key_path}")))?);

    let mut server_config = ServerConfig::new(NoClientAuth::new());
    server_config.set_single_cert(certs, key).map_err(|e| NetworkError::InvalidConfig(e.to_string()))?;
    server_config.set_protocols(&[b"http/1.1".to_vec()]);

    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_config)))
}

#[allow(clippy::too_many_arguments)]
async fn run_accept_loop<C, S, F, Fut>(
    listener: TcpListener,
    wrap: F,
    config: WsConfig,
    codec: Arc<C>,
    handlers: Handlers,
    pool: Arc<Pool<Option<Arc<Agent<WsTransport<S>, C>>>>>,
    token: CancellationToken,
    conn_tasks: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
) where
    C: MessageCodec + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::io::Result<S>> + Send,
{
    let max_conn_num = 100usize.max(1);
    let bounds = SizeBounds::new(1, config.max_msg_len);
    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_msg_len),
        max_frame_size: Some(config.max_msg_len),
        ..WebSocketConfig::default()
    };

    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            result = listener.accept() => result,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "websocket accept error");
                continue;
            }
        };

        if pool.used_count() >= max_conn_num {
            debug!(%peer, "too many websocket connections, dropping");
            continue;
        }

        let wrapped = match wrap(stream).await {
            Ok(s) => s,
            Err(err) => {
                debug!(%peer, error = %err, "tls handshake failed");
                continue;
            }
        };

        let handshake = tokio_tungstenite::accept_async_with_config(wrapped, Some(ws_config)).await;
        let ws_stream = match handshake {
            Ok(s) => s,
            Err(err) => {
                debug!(%peer, error = %err, "websocket handshake failed");
                continue;
            }
        };

        pool.reserve(|| None);
        let handle = pool.get();

        let transport = WsTransport::new(ws_stream, None, Some(peer), bounds);
        let connection = Arc::new(Connection::new(transport, 128));
        let reader = connection.take_reader().expect("fresh connection owns its reader");
        let agent = Arc::new(Agent::new(connection, codec.clone(), AgentKind::Ws));
        agent.set_connection_id(handle.raw());
        let closed_signal = agent.connection().closed_signal();
        pool.with_mut(handle, |slot| *slot = Some(agent.clone()));

        handlers.fire_connect(agent.as_ref());

        let handlers = handlers.clone();
        let pool = pool.clone();
        let task = tokio::spawn(async move {
            let mut reader = reader;
            loop {
                let frame = tokio::select! {
                    _ = closed_signal.cancelled() => break,
                    frame = reader.read_frame() => frame,
                };
                match frame {
                    Ok(data) => {
                        if let Err(err) = agent.handle_frame(&data, &()) {
                            warn!(error = %err, "websocket route error, closing agent");
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "websocket connection closed");
                        break;
                    }
                }
            }
            agent.destroy();
            handlers.fire_close(agent.as_ref());
            pool.with_mut(handle, |slot| *slot = None);
            pool.free(handle);
        });
        conn_tasks.lock().push(task);
    }
}

use crate::codec::WireMessage;
use crate::errors::{NetworkError, Result};
use tokio_tungstenite::MaybeTlsStream;

type ClientTransport = WsTransport<MaybeTlsStream<TcpStream>>;

/// A single auto-reconnecting WebSocket client connection, grounded on
/// the source's `WSClient`: dial, hand the connection to an agent, run
/// until it errors out, then (if `reconnect` is set) sleep
/// `connect_interval` and dial again. `config.addr` is a full `ws://`
/// or `wss://` URL, matching the source's `Dialer.Dial` usage.
pub struct WsClient<C: MessageCodec + 'static> {
    config: WsConfig,
    codec: Arc<C>,
    handlers: Handlers,
    agent: tokio::sync::RwLock<Option<Arc<Agent<ClientTransport, C>>>>,
}

impl<C: MessageCodec + 'static> WsClient<C> {
    pub fn new(config: WsConfig, codec: Arc<C>, handlers: Handlers) -> Arc<Self> {
        Arc::new(Self {
            config,
            codec,
            handlers,
            agent: tokio::sync::RwLock::new(None),
        })
    }

    /// Runs the dial/reconnect loop until `token` is cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let bounds = SizeBounds::new(1, self.config.max_msg_len);
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

            let transport = WsTransport::new(stream, None, None, bounds);
            let connection = Arc::new(Connection::new(transport, 128));
            let mut reader = connection.take_reader().expect("fresh connection owns its reader");
            let agent = Arc::new(Agent::new(connection, self.codec.clone(), AgentKind::Ws));
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
                            warn!(error = %err, "websocket client route error");
                            break;
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "websocket client connection closed");
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

async fn dial_with_retry(
    addr: &str,
    interval: std::time::Duration,
    token: &CancellationToken,
) -> Option<tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>> {
    loop {
        tokio::select! {
            _ = token.cancelled() => return None,
            result = tokio_tungstenite::connect_async(addr) => {
                match result {
                    Ok((stream, _response)) => return Some(stream),
                    Err(err) => {
                        warn!(%addr, error = %err, "websocket connect error, retrying");
                        tokio::time::sleep(interval).await;
                    }
                }
            }
        }
    }
}
