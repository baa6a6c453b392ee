//! Server/client builder and process lifecycle. `NetServerBuilder`
//! mirrors `server/define.go`'s `RegisterXxx` free functions, but as
//! builder methods on an owned value instead of package-level mutable
//! statics — there is exactly one of these per process in the source
//! this was modeled on; here you can have as many as you like.

pub mod tcp;
pub mod udp;
pub mod ws;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::{Agent, AgentRef};
use crate::codec::MessageCodec;
use crate::connection::Transport;
use crate::pool::Pool;

pub type InitHook = Arc<dyn Fn() + Send + Sync>;
pub type LoopHook = Arc<dyn Fn() + Send + Sync>;
pub type DestroyHook = Arc<dyn Fn() + Send + Sync>;
pub type ConnectHook = Arc<dyn Fn(&dyn AgentRef) + Send + Sync>;
pub type CloseHook = Arc<dyn Fn(&dyn AgentRef) + Send + Sync>;

/// Lifecycle callbacks, shared across however many listeners a
/// [`NetServer`] starts. `on_connect`/`on_close` take the dyn-safe
/// [`AgentRef`] surface rather than a concrete `Agent<T, C>`, since one
/// set of hooks applies uniformly across TCP, UDP, and WebSocket
/// agents — the same shape as the source's single `Agent` interface.
#[derive(Clone, Default)]
pub struct Handlers {
    pub on_init: Option<InitHook>,
    pub on_loop: Option<LoopHook>,
    pub on_destroy: Option<DestroyHook>,
    pub on_connect: Option<ConnectHook>,
    pub on_close: Option<CloseHook>,
}

impl Handlers {
    fn fire_init(&self) {
        if let Some(cb) = &self.on_init {
            cb();
        }
    }

    fn fire_loop(&self) {
        if let Some(cb) = &self.on_loop {
            cb();
        }
    }

    fn fire_destroy(&self) {
        if let Some(cb) = &self.on_destroy {
            cb();
        }
    }

    fn fire_connect(&self, agent: &dyn AgentRef) {
        if let Some(cb) = &self.on_connect {
            cb(agent);
        }
    }

    fn fire_close(&self, agent: &dyn AgentRef) {
        if let Some(cb) = &self.on_close {
            cb(agent);
        }
    }
}

/// Builds a [`NetServer`] bound to one codec and one set of lifecycle
/// hooks. Register message types and their handlers on `codec` directly
/// before calling `build()` — the registry is frozen at that point.
pub struct NetServerBuilder<C: MessageCodec> {
    codec: Arc<C>,
    handlers: Handlers,
}

impl<C: MessageCodec> NetServerBuilder<C> {
    pub fn new(codec: Arc<C>) -> Self {
        Self {
            codec,
            handlers: Handlers::default(),
        }
    }

    pub fn on_init(mut self, cb: impl Fn() + Send + Sync + 'static) -> Self {
        self.handlers.on_init = Some(Arc::new(cb));
        self
    }

    pub fn on_loop(mut self, cb: impl Fn() + Send + Sync + 'static) -> Self {
        self.handlers.on_loop = Some(Arc::new(cb));
        self
    }

    pub fn on_destroy(mut self, cb: impl Fn() + Send + Sync + 'static) -> Self {
        self.handlers.on_destroy = Some(Arc::new(cb));
        self
    }

    pub fn on_connect(mut self, cb: impl Fn(&dyn AgentRef) + Send + Sync + 'static) -> Self {
        self.handlers.on_connect = Some(Arc::new(cb));
        self
    }

    pub fn on_close(mut self, cb: impl Fn(&dyn AgentRef) + Send + Sync + 'static) -> Self {
        self.handlers.on_close = Some(Arc::new(cb));
        self
    }

    /// Freezes the codec registry and returns the runnable server. Call
    /// this only after every `register`/`set_handler` call you intend
    /// to make — matching the "registry is write-once" invariant.
    pub fn build(self) -> NetServer<C> {
        self.codec.freeze();
        self.handlers.fire_init();
        NetServer {
            codec: self.codec,
            handlers: self.handlers,
        }
    }
}

pub struct NetServer<C: MessageCodec> {
    pub(crate) codec: Arc<C>,
    pub(crate) handlers: Handlers,
}

impl<C: MessageCodec + 'static> NetServer<C> {
    /// Starts a TCP listener bound to this server's codec and hooks.
    pub async fn start_tcp(
        &self,
        config: crate::config::TcpConfig,
        dispatch_config: crate::dispatch::DispatchConfig,
    ) -> crate::errors::Result<ServerHandle> {
        tcp::start(config, dispatch_config, self.codec.clone(), self.handlers.clone()).await
    }

    /// Starts a UDP listener bound to this server's codec and hooks.
    pub async fn start_udp(
        &self,
        config: crate::config::UdpConfig,
        dispatch_config: crate::dispatch::DispatchConfig,
    ) -> crate::errors::Result<ServerHandle> {
        udp::start(config, dispatch_config, self.codec.clone(), self.handlers.clone()).await
    }

    /// Starts a WebSocket listener bound to this server's codec and
    /// hooks. Has no dispatch loop of its own; WS agents route inline
    /// from their read task (see `server::ws`).
    pub async fn start_ws(&self, config: crate::config::WsConfig) -> crate::errors::Result<ServerHandle> {
        ws::start(config, self.codec.clone(), self.handlers.clone()).await
    }
}

/// Which transport a [`NetClient`] should dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Tcp,
    Udp,
    Ws,
}

/// A running auto-reconnecting client on one of the three transports,
/// grounded on the source's per-transport `XxxClient.Start()` plus
/// `server/define.go`'s single `RegisterClient`-style entry point —
/// here expressed as one constructor that picks the concrete client by
/// `ClientKind` instead of three separately-named free functions.
pub enum NetClient<C: MessageCodec + 'static> {
    Tcp(Arc<tcp::TcpClient<C>>),
    Udp(Arc<udp::UdpClient<C>>),
    Ws(Arc<ws::WsClient<C>>),
}

impl<C: MessageCodec + 'static> NetClient<C> {
    /// Dials `addr` over the given transport using that transport's
    /// default settings (reconnect on, default timeouts/limits); start
    /// the client's background dial/reconnect task and keep the
    /// returned [`ClientHandle`] alive for as long as the connection
    /// should run.
    pub fn connect(addr: &str, kind: ClientKind, codec: Arc<C>, handlers: Handlers) -> ClientHandle<C> {
        let token = CancellationToken::new();
        let (client, task) = match kind {
            ClientKind::Tcp => {
                let mut config = crate::config::TcpConfig::default();
                config.addr = addr.to_string();
                let client = tcp::TcpClient::new(config, codec, handlers);
                let task = tokio::spawn(client.clone().run(token.clone()));
                (NetClient::Tcp(client), task)
            }
            ClientKind::Udp => {
                let mut config = crate::config::UdpConfig::default();
                config.addr = addr.to_string();
                let client = udp::UdpClient::new(config, codec, handlers);
                let task = tokio::spawn(client.clone().run(token.clone()));
                (NetClient::Udp(client), task)
            }
            ClientKind::Ws => {
                let mut config = crate::config::WsConfig::default();
                config.addr = addr.to_string();
                let client = ws::WsClient::new(config, codec, handlers);
                let task = tokio::spawn(client.clone().run(token.clone()));
                (NetClient::Ws(client), task)
            }
        };
        ClientHandle { client, token, task }
    }

    /// Sends a registered message type on whichever transport this
    /// client is running over.
    pub async fn send<M: crate::codec::WireMessage>(&self, msg: &M) -> crate::errors::Result<bool> {
        match self {
            NetClient::Tcp(c) => c.send(msg).await,
            NetClient::Udp(c) => c.send(msg).await,
            NetClient::Ws(c) => c.send(msg).await,
        }
    }
}

/// Owns a [`NetClient`]'s background dial/reconnect task. `shutdown`
/// cancels the loop and waits for the current connection (if any) to
/// close cleanly.
pub struct ClientHandle<C: MessageCodec + 'static> {
    pub client: NetClient<C>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl<C: MessageCodec + 'static> ClientHandle<C> {
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

/// Builds the per-listener `destroy_all` closure `ServerHandle::shutdown`
/// calls after its accept loop(s) have stopped: walks every used pool
/// slot and calls `agent.destroy()` on it. Only `destroy()` runs here —
/// the per-connection reader task each agent already has (now promptly
/// unblocked via `Connection::closed_signal`) is the one that calls
/// `fire_close` and frees the slot, so this never double-fires a close
/// hook.
pub(crate) fn destroy_all_agents<T, C>(pool: Arc<Pool<Option<Arc<Agent<T, C>>>>>) -> Box<dyn Fn() + Send + Sync>
where
    T: Transport,
    C: MessageCodec + 'static,
{
    Box::new(move || {
        pool.used_range(|_handle, slot| {
            if let Some(agent) = slot {
                agent.destroy();
            }
        });
    })
}

/// A running listener (TCP, UDP, or WS). Dropping this without calling
/// `shutdown` leaves the listener's tasks running; `shutdown` is the
/// external collaborator hook a process installs its own SIGINT/SIGTERM
/// handling against (this crate does not install one itself).
pub struct ServerHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    on_destroy: Option<DestroyHook>,
    conn_tasks: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
    destroy_all: Box<dyn Fn() + Send + Sync>,
}

impl ServerHandle {
    pub(crate) fn new(
        token: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
        on_destroy: Option<DestroyHook>,
        conn_tasks: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
        destroy_all: Box<dyn Fn() + Send + Sync>,
    ) -> Self {
        Self {
            token,
            tasks,
            on_destroy,
            conn_tasks,
            destroy_all,
        }
    }

    /// Closes the listener, destroys every agent it has accepted, then
    /// waits for every per-connection task to finish — mirroring the
    /// source's server close: stop accepting, close every used
    /// connection's socket, then wait for all per-connection goroutines.
    ///
    /// Order matters: the accept loop(s) are awaited first so that any
    /// connection accepted in the same instant as `shutdown()` is
    /// guaranteed to have its agent and task already registered before
    /// `destroy_all` walks the pool.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        (self.destroy_all)();
        let conn_tasks = std::mem::take(&mut *self.conn_tasks.lock());
        for task in conn_tasks {
            let _ = task.await;
        }
        if let Some(cb) = self.on_destroy.take() {
            cb();
        }
        info!("server shut down");
    }
}
