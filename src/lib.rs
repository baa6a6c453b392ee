//! A connection and dispatch engine for message-oriented network
//! servers, covering TCP, UDP, and WebSocket transports behind one
//! agent/codec/dispatch model.
//!
//! Start with [`server::NetServerBuilder`] to register message types and
//! lifecycle hooks on a codec, `build()` it into a [`server::NetServer`],
//! then call `start_tcp`/`start_udp`/`start_ws` for whichever transports
//! the process needs. [`server::NetClient`] dials the same three
//! transports from the other side.
//!
//! ```no_run
//! use std::sync::Arc;
//! use nexus_net::codec::binary::BinaryCodec;
//! use nexus_net::codec::ByteOrder;
//! use nexus_net::config::TcpConfig;
//! use nexus_net::dispatch::DispatchConfig;
//! use nexus_net::server::NetServerBuilder;
//!
//! # async fn run() -> nexus_net::errors::Result<()> {
//! let codec = Arc::new(BinaryCodec::new(ByteOrder::BigEndian));
//! let server = NetServerBuilder::new(codec)
//!     .on_connect(|agent| tracing::info!(id = agent.connection_id(), "connected"))
//!     .build();
//! let handle = server.start_tcp(TcpConfig::default(), DispatchConfig::default()).await?;
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod errors;
pub mod framing;
pub mod hash;
pub mod pool;
pub mod server;

pub use agent::{Agent, AgentKind, AgentRef};
pub use codec::MessageCodec;
pub use config::Config;
pub use errors::{NetworkError, Result};
pub use server::{ClientHandle, ClientKind, NetClient, NetServer, NetServerBuilder, ServerHandle};
