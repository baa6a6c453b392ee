use thiserror::Error;

/// Errors surfaced by the connection and dispatch engine.
///
/// Transport, framing, decode and route errors are terminal for the agent
/// that raised them: the read loop unwinds, `on_close` fires, and the
/// agent is returned to its pool. Registration and config errors are
/// raised during startup, before any agent exists, and are meant to be
/// fatal to the caller.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame length {len} out of bounds [{min}, {max}]")]
    FrameBounds { len: usize, min: usize, max: usize },

    #[error("message decode error: {0}")]
    Decode(String),

    #[error("message id {0} is not registered")]
    UnknownMessageId(u16),

    #[error("message id {id} is already registered")]
    DuplicateRegistration { id: u16 },

    #[error("message registry is full (max 65535 entries)")]
    RegistryOverflow,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("route handler failed: {0}")]
    RouteFailed(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("websocket error: {0}")]
    WebSocket(String),
}

pub type Result<T, E = NetworkError> = std::result::Result<T, E>;
