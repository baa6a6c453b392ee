//! The pluggable codec layer: maps a 16-bit message id to a typed Rust
//! value, marshals/unmarshals wire payloads, and routes decoded
//! messages to user handlers.
//!
//! Three concrete codecs share one capability trait ([`MessageCodec`]):
//! [`binary::BinaryCodec`] (id-prefixed binary payloads), [`json::JsonCodec`]
//! (single-key JSON objects), and [`raw::RawCodec`] (id-prefixed opaque
//! bytes, no type lookup). The registry is write-once: `register` and
//! `set_handler` must run to completion before the first `route` call,
//! exactly as the spec's "dangerous on route" note describes.

pub mod binary;
pub mod json;
pub mod raw;

use std::any::Any;
use std::sync::Arc;

use bytes::Bytes;

use crate::agent::AgentRef;
use crate::errors::{NetworkError, Result};

/// Byte order used to encode/decode the 2-byte message id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// A decoded inbound frame: either a schema-decoded typed value, or a
/// raw passthrough of id + opaque payload bytes.
pub enum Frame {
    Typed(Box<dyn Any + Send>),
    Raw { id: u16, payload: Bytes },
}

/// A handler for a schema-decoded message. Receives the originating
/// agent, the downcast-able message, and the agent's opaque user data.
pub type TypedHandler =
    Arc<dyn Fn(&dyn AgentRef, &(dyn Any + Send), &(dyn Any + Send + Sync)) + Send + Sync>;

/// A handler for a raw passthrough message. Receives the originating
/// agent, the message id, the opaque payload, and the agent's user
/// data.
pub type RawHandler =
    Arc<dyn Fn(&dyn AgentRef, u16, &Bytes, &(dyn Any + Send + Sync)) + Send + Sync>;

/// The message registry / codec capability. Implementors must be safe
/// to call from any number of concurrent reader tasks once `route`,
/// `marshal`, and `unmarshal` are in use, hence `Send + Sync`.
///
/// Note: `register`/`set_handler`/`marshal` are generic, so this trait
/// is used as a static bound (`C: MessageCodec`), never as `dyn
/// MessageCodec` — the concrete codec is chosen once per server/client
/// at construction time, same as the transport.
pub trait MessageCodec: Send + Sync {
    /// Registers a message type so it can be looked up by id. Must be
    /// called before the registry is used for routing; calling it
    /// afterwards is a programming error.
    fn register<M: WireMessage>(&self) -> Result<()>;

    /// Attaches a typed handler to an already-registered message type.
    fn set_handler<M: WireMessage>(&self, handler: TypedHandler) -> Result<()>;

    /// Attaches a raw handler to a message id, bypassing schema decode.
    fn set_raw_handler(&self, id: u16, handler: RawHandler) -> Result<()>;

    /// Decodes a wire payload into a [`Frame`].
    fn unmarshal(&self, data: &[u8]) -> Result<Frame>;

    /// Encodes a registered message into wire fragments (e.g.
    /// `[id][payload]`), ready to be queued as one framed write.
    fn marshal<M: WireMessage>(&self, msg: &M) -> Result<Vec<Bytes>>;

    /// Invokes the registered handler for a decoded frame.
    fn route(
        &self,
        agent: &dyn AgentRef,
        frame: Frame,
        user_data: &(dyn Any + Send + Sync),
    ) -> Result<()>;

    fn byte_order(&self) -> ByteOrder;

    /// Freezes the registry: after this call, `register`/`set_handler`/
    /// `set_raw_handler` panic instead of mutating shared state. Models
    /// the registry as a write-once capability (see the design notes).
    fn freeze(&self);
}

/// A message type eligible for registration. `type_name` feeds the
/// deterministic [`crate::hash::string_hash`] used to derive msg-ids for
/// the binary and JSON codecs.
pub trait WireMessage:
    serde::Serialize + serde::de::DeserializeOwned + Send + Sized + 'static
{
    fn type_name() -> &'static str;
}

pub(crate) fn overflow_guard(count: usize) -> Result<()> {
    if count >= u16::MAX as usize {
        Err(NetworkError::RegistryOverflow)
    } else {
        Ok(())
    }
}
