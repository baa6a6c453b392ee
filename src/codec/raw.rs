//! Raw codec: `[msg-id: 2 bytes][opaque payload]`, identical framing to
//! the binary codec but with no type lookup — the registry holds only
//! raw handlers. Useful for passthrough/proxy servers that never decode
//! the payload.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;

use super::{overflow_guard, ByteOrder, Frame, MessageCodec, RawHandler, TypedHandler, WireMessage};
use crate::agent::AgentRef;
use crate::errors::{NetworkError, Result};

pub struct RawCodec {
    byte_order: ByteOrder,
    handlers: RwLock<HashMap<u16, RawHandler>>,
    frozen: AtomicBool,
}

impl RawCodec {
    pub fn new(byte_order: ByteOrder) -> Self {
        Self {
            byte_order,
            handlers: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        }
    }

    fn assert_mutable(&self) {
        assert!(
            !self.frozen.load(Ordering::Acquire),
            "codec registry is frozen; register handlers before freeze()"
        );
    }

    fn encode_id(&self, id: u16) -> [u8; 2] {
        match self.byte_order {
            ByteOrder::LittleEndian => id.to_le_bytes(),
            ByteOrder::BigEndian => id.to_be_bytes(),
        }
    }

    fn decode_id(&self, bytes: [u8; 2]) -> u16 {
        match self.byte_order {
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
        }
    }
}

impl MessageCodec for RawCodec {
    /// No-op: the raw codec never decodes a type, so there is nothing
    /// to register beyond the handler attached with `set_raw_handler`.
    fn register<M: WireMessage>(&self) -> Result<()> {
        Ok(())
    }

    /// No-op for the same reason: typed handlers have no meaning here.
    fn set_handler<M: WireMessage>(&self, _handler: TypedHandler) -> Result<()> {
        Ok(())
    }

    fn set_raw_handler(&self, id: u16, handler: RawHandler) -> Result<()> {
        self.assert_mutable();
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&id) {
            return Err(NetworkError::DuplicateRegistration { id });
        }
        overflow_guard(handlers.len())?;
        handlers.insert(id, handler);
        Ok(())
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Frame> {
        if data.len() < 2 {
            return Err(NetworkError::Decode("frame shorter than the msg-id prefix".into()));
        }
        let mut id_bytes = [0u8; 2];
        id_bytes.copy_from_slice(&data[..2]);
        let id = self.decode_id(id_bytes);
        if !self.handlers.read().contains_key(&id) {
            return Err(NetworkError::UnknownMessageId(id));
        }
        Ok(Frame::Raw {
            id,
            payload: Bytes::copy_from_slice(&data[2..]),
        })
    }

    /// Not meaningful for the raw codec; typed messages are never
    /// marshaled through it. Use `send_raw_message` on the agent
    /// instead.
    fn marshal<M: WireMessage>(&self, _msg: &M) -> Result<Vec<Bytes>> {
        Err(NetworkError::InvalidConfig(
            "the raw codec cannot marshal typed messages; use send_raw_message".into(),
        ))
    }

    fn route(&self, agent: &dyn AgentRef, frame: Frame, user_data: &(dyn Any + Send + Sync)) -> Result<()> {
        let (id, payload) = match frame {
            Frame::Raw { id, payload } => (id, payload),
            Frame::Typed(_) => unreachable!("RawCodec::unmarshal only ever produces Frame::Raw"),
        };
        let handlers = self.handlers.read();
        let handler = handlers.get(&id).ok_or(NetworkError::UnknownMessageId(id))?;
        handler(agent, id, &payload, user_data);
        Ok(())
    }

    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::sync::Arc;

    #[test]
    fn routes_raw_payload_by_id() {
        let codec = RawCodec::new(ByteOrder::BigEndian);
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = seen.clone();
        codec
            .set_raw_handler(
                7,
                Arc::new(move |_agent, id, payload, _user| {
                    assert_eq!(id, 7);
                    assert_eq!(&payload[..], b"hi");
                    seen_clone.fetch_add(1, AtomicOrdering::SeqCst);
                }),
            )
            .unwrap();
        codec.freeze();

        let mut wire = vec![0u8, 7];
        wire.extend_from_slice(b"hi");

        struct NoopAgent;
        impl AgentRef for NoopAgent {
            fn connection_id(&self) -> u64 {
                0
            }
            fn send_raw_message(&self, _id: u16, _payload: &[u8]) -> bool {
                true
            }
        }

        let frame = codec.unmarshal(&wire).unwrap();
        codec.route(&NoopAgent, frame, &()).unwrap();
        assert_eq!(seen.load(AtomicOrdering::SeqCst), 1);
    }
}
