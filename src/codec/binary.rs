//! Binary codec: `[msg-id: 2 bytes][bincode payload]`. Msg-ids are
//! derived from each registered type's name via [`crate::hash::string_hash`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;

use super::{overflow_guard, ByteOrder, Frame, MessageCodec, RawHandler, TypedHandler, WireMessage};
use crate::agent::AgentRef;
use crate::errors::{NetworkError, Result};
use crate::hash::string_hash;

type DecodeFn = fn(&[u8]) -> Result<Box<dyn Any + Send>>;

struct Entry {
    decode: Option<DecodeFn>,
    typed_handler: Option<TypedHandler>,
    raw_handler: Option<RawHandler>,
}

/// The default codec: fixed msg-id prefix, bincode-encoded payloads.
pub struct BinaryCodec {
    byte_order: ByteOrder,
    by_id: RwLock<HashMap<u16, Entry>>,
    by_type: RwLock<HashMap<TypeId, u16>>,
    frozen: AtomicBool,
}

impl BinaryCodec {
    pub fn new(byte_order: ByteOrder) -> Self {
        Self {
            byte_order,
            by_id: RwLock::new(HashMap::new()),
            by_type: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        }
    }

    fn assert_mutable(&self) {
        assert!(
            !self.frozen.load(Ordering::Acquire),
            "codec registry is frozen; register messages before freeze()"
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

    fn id_for<M: WireMessage>(&self) -> Result<u16> {
        self.by_type
            .read()
            .get(&TypeId::of::<M>())
            .copied()
            .ok_or_else(|| NetworkError::InvalidConfig(format!("message {} not registered", M::type_name())))
    }
}

impl MessageCodec for BinaryCodec {
    fn register<M: WireMessage>(&self) -> Result<()> {
        self.assert_mutable();
        let id = string_hash(M::type_name());
        let mut by_id = self.by_id.write();
        if by_id.contains_key(&id) {
            return Err(NetworkError::DuplicateRegistration { id });
        }
        overflow_guard(by_id.len())?;

        by_id.insert(
            id,
            Entry {
                decode: Some(|data| {
                    let value: M =
                        bincode::deserialize(data).map_err(|e| NetworkError::Decode(e.to_string()))?;
                    Ok(Box::new(value))
                }),
                typed_handler: None,
                raw_handler: None,
            },
        );
        self.by_type.write().insert(TypeId::of::<M>(), id);
        Ok(())
    }

    fn set_handler<M: WireMessage>(&self, handler: TypedHandler) -> Result<()> {
        self.assert_mutable();
        let id = self.id_for::<M>()?;
        let mut by_id = self.by_id.write();
        let entry = by_id.get_mut(&id).expect("registered id missing its entry");
        entry.typed_handler = Some(handler);
        Ok(())
    }

    fn set_raw_handler(&self, id: u16, handler: RawHandler) -> Result<()> {
        self.assert_mutable();
        let mut by_id = self.by_id.write();
        let entry = by_id.entry(id).or_insert_with(|| Entry {
            decode: None,
            typed_handler: None,
            raw_handler: None,
        });
        if entry.raw_handler.is_some() {
            return Err(NetworkError::DuplicateRegistration { id });
        }
        entry.raw_handler = Some(handler);
        Ok(())
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Frame> {
        if data.len() < 2 {
            return Err(NetworkError::Decode("frame shorter than the msg-id prefix".into()));
        }
        let mut id_bytes = [0u8; 2];
        id_bytes.copy_from_slice(&data[..2]);
        let id = self.decode_id(id_bytes);
        let payload = &data[2..];

        let by_id = self.by_id.read();
        let entry = by_id.get(&id).ok_or(NetworkError::UnknownMessageId(id))?;
        if entry.raw_handler.is_some() {
            return Ok(Frame::Raw {
                id,
                payload: Bytes::copy_from_slice(payload),
            });
        }
        let decode = entry.decode.ok_or(NetworkError::UnknownMessageId(id))?;
        Ok(Frame::Typed(decode(payload)?))
    }

    fn marshal<M: WireMessage>(&self, msg: &M) -> Result<Vec<Bytes>> {
        let id = self.id_for::<M>()?;
        let payload = bincode::serialize(msg).map_err(|e| NetworkError::Decode(e.to_string()))?;
        Ok(vec![Bytes::copy_from_slice(&self.encode_id(id)), Bytes::from(payload)])
    }

    fn route(&self, agent: &dyn AgentRef, frame: Frame, user_data: &(dyn Any + Send + Sync)) -> Result<()> {
        match frame {
            Frame::Raw { id, payload } => {
                let by_id = self.by_id.read();
                let entry = by_id.get(&id).ok_or(NetworkError::UnknownMessageId(id))?;
                if let Some(handler) = &entry.raw_handler {
                    handler(agent, id, &payload, user_data);
                }
                Ok(())
            }
            Frame::Typed(value) => {
                let type_id = (*value).type_id();
                let id = *self
                    .by_type
                    .read()
                    .get(&type_id)
                    .ok_or_else(|| NetworkError::Decode("decoded type is not registered".into()))?;
                let by_id = self.by_id.read();
                let entry = by_id.get(&id).ok_or(NetworkError::UnknownMessageId(id))?;
                if let Some(handler) = &entry.typed_handler {
                    handler(agent, value.as_ref(), user_data);
                }
                Ok(())
            }
        }
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
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        nonce: u32,
    }

    impl WireMessage for Ping {
        fn type_name() -> &'static str {
            "Ping"
        }
    }

    #[test]
    fn round_trips_a_registered_message() {
        let codec = BinaryCodec::new(ByteOrder::BigEndian);
        codec.register::<Ping>().unwrap();
        codec.freeze();

        let msg = Ping { nonce: 7 };
        let fragments = codec.marshal(&msg).unwrap();
        let mut wire = Vec::new();
        for fragment in &fragments {
            wire.extend_from_slice(fragment);
        }

        let frame = codec.unmarshal(&wire).unwrap();
        match frame {
            Frame::Typed(value) => {
                let decoded = value.downcast_ref::<Ping>().unwrap();
                assert_eq!(decoded, &msg);
            }
            Frame::Raw { .. } => panic!("expected a typed frame"),
        }
    }

    #[test]
    fn unknown_id_is_an_error() {
        let codec = BinaryCodec::new(ByteOrder::BigEndian);
        codec.freeze();
        let wire = [0u8, 1, 2, 3];
        assert!(codec.unmarshal(&wire).is_err());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let codec = BinaryCodec::new(ByteOrder::BigEndian);
        codec.register::<Ping>().unwrap();
        assert!(codec.register::<Ping>().is_err());
    }
}
