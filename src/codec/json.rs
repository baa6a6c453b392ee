//! JSON codec: one object `{ "<msg-id>": <payload> }` with exactly one
//! key. Msg-ids are derived the same way as the binary codec.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;

use super::{overflow_guard, ByteOrder, Frame, MessageCodec, RawHandler, TypedHandler, WireMessage};
use crate::agent::AgentRef;
use crate::errors::{NetworkError, Result};
use crate::hash::string_hash;

type DecodeFn = fn(Value) -> Result<Box<dyn Any + Send>>;

struct Entry {
    decode: Option<DecodeFn>,
    typed_handler: Option<TypedHandler>,
    raw_handler: Option<RawHandler>,
}

pub struct JsonCodec {
    by_id: RwLock<HashMap<u16, Entry>>,
    by_type: RwLock<HashMap<TypeId, u16>>,
    frozen: AtomicBool,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonCodec {
    pub fn new() -> Self {
        Self {
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

    fn id_for<M: WireMessage>(&self) -> Result<u16> {
        self.by_type
            .read()
            .get(&TypeId::of::<M>())
            .copied()
            .ok_or_else(|| NetworkError::InvalidConfig(format!("message {} not registered", M::type_name())))
    }
}

impl MessageCodec for JsonCodec {
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
                decode: Some(|value| {
                    let value: M = serde_json::from_value(value).map_err(|e| NetworkError::Decode(e.to_string()))?;
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
        by_id.get_mut(&id).expect("registered id missing its entry").typed_handler = Some(handler);
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
        let object: HashMap<String, Value> =
            serde_json::from_slice(data).map_err(|e| NetworkError::Decode(e.to_string()))?;
        if object.len() != 1 {
            return Err(NetworkError::Decode(format!(
                "expected exactly one key in json frame, found {}",
                object.len()
            )));
        }
        let (key, payload) = object.into_iter().next().expect("checked len == 1");
        let id: u16 = key
            .parse()
            .map_err(|_| NetworkError::Decode(format!("invalid msg-id key {:?}", key)))?;

        let by_id = self.by_id.read();
        let entry = by_id.get(&id).ok_or(NetworkError::UnknownMessageId(id))?;
        if entry.raw_handler.is_some() {
            let raw = serde_json::to_vec(&payload).map_err(|e| NetworkError::Decode(e.to_string()))?;
            return Ok(Frame::Raw {
                id,
                payload: Bytes::from(raw),
            });
        }
        let decode = entry.decode.ok_or(NetworkError::UnknownMessageId(id))?;
        Ok(Frame::Typed(decode(payload)?))
    }

    fn marshal<M: WireMessage>(&self, msg: &M) -> Result<Vec<Bytes>> {
        let id = self.id_for::<M>()?;
        let mut object = serde_json::Map::new();
        let payload = serde_json::to_value(msg).map_err(|e| NetworkError::Decode(e.to_string()))?;
        object.insert(id.to_string(), payload);
        let data = serde_json::to_vec(&Value::Object(object)).map_err(|e| NetworkError::Decode(e.to_string()))?;
        Ok(vec![Bytes::from(data)])
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
        // The JSON codec has no binary length prefix; byte order only
        // matters for raw send-message helpers that still prefix an id.
        ByteOrder::BigEndian
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
    struct Pong {
        seq: u32,
    }

    impl WireMessage for Pong {
        fn type_name() -> &'static str {
            "Pong"
        }
    }

    #[test]
    fn round_trips_through_single_key_object() {
        let codec = JsonCodec::new();
        codec.register::<Pong>().unwrap();
        codec.freeze();

        let msg = Pong { seq: 3 };
        let fragments = codec.marshal(&msg).unwrap();
        assert_eq!(fragments.len(), 1);

        let frame = codec.unmarshal(&fragments[0]).unwrap();
        match frame {
            Frame::Typed(value) => assert_eq!(value.downcast_ref::<Pong>().unwrap(), &msg),
            Frame::Raw { .. } => panic!("expected typed frame"),
        }
    }

    #[test]
    fn rejects_objects_with_more_than_one_key() {
        let codec = JsonCodec::new();
        codec.register::<Pong>().unwrap();
        codec.freeze();
        let data = br#"{"1": {}, "2": {}}"#;
        assert!(codec.unmarshal(data).is_err());
    }
}
