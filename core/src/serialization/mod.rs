//! Message serialization.
//! - codec.rs: the Codec trait plus JSON (serde_json) and protobuf (prost) codecs
//! - any.rs: type-tagged serde for polymorphic `AnyMessage` fields
//!
//! The registry is keyed by (message type name, content type). It is owned by
//! the runtime; clones share the same table.

use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::SerializationError;
use crate::message::{AnyMessage, MessageType};
use crate::proto;

mod any;
mod codec;

pub use codec::{Codec, JsonCodec, ProtobufCodec, JSON_CONTENT_TYPE, PROTOBUF_CONTENT_TYPE};

/// Prefix written in front of the type name in `google.protobuf.Any`
/// type URLs.
pub const TYPE_URL_PREFIX: &str = "type.weft.dev/";

type Key = (String, String);

#[derive(Clone, Default)]
pub struct SerializationRegistry {
    codecs: Arc<DashMap<Key, Arc<dyn Codec>>>,
}

impl SerializationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `codec` for (`type_name`, `content_type`). Registering a codec
    /// for the same Rust type again is a no-op; a different type under an
    /// existing key is an error.
    pub fn add_serializer(
        &self,
        type_name: &str,
        content_type: &str,
        codec: Arc<dyn Codec>,
    ) -> Result<(), SerializationError> {
        match self
            .codecs
            .entry((type_name.to_string(), content_type.to_string()))
        {
            Entry::Occupied(existing) if existing.get().target() == codec.target() => Ok(()),
            Entry::Occupied(_) => Err(SerializationError::DuplicateSerializer {
                type_name: type_name.to_string(),
                content_type: content_type.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(codec);
                info!(
                    target: "serialization",
                    type_name = %type_name,
                    content_type = %content_type,
                    "Registered serializer"
                );
                Ok(())
            }
        }
    }

    pub fn add_json<T>(&self) -> Result<(), SerializationError>
    where
        T: MessageType + Serialize + DeserializeOwned,
    {
        self.add_serializer(
            T::TYPE_NAME,
            JSON_CONTENT_TYPE,
            Arc::new(JsonCodec::<T>::new()),
        )
    }

    pub fn add_protobuf<T>(&self) -> Result<(), SerializationError>
    where
        T: MessageType + prost::Message + Default,
    {
        self.add_serializer(
            T::TYPE_NAME,
            PROTOBUF_CONTENT_TYPE,
            Arc::new(ProtobufCodec::<T>::new()),
        )
    }

    pub fn is_registered(&self, type_name: &str, content_type: &str) -> bool {
        self.codecs
            .contains_key(&(type_name.to_string(), content_type.to_string()))
    }

    /// Content types registered for `type_name`, sorted.
    pub fn content_types(&self, type_name: &str) -> Vec<String> {
        let mut types: Vec<String> = self
            .codecs
            .iter()
            .filter(|e| e.key().0 == type_name)
            .map(|e| e.key().1.clone())
            .collect();
        types.sort();
        types
    }

    fn codec(
        &self,
        type_name: &str,
        content_type: &str,
    ) -> Result<Arc<dyn Codec>, SerializationError> {
        // Clone the codec out so no shard lock is held while it runs; codecs
        // of container types re-enter the registry for polymorphic fields.
        self.codecs
            .get(&(type_name.to_string(), content_type.to_string()))
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SerializationError::UnsupportedType {
                type_name: type_name.to_string(),
                content_type: content_type.to_string(),
            })
    }

    pub fn serialize(
        &self,
        message: &AnyMessage,
        type_name: &str,
        content_type: &str,
    ) -> Result<Vec<u8>, SerializationError> {
        let codec = self.codec(type_name, content_type)?;
        let bytes = self.in_scope(|| codec.encode(message))?;
        debug!(
            target: "serialization",
            type_name = %type_name,
            content_type = %content_type,
            bytes = bytes.len(),
            "Serialized message"
        );
        Ok(bytes)
    }

    pub fn deserialize(
        &self,
        bytes: &[u8],
        type_name: &str,
        content_type: &str,
    ) -> Result<AnyMessage, SerializationError> {
        let codec = self.codec(type_name, content_type)?;
        let message = self.in_scope(|| codec.decode(bytes))?;
        if message.type_name() != type_name {
            return Err(SerializationError::TypeMismatch {
                expected: type_name.to_string(),
                actual: message.type_name().to_string(),
            });
        }
        Ok(message)
    }

    /// Run `f` with this registry available to `AnyMessage` fields that are
    /// (de)serialized through serde inside it.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        let _scope = any::enter(self);
        f()
    }

    /// `message` as a `weft.v1.Payload` in `content_type`.
    pub fn to_payload(
        &self,
        message: &AnyMessage,
        content_type: &str,
    ) -> Result<proto::Payload, SerializationError> {
        let data = self.serialize(message, message.type_name(), content_type)?;
        Ok(proto::Payload {
            data_type: message.type_name().to_string(),
            data_content_type: content_type.to_string(),
            data,
        })
    }

    pub fn from_payload(&self, payload: &proto::Payload) -> Result<AnyMessage, SerializationError> {
        self.deserialize(&payload.data, &payload.data_type, &payload.data_content_type)
    }

    /// Pack `message` into a `google.protobuf.Any` using its protobuf codec.
    pub fn pack_any(&self, message: &AnyMessage) -> Result<prost_types::Any, SerializationError> {
        let value = self.serialize(message, message.type_name(), PROTOBUF_CONTENT_TYPE)?;
        Ok(prost_types::Any {
            type_url: format!("{}{}", TYPE_URL_PREFIX, message.type_name()),
            value,
        })
    }

    /// Inverse of [`pack_any`](Self::pack_any). Any URL prefix is accepted;
    /// the type name is the part after the last `/`.
    pub fn unpack_any(&self, any: &prost_types::Any) -> Result<AnyMessage, SerializationError> {
        let type_name = any
            .type_url
            .rsplit_once('/')
            .map_or(any.type_url.as_str(), |(_, name)| name);
        self.deserialize(&any.value, type_name, PROTOBUF_CONTENT_TYPE)
    }
}

impl fmt::Debug for SerializationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializationRegistry")
            .field("codecs", &self.codecs.len())
            .finish()
    }
}
