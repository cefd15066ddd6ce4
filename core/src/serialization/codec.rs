use std::any::{type_name, TypeId};
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SerializationError;
use crate::message::{AnyMessage, MessageType};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// Converts one Rust message type to and from bytes in one content type.
///
/// Implement this directly for external wire types that are neither serde
/// nor prost types.
pub trait Codec: Send + Sync + 'static {
    /// The Rust type this codec reads and writes. Two registrations of the
    /// same key are considered identical when their targets match.
    fn target(&self) -> TypeId;

    fn encode(&self, message: &AnyMessage) -> Result<Vec<u8>, SerializationError>;

    fn decode(&self, bytes: &[u8]) -> Result<AnyMessage, SerializationError>;
}

fn mismatch<T: MessageType>(message: &AnyMessage) -> SerializationError {
    SerializationError::TypeMismatch {
        expected: T::TYPE_NAME.to_string(),
        actual: message.type_name().to_string(),
    }
}

/// serde_json codec for `T`.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JsonCodec<{}>", type_name::<T>())
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: MessageType + Serialize + DeserializeOwned,
{
    fn target(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn encode(&self, message: &AnyMessage) -> Result<Vec<u8>, SerializationError> {
        let value = message
            .downcast_ref::<T>()
            .ok_or_else(|| mismatch::<T>(message))?;
        serde_json::to_vec(value).map_err(|e| SerializationError::Encode {
            type_name: T::TYPE_NAME.to_string(),
            reason: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<AnyMessage, SerializationError> {
        serde_json::from_slice::<T>(bytes)
            .map(AnyMessage::new)
            .map_err(|e| SerializationError::DeserializationMismatch {
                type_name: T::TYPE_NAME.to_string(),
                reason: e.to_string(),
            })
    }
}

/// prost codec for `T`.
pub struct ProtobufCodec<T>(PhantomData<fn() -> T>);

impl<T> ProtobufCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for ProtobufCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ProtobufCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtobufCodec<{}>", type_name::<T>())
    }
}

impl<T> Codec for ProtobufCodec<T>
where
    T: MessageType + prost::Message + Default,
{
    fn target(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn encode(&self, message: &AnyMessage) -> Result<Vec<u8>, SerializationError> {
        let value = message
            .downcast_ref::<T>()
            .ok_or_else(|| mismatch::<T>(message))?;
        Ok(prost::Message::encode_to_vec(value))
    }

    fn decode(&self, bytes: &[u8]) -> Result<AnyMessage, SerializationError> {
        <T as prost::Message>::decode(bytes)
            .map(AnyMessage::new)
            .map_err(|e| SerializationError::DeserializationMismatch {
                type_name: T::TYPE_NAME.to_string(),
                reason: e.to_string(),
            })
    }
}
