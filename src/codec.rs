//! Event serialization.
//!
//! The runtime never looks inside event bytes; it only needs a symmetric
//! [`SerializerDeserializer`]. [`JsonSerDeser`] is the default.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Error type for encoding and decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// An event could not be serialized.
    #[error("serialization error: {0}")]
    Serialize(String),
    /// Bytes could not be turned back into an event.
    #[error("deserialization error: {0}")]
    Deserialize(String),
    /// A wire frame was malformed.
    #[error("malformed frame: {0}")]
    Frame(String),
}

/// Symmetric event codec: `deserialize(serialize(e))` must equal `e`.
pub trait SerializerDeserializer<E>: Send + Sync {
    /// Serializes an event.
    fn serialize(&self, event: &E) -> Result<Bytes, CodecError>;

    /// Deserializes an event.
    fn deserialize(&self, bytes: &[u8]) -> Result<E, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerDeser;

impl<E> SerializerDeserializer<E> for JsonSerDeser
where
    E: Serialize + DeserializeOwned,
{
    fn serialize(&self, event: &E) -> Result<Bytes, CodecError> {
        serde_json::to_vec(event)
            .map(Bytes::from)
            .map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<E, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}
