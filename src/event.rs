//! Events and the inter-partition wire envelope.
//!
//! An [`Event`] is an application payload that carries exactly two pieces of
//! framework state: the name of the stream it travels on and the id of the
//! owning application (plus its creation time). Concrete event types are
//! closed enums or structs whose variants are described by an [`EventKind`];
//! kinds form a single-inheritance hierarchy through [`EventKind::parent`],
//! which trigger lookup walks when no policy is registered for the exact kind.
//!
//! Between partitions, and inside a stream's local queue, events travel as an
//! [`EventMessage`]: `(app id, stream name, serialized event bytes)`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

use crate::codec::CodecError;

/// Discriminant of an event type.
///
/// Kinds are closed (usually a fieldless enum) and organized as a tree:
/// `parent()` returns the next supertype, `None` marks the root.
pub trait EventKind: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Returns the supertype of this kind, or `None` at the root.
    fn parent(&self) -> Option<Self>;
}

/// Routing fields stamped on every event.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeader {
    /// Name of the stream the event was put on. Empty until stamped.
    pub stream_name: String,
    /// Id of the owning application.
    pub app_id: u32,
    /// Creation time, in milliseconds since the Unix epoch.
    pub time_ms: i64,
}

impl EventHeader {
    /// Creates an unstamped header carrying the current wall-clock time.
    pub fn now() -> Self {
        Self {
            stream_name: String::new(),
            app_id: 0,
            time_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// An application event.
///
/// Events are immutable once put on a stream: the stream stamps the header,
/// serializes the event and from then on only hands out shared references.
pub trait Event: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The closed set of kinds this event type can take.
    type Kind: EventKind;

    /// Returns the concrete kind of this event.
    fn kind(&self) -> Self::Kind;

    /// Returns the routing header.
    fn header(&self) -> &EventHeader;

    /// Returns the routing header for stamping.
    fn header_mut(&mut self) -> &mut EventHeader;

    /// Name of the stream this event was put on.
    fn stream_name(&self) -> &str {
        &self.header().stream_name
    }

    /// Id of the owning application.
    fn app_id(&self) -> u32 {
        self.header().app_id
    }
}

/// Size of the fixed part of an encoded [`EventMessage`].
const FRAME_HEADER_LEN: usize = 4 + 2;

/// Envelope exchanged between partitions and queued by streams.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventMessage {
    /// Id of the owning application.
    pub app_id: u32,
    /// Target stream name on the receiving side.
    pub stream_name: String,
    /// Serialized event.
    pub payload: Bytes,
}

impl EventMessage {
    /// Creates a new envelope.
    pub fn new(app_id: u32, stream_name: impl Into<String>, payload: Bytes) -> Self {
        Self {
            app_id,
            stream_name: stream_name.into(),
            payload,
        }
    }

    /// Encodes the envelope as `u32 app_id | u16 name_len | name | payload`.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let name = self.stream_name.as_bytes();
        let name_len = u16::try_from(name.len()).map_err(|_| {
            CodecError::Frame(format!("stream name too long ({} bytes)", name.len()))
        })?;
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + name.len() + self.payload.len());
        buf.put_u32(self.app_id);
        buf.put_u16(name_len);
        buf.put_slice(name);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decodes an envelope produced by [`encode`](Self::encode).
    ///
    /// The payload is a view into `frame`; no copy is made.
    pub fn decode(mut frame: Bytes) -> Result<Self, CodecError> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(CodecError::Frame(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }
        let app_id = frame.get_u32();
        let name_len = frame.get_u16() as usize;
        if frame.len() < name_len {
            return Err(CodecError::Frame(format!(
                "stream name truncated: expected {} bytes, found {}",
                name_len,
                frame.len()
            )));
        }
        let name = frame.split_to(name_len);
        let stream_name = String::from_utf8(name.to_vec())
            .map_err(|e| CodecError::Frame(format!("stream name is not utf-8: {}", e)))?;
        Ok(Self {
            app_id,
            stream_name,
            payload: frame,
        })
    }
}
