//! Processing elements.
//!
//! A processing element (PE) is application logic keyed by a routing key.
//! Its [`Prototype`] holds the configuration shared by every key (triggers,
//! timer, checkpointing policy, thread-safety marker) and a cache of
//! [`Instance`]s, one per key, each created on first use by a factory
//! function followed by [`ProcessingElement::on_create`].
//!
//! State that every instance should share is captured by the factory (for
//! example an `Arc` cloned into each instance); everything else is fresh per
//! instance.

pub mod instance;
pub mod prototype;
pub mod trigger;
pub mod window;

pub use instance::Instance;
pub use prototype::{Prototype, PrototypeConfig, PrototypeLifecycle, SINGLETON_ID, StreamTarget};
pub use trigger::{TriggerCounters, TriggerPolicy, TriggerRegistry};
pub use window::{WindowConfig, WindowLogic, WindowingPe};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::sync::Arc;
use thiserror::Error;

use crate::event::Event;
use crate::stream::StreamDirectory;

/// Error type for processing elements.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeError {
    /// The creation hook failed; no instance was cached.
    #[error("cannot create instance {key:?} of {prototype}: {reason}")]
    Creation {
        /// Prototype name.
        prototype: String,
        /// Requested key.
        key: String,
        /// Failure reported by the hook.
        reason: String,
    },
    /// A handler failed.
    #[error("handler error: {0}")]
    Handler(String),
    /// A prototype was configured with invalid values.
    #[error("invalid prototype configuration: {0}")]
    InvalidConfig(String),
    /// An emit named a stream that does not exist.
    #[error("unknown stream {0:?}")]
    UnknownStream(String),
    /// An emit failed.
    #[error("cannot emit to stream {stream:?}: {reason}")]
    Emit {
        /// Target stream.
        stream: String,
        /// Failure reported by the stream.
        reason: String,
    },
}

impl PeError {
    /// Wraps any displayable failure as a handler error.
    pub fn handler(reason: impl Display) -> Self {
        PeError::Handler(reason.to_string())
    }
}

/// Application logic run for every key of a prototype.
///
/// Instances are serialized with serde for checkpointing; fields that must
/// not be persisted are marked `#[serde(skip)]`. A checkpointed instance is
/// recovered right after creation, before any timer tick or event reaches it.
#[async_trait]
pub trait ProcessingElement: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Event type consumed and emitted by this PE.
    type Event: Event;

    /// When `false` (the default) one instance handles one event at a time,
    /// through the trigger handler. When `true` the instance
    /// lock is only held for each individual handler call, so deliveries for
    /// the same key may interleave between calls.
    const THREAD_SAFE: bool = false;

    /// Called once after the factory built the instance. An error aborts
    /// the creation.
    async fn on_create(&mut self, _ctx: &PeContext<Self::Event>) -> Result<(), PeError> {
        Ok(())
    }

    /// Called before the instance is dropped.
    async fn on_remove(&mut self, _ctx: &PeContext<Self::Event>) {}

    /// Handles one event routed to this instance.
    async fn on_event(
        &mut self,
        event: &Self::Event,
        ctx: &PeContext<Self::Event>,
    ) -> Result<(), PeError>;

    /// Called right after [`on_event`](Self::on_event) when a trigger fires.
    async fn on_trigger(
        &mut self,
        _event: &Self::Event,
        _ctx: &PeContext<Self::Event>,
    ) -> Result<(), PeError> {
        Ok(())
    }

    /// Called for every live instance on each tick of the prototype timer.
    async fn on_time(&mut self, _ctx: &PeContext<Self::Event>) -> Result<(), PeError> {
        Ok(())
    }

    /// Applies state recovered from a checkpoint.
    ///
    /// `self` is the instance the factory just built and `on_create`
    /// initialized; `restored` was deserialized, so its `#[serde(skip)]`
    /// fields hold defaults. Copy the persisted fields into `self` and keep
    /// the factory-built handles.
    fn restore_state(&mut self, restored: Self);
}

/// What a handler knows about the instance it runs in.
pub struct PeContext<E> {
    id: String,
    prototype: Arc<str>,
    streams: StreamDirectory<E>,
}

impl<E> Clone for PeContext<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            prototype: self.prototype.clone(),
            streams: self.streams.clone(),
        }
    }
}

impl<E: Event> PeContext<E> {
    pub(crate) fn new(
        id: impl Into<String>,
        prototype: Arc<str>,
        streams: StreamDirectory<E>,
    ) -> Self {
        Self {
            id: id.into(),
            prototype,
            streams,
        }
    }

    /// Instance id: the routing key, or [`SINGLETON_ID`].
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the prototype.
    pub fn prototype(&self) -> &str {
        &self.prototype
    }

    /// Puts `event` on the stream named `stream`.
    ///
    /// Waits while the stream's queue is full.
    pub async fn emit(&self, stream: &str, event: E) -> Result<(), PeError> {
        let target = self
            .streams
            .get(stream)
            .ok_or_else(|| PeError::UnknownStream(stream.to_string()))?;
        target.put(event).await.map_err(|e| PeError::Emit {
            stream: stream.to_string(),
            reason: e.to_string(),
        })
    }
}
