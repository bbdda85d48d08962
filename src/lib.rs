//! # s4rs
//!
//! Partitioned stream processing with keyed processing elements.
//!
//! An application declares *prototypes* (processing element types) and
//! *streams* connecting them. Every event put on a keyed stream is routed to
//! the partition that owns its key and, there, to the one instance of each
//! target prototype bound to that key. Broadcast streams reach every
//! partition exactly once.
//!
//! ## Key Features
//!
//! - **Keyed instances**: created on first use, evicted by capacity or idleness
//! - **Triggers and timers**: per-kind event-count and interval triggers,
//!   periodic callbacks
//! - **Bounded streams**: one ordered delivery queue per stream that either
//!   blocks producers or sheds events when full
//! - **Sliding windows**: periodic or counted slots kept per instance
//! - **Asynchronous checkpointing**: bounded serialization and storage pools,
//!   recovery when an instance is created and a circuit breaker around state
//!   fetches
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use s4rs::app::{AppBuilder, Transport};
//! use s4rs::comm::LoopbackNetwork;
//! use s4rs::config::RuntimeConfig;
//! # async fn run<E: s4rs::event::Event>() -> Result<(), s4rs::error::RuntimeError> {
//! let network = LoopbackNetwork::new(1, 1024);
//! let transport = Transport::loopback(&network, 0).expect("listener");
//! let app = AppBuilder::<E>::new(1, RuntimeConfig::default(), transport)?.build()?;
//! app.start().await?;
//! app.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Application assembly and lifecycle.
pub mod app;
/// Checkpoint ids, policies, storage backends and the checkpointing pipeline.
pub mod checkpoint;
/// Event serialization.
pub mod codec;
/// Partition assignment, outbound sender and inbound receiver.
pub mod comm;
/// Runtime configuration.
pub mod config;
/// Application-level error type.
pub mod error;
/// Events, event kinds and the wire envelope.
pub mod event;
/// Tracing subscriber setup.
pub mod logging;
/// Runtime counters.
pub mod metrics;
/// Key extraction and key-to-partition hashing.
pub mod partitioning;
/// Processing elements, prototypes and triggers.
pub mod pe;
/// Streams and local delivery.
pub mod stream;

pub use app::{App, AppBuilder, Transport};
pub use error::RuntimeError;
pub use event::{Event, EventHeader, EventKind};
pub use pe::{PeContext, PeError, ProcessingElement, Prototype, PrototypeConfig};
