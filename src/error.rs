//! # Runtime errors
//!
//! Each subsystem has its own error enum; [`RuntimeError`] wraps them for the
//! application-level operations in [`crate::app`]:
//!
//! - **ConfigError**: configuration parsing and validation
//! - **CommError**: partition assignment and transport
//! - **StreamError**: putting events on streams
//! - **PeError**: instance creation and handlers
//! - **CheckpointError** / **StorageError**: checkpointing
//!
//! Errors raised while dispatching events or checkpointing state are logged
//! and counted rather than returned; they only surface through this type when
//! an application call is directly responsible for them.

use thiserror::Error;

use crate::checkpoint::{CheckpointError, StorageError};
use crate::comm::CommError;
use crate::config::ConfigError;
use crate::pe::PeError;
use crate::stream::StreamError;

/// Error type for application lifecycle operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Assignment or transport failure.
    #[error(transparent)]
    Comm(#[from] CommError),
    /// Stream failure.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Processing element failure.
    #[error(transparent)]
    Pe(#[from] PeError),
    /// Checkpointing failure.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    /// Storage backend failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The application graph is inconsistent.
    #[error("invalid application graph: {0}")]
    Graph(String),
    /// The application is not in a state that allows the call.
    #[error("application is {0}")]
    Lifecycle(&'static str),
}
