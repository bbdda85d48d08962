//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration. Durations are expressed in milliseconds.
//!
//! ```rust
//! use s4rs::config::{QueueOverflow, RuntimeConfig};
//!
//! let config = RuntimeConfig::from_json_str(r#"{ "stream": { "queue_capacity": 64 } }"#).unwrap();
//! assert_eq!(config.stream.queue_capacity, 64);
//! assert_eq!(config.stream.overflow, QueueOverflow::Block);
//! assert_eq!(config.checkpointing.fetching_max_consecutive_failures, 10);
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Error type for loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration is not valid JSON for [`RuntimeConfig`].
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Stream queueing.
    pub stream: StreamSettings,
    /// Checkpointing pools, timeouts and circuit breaker.
    pub checkpointing: CheckpointingSettings,
    /// Log output.
    pub logging: LoggingConfig,
}

/// What a stream does with an event that arrives while its queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOverflow {
    /// Wait for room. Producers slow down to the delivery rate.
    #[default]
    Block,
    /// Drop the event and count it in `events_shed`.
    Shed,
}

/// Stream settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Capacity of each stream's local queue.
    pub queue_capacity: usize,
    /// Full-queue behavior, for local puts and received events alike.
    pub overflow: QueueOverflow,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            overflow: QueueOverflow::Block,
        }
    }
}

/// Checkpointing pipeline settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointingSettings {
    /// Workers serializing instance state.
    pub serialization_max_threads: usize,
    /// Queued serialization tasks before new requests are rejected.
    pub serialization_max_outstanding_requests: usize,
    /// How long a serialization task waits for the instance lock.
    pub serialization_wait_ms: u64,
    /// Workers writing to the storage backend.
    pub storage_max_threads: usize,
    /// Queued storage tasks before they run on the submitting worker.
    pub storage_max_outstanding_requests: usize,
    /// Workers fetching state from the backend.
    pub fetching_max_threads: usize,
    /// Queued fetch tasks.
    pub fetching_queue_size: usize,
    /// How long a caller waits for a fetch.
    pub fetching_max_wait_ms: u64,
    /// Consecutive fetch failures that disable fetching.
    pub fetching_max_consecutive_failures: u32,
    /// How long fetching stays disabled.
    pub fetching_disabled_duration_ms: u64,
}

impl Default for CheckpointingSettings {
    fn default() -> Self {
        Self {
            serialization_max_threads: 1,
            serialization_max_outstanding_requests: 1000,
            serialization_wait_ms: 1000,
            storage_max_threads: 1,
            storage_max_outstanding_requests: 1000,
            fetching_max_threads: 1,
            fetching_queue_size: 100,
            fetching_max_wait_ms: 1000,
            fetching_max_consecutive_failures: 10,
            fetching_disabled_duration_ms: 600_000,
        }
    }
}

impl CheckpointingSettings {
    /// Lock wait of a serialization task.
    pub fn serialization_wait(&self) -> Duration {
        Duration::from_millis(self.serialization_wait_ms)
    }

    /// Fetch timeout.
    pub fn fetching_max_wait(&self) -> Duration {
        Duration::from_millis(self.fetching_max_wait_ms)
    }

    /// Breaker cooldown.
    pub fn fetching_disabled_duration(&self) -> Duration {
        Duration::from_millis(self.fetching_disabled_duration_ms)
    }
}

/// Log output settings, see [`crate::logging`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive, used when `RUST_LOG` is unset.
    pub filter: String,
    /// Whether to colorize output.
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            ansi: true,
        }
    }
}

impl RuntimeConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks that capacities, thread counts and thresholds are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.checkpointing;
        let positive = [
            ("stream.queue_capacity", self.stream.queue_capacity),
            ("checkpointing.serialization_max_threads", c.serialization_max_threads),
            (
                "checkpointing.serialization_max_outstanding_requests",
                c.serialization_max_outstanding_requests,
            ),
            ("checkpointing.storage_max_threads", c.storage_max_threads),
            (
                "checkpointing.storage_max_outstanding_requests",
                c.storage_max_outstanding_requests,
            ),
            ("checkpointing.fetching_max_threads", c.fetching_max_threads),
            ("checkpointing.fetching_queue_size", c.fetching_queue_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }
        if c.fetching_max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(
                "checkpointing.fetching_max_consecutive_failures must be greater than zero"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
