//! Asynchronous checkpointing of processing element state.
//!
//! A checkpoint request moves through
//! `Requested → Serializing → Serialized → Storing → Succeeded | Failed`.
//! Serialization and storage run on separate bounded [`pool::WorkerPool`]s
//! owned by the [`SafeKeeper`]; fetches run on a third pool guarded by a
//! [`FetchCircuitBreaker`]. Failures never reach the event-processing path:
//! they are reported through a [`StorageCallback`], the request's
//! [`CheckpointHandle`] and the log.

pub mod breaker;
pub mod pool;
pub mod safe_keeper;
pub mod storage;

pub use breaker::FetchCircuitBreaker;
pub use pool::{OverflowPolicy, PoolError, Submitted, WorkerPool};
pub use safe_keeper::{Checkpointable, SafeKeeper};
pub use storage::{FileSystemStateStorage, InMemoryStateStorage, StateStorage, StorageError};

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

/// Error type for checkpoint requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    /// The serialization queue was full; the request was dropped.
    #[error("serialization queue is full (capacity {capacity})")]
    QueueFull {
        /// Capacity of the serialization queue.
        capacity: usize,
    },
    /// The instance lock could not be taken in time.
    #[error("instance lock not acquired within {0:?}")]
    LockTimeout(Duration),
    /// The instance state could not be serialized or restored.
    #[error("state serialization error: {0}")]
    Serialization(String),
    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(String),
    /// The pipeline is shut down.
    #[error("checkpointing is shut down")]
    Shutdown,
    /// A string did not parse as a [`CheckpointId`].
    #[error("malformed checkpoint id: {0}")]
    MalformedId(String),
}

impl From<StorageError> for CheckpointError {
    fn from(e: StorageError) -> Self {
        CheckpointError::Storage(e.to_string())
    }
}

/// Separates the prototype and key parts of a checkpoint id string. The
/// prototype part must not contain it.
pub const CHECKPOINT_ID_SEPARATOR: &str = "];[";

static CHECKPOINT_ID_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^\[(.*?)\];\[(.*)\]$"));

/// Storage key of one processing element instance.
///
/// The string form is `[prototype];[key]`; an empty component means the
/// component is absent (singleton instances have an empty key). Keys may
/// contain anything; prototype names may not contain
/// [`CHECKPOINT_ID_SEPARATOR`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointId {
    /// Name of the prototype the instance belongs to.
    pub prototype_id: String,
    /// Instance key.
    pub key: String,
}

impl CheckpointId {
    /// Creates a checkpoint id.
    pub fn new(prototype_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            prototype_id: prototype_id.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}];[{}]", self.prototype_id, self.key)
    }
}

impl FromStr for CheckpointId {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pattern = CHECKPOINT_ID_PATTERN
            .as_ref()
            .map_err(|e| CheckpointError::MalformedId(e.to_string()))?;
        let captures = pattern
            .captures(s)
            .ok_or_else(|| CheckpointError::MalformedId(s.to_string()))?;
        let part = |i| captures.get(i).map_or("", |m| m.as_str());
        Ok(Self::new(part(1), part(2)))
    }
}

/// When instances of a prototype are checkpointed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointingMode {
    /// Never.
    #[default]
    Disabled,
    /// After every `frequency` events, when dirty.
    EventCount,
    /// Every `frequency` time units, for dirty instances.
    Time,
}

/// Unit of a time-interval checkpointing frequency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    /// Milliseconds.
    #[default]
    Milliseconds,
    /// Seconds.
    Seconds,
    /// Minutes.
    Minutes,
}

impl TimeUnit {
    fn duration(self, amount: u64) -> Duration {
        match self {
            TimeUnit::Milliseconds => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Minutes => Duration::from_secs(amount.saturating_mul(60)),
        }
    }
}

/// Checkpointing policy of a prototype, inherited by its instances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointingConfig {
    /// Policy mode.
    pub mode: CheckpointingMode,
    /// Events between checkpoints, or time units between sweeps.
    pub frequency: u64,
    /// Unit of `frequency` in [`CheckpointingMode::Time`].
    pub time_unit: TimeUnit,
}

impl CheckpointingConfig {
    /// Checkpointing turned off.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Checkpoint a dirty instance after every `frequency` events.
    pub fn every_events(frequency: u64) -> Self {
        Self {
            mode: CheckpointingMode::EventCount,
            frequency,
            time_unit: TimeUnit::default(),
        }
    }

    /// Sweep dirty instances every `frequency` units of `time_unit`.
    pub fn every(frequency: u64, time_unit: TimeUnit) -> Self {
        Self {
            mode: CheckpointingMode::Time,
            frequency,
            time_unit,
        }
    }

    /// Whether checkpointing is on.
    pub fn is_enabled(&self) -> bool {
        self.mode != CheckpointingMode::Disabled && self.frequency > 0
    }

    /// Sweep period in time mode.
    pub fn interval(&self) -> Option<Duration> {
        match self.mode {
            CheckpointingMode::Time if self.frequency > 0 => {
                Some(self.time_unit.duration(self.frequency))
            }
            _ => None,
        }
    }

    /// Whether an instance that processed `event_count` events should be
    /// checkpointed right after its latest event.
    pub fn is_checkpointable(&self, event_count: u64, dirty: bool) -> bool {
        self.mode == CheckpointingMode::EventCount
            && self.frequency > 0
            && dirty
            && event_count % self.frequency == 0
    }
}

/// Progress of one checkpoint request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckpointStatus {
    /// Accepted, waiting for a serialization worker.
    Requested,
    /// A worker is snapshotting the instance.
    Serializing,
    /// Snapshot taken, waiting for a storage worker.
    Serialized,
    /// The backend is writing the snapshot.
    Storing,
    /// The backend stored the snapshot.
    Succeeded,
    /// The request failed.
    Failed(CheckpointError),
}

impl CheckpointStatus {
    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckpointStatus::Succeeded | CheckpointStatus::Failed(_))
    }
}

/// Observes a checkpoint request.
#[derive(Clone, Debug)]
pub struct CheckpointHandle {
    id: CheckpointId,
    status: watch::Receiver<CheckpointStatus>,
}

impl CheckpointHandle {
    pub(crate) fn new(id: CheckpointId, status: watch::Receiver<CheckpointStatus>) -> Self {
        Self { id, status }
    }

    /// Checkpoint being written.
    pub fn id(&self) -> &CheckpointId {
        &self.id
    }

    /// Latest status.
    pub fn status(&self) -> CheckpointStatus {
        self.status.borrow().clone()
    }

    /// Waits for a terminal status.
    ///
    /// If the pipeline drops the request without finishing it, the request
    /// is reported as shut down.
    pub async fn wait(mut self) -> CheckpointStatus {
        let outcome = self
            .status
            .wait_for(CheckpointStatus::is_terminal)
            .await
            .map(|status| status.clone());
        match outcome {
            Ok(status) => status,
            Err(_) => {
                let last = self.status.borrow().clone();
                if last.is_terminal() {
                    last
                } else {
                    CheckpointStatus::Failed(CheckpointError::Shutdown)
                }
            }
        }
    }
}

/// Outcome reported to a [`StorageCallback`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageResultCode {
    /// The checkpoint was stored.
    Success,
    /// The checkpoint was not stored.
    Failure,
}

/// Receives the outcome of every checkpoint request.
pub trait StorageCallback: Send + Sync {
    /// Called once per request with its outcome and a description.
    fn storage_operation_result(&self, id: &CheckpointId, code: StorageResultCode, message: &str);
}

/// Logs checkpoint outcomes: successes at info, failures at error.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingStorageCallback;

impl StorageCallback for LoggingStorageCallback {
    fn storage_operation_result(&self, id: &CheckpointId, code: StorageResultCode, message: &str) {
        match code {
            StorageResultCode::Success => info!(checkpoint_id = %id, "checkpoint stored"),
            StorageResultCode::Failure => {
                error!(checkpoint_id = %id, reason = message, "checkpoint failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_id_string_form_round_trips() {
        let id = CheckpointId::new("counter", "user^42");
        assert_eq!(id.to_string(), "[counter];[user^42]");
        assert_eq!("[counter];[user^42]".parse::<CheckpointId>().unwrap(), id);
    }

    #[test]
    fn empty_components_are_allowed() {
        let id: CheckpointId = "[counter];[]".parse().unwrap();
        assert_eq!(id, CheckpointId::new("counter", ""));
        let id: CheckpointId = "[];[k]".parse().unwrap();
        assert_eq!(id.prototype_id, "");
    }

    #[test]
    fn key_may_contain_brackets() {
        let id = CheckpointId::new("p", "a];[b");
        assert_eq!(id.to_string().parse::<CheckpointId>().unwrap(), id);
    }

    #[test]
    fn prototype_with_separator_does_not_round_trip() {
        let id = CheckpointId::new("a];[b", "k");
        assert_ne!(id.to_string().parse::<CheckpointId>().unwrap(), id);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            "counter:42".parse::<CheckpointId>(),
            Err(CheckpointError::MalformedId(_))
        ));
    }

    #[test]
    fn event_count_policy_requires_dirty_and_multiple() {
        let config = CheckpointingConfig::every_events(3);
        assert!(!config.is_checkpointable(1, true));
        assert!(config.is_checkpointable(3, true));
        assert!(!config.is_checkpointable(3, false));
        assert!(config.is_checkpointable(6, true));
        assert_eq!(config.interval(), None);
    }

    #[test]
    fn disabled_and_time_modes_never_fire_per_event() {
        assert!(!CheckpointingConfig::disabled().is_checkpointable(10, true));
        assert!(!CheckpointingConfig::disabled().is_enabled());
        let time = CheckpointingConfig::every(2, TimeUnit::Seconds);
        assert!(!time.is_checkpointable(2, true));
        assert_eq!(time.interval(), Some(Duration::from_secs(2)));
        assert!(time.is_enabled());
    }

    #[test]
    fn zero_frequency_is_disabled() {
        assert!(!CheckpointingConfig::every_events(0).is_enabled());
        assert!(!CheckpointingConfig::every_events(0).is_checkpointable(0, true));
    }

    #[tokio::test]
    async fn handle_reports_dropped_request_as_shutdown() {
        let (tx, rx) = watch::channel(CheckpointStatus::Requested);
        let handle = CheckpointHandle::new(CheckpointId::new("p", "k"), rx);
        drop(tx);
        assert_eq!(
            handle.wait().await,
            CheckpointStatus::Failed(CheckpointError::Shutdown)
        );
    }
}
