//! Runtime counters for production observability.
//!
//! A single [`RuntimeMetrics`] handle is created per application and passed
//! explicitly to the sender, receiver, streams, prototypes and the
//! checkpointing pipeline. Nothing is recorded through process-wide state, so
//! two applications in one process keep separate numbers.
//!
//! # Example
//!
//! ```rust
//! use s4rs::metrics::RuntimeMetrics;
//! use std::sync::Arc;
//!
//! let metrics = Arc::new(RuntimeMetrics::new());
//! metrics.sent_local();
//! metrics.sent_remote(2);
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.events_sent_local, 1);
//! assert_eq!(snapshot.events_sent_remote.get(&2), Some(&1));
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by every runtime component of one application.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    events_sent_local: AtomicU64,
    events_sent_remote: Mutex<BTreeMap<usize, u64>>,
    events_received: AtomicU64,
    bytes_received: AtomicU64,
    events_unroutable: AtomicU64,
    events_lost: AtomicU64,
    events_shed: AtomicU64,
    handler_errors: AtomicU64,
    instances_created: AtomicU64,
    instance_creation_failures: AtomicU64,
    checkpoints_requested: AtomicU64,
    serialization_rejections: AtomicU64,
    storage_ran_on_caller: AtomicU64,
    checkpoints_stored: AtomicU64,
    checkpoint_failures: AtomicU64,
    fetches_succeeded: AtomicU64,
    fetches_failed: AtomicU64,
    fetches_short_circuited: AtomicU64,
}

/// Point-in-time copy of [`RuntimeMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Events whose destination was the local partition.
    pub events_sent_local: u64,
    /// Events handed to the transport, per destination partition.
    pub events_sent_remote: BTreeMap<usize, u64>,
    /// Messages received from the transport.
    pub events_received: u64,
    /// Bytes received from the transport.
    pub bytes_received: u64,
    /// Received messages dropped because no stream matched.
    pub events_unroutable: u64,
    /// Events lost to failed or interrupted sends, or to decode errors.
    pub events_lost: u64,
    /// Events dropped because a shedding stream's queue was full.
    pub events_shed: u64,
    /// Handler invocations that returned an error.
    pub handler_errors: u64,
    /// Processing element instances created.
    pub instances_created: u64,
    /// Instance creations aborted by the creation hook.
    pub instance_creation_failures: u64,
    /// Checkpoint requests submitted.
    pub checkpoints_requested: u64,
    /// Checkpoint requests rejected because the serialization queue was full.
    pub serialization_rejections: u64,
    /// Storage tasks executed on the submitting worker because the queue was full.
    pub storage_ran_on_caller: u64,
    /// Checkpoints the backend reported as stored.
    pub checkpoints_stored: u64,
    /// Checkpoint requests that ended in failure.
    pub checkpoint_failures: u64,
    /// Successful state fetches.
    pub fetches_succeeded: u64,
    /// Failed or timed-out state fetches.
    pub fetches_failed: u64,
    /// Fetches answered "absent" while fetching was disabled.
    pub fetches_short_circuited: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RuntimeMetrics {
    /// Creates a zeroed set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an event that skipped the network.
    pub fn sent_local(&self) {
        bump(&self.events_sent_local);
    }

    /// Records an event handed to the transport for `partition`.
    pub fn sent_remote(&self, partition: usize) {
        *self.events_sent_remote.lock().entry(partition).or_insert(0) += 1;
    }

    /// Records a message received from the transport.
    pub fn received(&self, bytes: usize) {
        bump(&self.events_received);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Records a received message that matched no stream.
    pub fn unroutable(&self) {
        bump(&self.events_unroutable);
    }

    /// Records an event that was lost.
    pub fn lost(&self) {
        bump(&self.events_lost);
    }

    /// Records an event dropped by a full shedding queue.
    pub fn shed(&self) {
        bump(&self.events_shed);
    }

    /// Records a failed handler invocation.
    pub fn handler_error(&self) {
        bump(&self.handler_errors);
    }

    /// Records a created instance.
    pub fn instance_created(&self) {
        bump(&self.instances_created);
    }

    /// Records an aborted instance creation.
    pub fn instance_creation_failed(&self) {
        bump(&self.instance_creation_failures);
    }

    /// Records a checkpoint request.
    pub fn checkpoint_requested(&self) {
        bump(&self.checkpoints_requested);
    }

    /// Records a serialization task rejected by a full queue.
    pub fn serialization_rejected(&self) {
        bump(&self.serialization_rejections);
    }

    /// Records a storage task run by the submitting worker.
    pub fn storage_on_caller(&self) {
        bump(&self.storage_ran_on_caller);
    }

    /// Records a stored checkpoint.
    pub fn checkpoint_stored(&self) {
        bump(&self.checkpoints_stored);
    }

    /// Records a failed checkpoint.
    pub fn checkpoint_failed(&self) {
        bump(&self.checkpoint_failures);
    }

    /// Records a successful fetch.
    pub fn fetch_succeeded(&self) {
        bump(&self.fetches_succeeded);
    }

    /// Records a failed fetch.
    pub fn fetch_failed(&self) {
        bump(&self.fetches_failed);
    }

    /// Records a fetch skipped by the circuit breaker.
    pub fn fetch_short_circuited(&self) {
        bump(&self.fetches_short_circuited);
    }

    /// Returns a copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            events_sent_local: load(&self.events_sent_local),
            events_sent_remote: self.events_sent_remote.lock().clone(),
            events_received: load(&self.events_received),
            bytes_received: load(&self.bytes_received),
            events_unroutable: load(&self.events_unroutable),
            events_lost: load(&self.events_lost),
            events_shed: load(&self.events_shed),
            handler_errors: load(&self.handler_errors),
            instances_created: load(&self.instances_created),
            instance_creation_failures: load(&self.instance_creation_failures),
            checkpoints_requested: load(&self.checkpoints_requested),
            serialization_rejections: load(&self.serialization_rejections),
            storage_ran_on_caller: load(&self.storage_ran_on_caller),
            checkpoints_stored: load(&self.checkpoints_stored),
            checkpoint_failures: load(&self.checkpoint_failures),
            fetches_succeeded: load(&self.fetches_succeeded),
            fetches_failed: load(&self.fetches_failed),
            fetches_short_circuited: load(&self.fetches_short_circuited),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_sends_are_tracked_per_partition() {
        let metrics = RuntimeMetrics::new();
        metrics.sent_remote(1);
        metrics.sent_remote(1);
        metrics.sent_remote(3);
        metrics.received(10);
        metrics.received(5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_sent_remote.get(&1), Some(&2));
        assert_eq!(snapshot.events_sent_remote.get(&3), Some(&1));
        assert_eq!(snapshot.events_received, 2);
        assert_eq!(snapshot.bytes_received, 15);
    }

    #[test]
    fn snapshot_serializes() {
        let metrics = RuntimeMetrics::new();
        metrics.fetch_short_circuited();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["fetches_short_circuited"], 1);
    }
}
