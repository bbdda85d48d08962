//! Outbound routing: local short-circuit or network emission.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use tracing::{debug, error, info};

use super::{Assignment, CommError, Emitter, PartitionDescriptor};
use crate::codec::SerializerDeserializer;
use crate::event::{Event, EventMessage};
use crate::metrics::RuntimeMetrics;
use crate::partitioning::{Hasher, partition_for};

/// Decides, per outgoing event, whether the destination partition is local.
///
/// The local partition is resolved lazily through the [`Assignment`] service
/// and cached until the topology epoch changes.
pub struct Sender<E> {
    emitter: Arc<dyn Emitter>,
    serdes: Arc<dyn SerializerDeserializer<E>>,
    hasher: Arc<dyn Hasher>,
    assignment: Arc<dyn Assignment>,
    local: RwLock<Option<PartitionDescriptor>>,
    topology: Mutex<watch::Receiver<u64>>,
    metrics: Arc<RuntimeMetrics>,
}

impl<E: Event> Sender<E> {
    /// Creates a sender. No partition is resolved until first use.
    pub fn new(
        emitter: Arc<dyn Emitter>,
        serdes: Arc<dyn SerializerDeserializer<E>>,
        hasher: Arc<dyn Hasher>,
        assignment: Arc<dyn Assignment>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        let topology = assignment.watch_topology();
        Self {
            emitter,
            serdes,
            hasher,
            assignment,
            local: RwLock::new(None),
            topology: Mutex::new(topology),
            metrics,
        }
    }

    /// Returns the local partition, asking the assignment service when the
    /// cache is empty or the topology changed since it was filled.
    pub async fn resolve_local_partition(&self) -> Result<PartitionDescriptor, CommError> {
        if self.topology_changed() {
            self.local.write().await.take();
        }
        if let Some(descriptor) = *self.local.read().await {
            return Ok(descriptor);
        }

        let mut local = self.local.write().await;
        if let Some(descriptor) = *local {
            return Ok(descriptor);
        }
        let descriptor = self.assignment.assign_local_partition().await?;
        info!(
            partition = descriptor.partition,
            partition_count = descriptor.partition_count,
            "resolved local partition"
        );
        *local = Some(descriptor);
        Ok(descriptor)
    }

    /// Drops the cached local partition; the next send resolves it again.
    pub async fn invalidate_local_partition(&self) {
        self.local.write().await.take();
    }

    fn topology_changed(&self) -> bool {
        let mut topology = self.topology.lock();
        match topology.has_changed() {
            Ok(true) => {
                let epoch = *topology.borrow_and_update();
                debug!(epoch, "topology changed, local partition invalidated");
                true
            }
            // A closed watch means no further changes can arrive.
            Ok(false) | Err(_) => false,
        }
    }

    /// Number of partitions currently known to the transport.
    pub fn partition_count(&self) -> usize {
        self.emitter.partition_count()
    }

    /// Partition index for a routing key.
    pub fn partition_for_key(&self, key: &str) -> usize {
        partition_for(self.hasher.hash(key), self.emitter.partition_count())
    }

    /// Routes a keyed event.
    ///
    /// Returns `true` when `hash(key) mod partition_count` is the local
    /// partition; nothing touches the network and the caller must deliver
    /// locally. Otherwise the event is serialized and emitted to its
    /// partition and `false` is returned. Transport failures are logged and
    /// counted as lost events, they are not returned.
    pub async fn send_and_check_if_local(&self, key: &str, event: &E) -> Result<bool, CommError> {
        let partition = self.partition_for_key(key);
        let local = self.resolve_local_partition().await?;
        if partition == local.partition {
            self.metrics.sent_local();
            return Ok(true);
        }

        let message = self.envelope(event)?;
        self.emit(partition, message, event).await;
        Ok(false)
    }

    /// Emits a broadcast event to every partition except the local one.
    ///
    /// The event is serialized once; every emission shares the same buffer.
    /// Returns the number of partitions the event was handed to.
    pub async fn send_to_all_remote_partitions(&self, event: &E) -> Result<usize, CommError> {
        let local = self.resolve_local_partition().await?;
        let partition_count = self.emitter.partition_count();
        if partition_count <= 1 {
            return Ok(0);
        }

        let message = self.envelope(event)?;
        let mut emitted = 0;
        for partition in (0..partition_count).filter(|p| *p != local.partition) {
            match self.emitter.send(partition, message.clone()).await {
                Ok(()) => {
                    self.metrics.sent_remote(partition);
                    emitted += 1;
                }
                Err(CommError::Interrupted { partition }) => {
                    // Interrupted: the remaining partitions are skipped too.
                    self.metrics.lost();
                    error!(
                        stream = event.stream_name(),
                        partition,
                        "interrupted blocking send, broadcast event is lost"
                    );
                    break;
                }
                Err(e) => {
                    self.metrics.lost();
                    error!(
                        stream = event.stream_name(),
                        partition,
                        error = %e,
                        "cannot emit broadcast event, event is lost"
                    );
                }
            }
        }
        Ok(emitted)
    }

    fn envelope(&self, event: &E) -> Result<Bytes, CommError> {
        let payload = self.serdes.serialize(event)?;
        Ok(EventMessage::new(event.app_id(), event.stream_name(), payload).encode()?)
    }

    async fn emit(&self, partition: usize, message: Bytes, event: &E) {
        match self.emitter.send(partition, message).await {
            Ok(()) => self.metrics.sent_remote(partition),
            Err(e) => {
                self.metrics.lost();
                error!(
                    stream = event.stream_name(),
                    partition,
                    error = %e,
                    "cannot emit event, event is lost"
                );
            }
        }
    }
}
