//! In-process transport and assignment.
//!
//! [`LoopbackNetwork`] wires a fixed number of partitions together with
//! bounded channels and records every emission, which is enough to run
//! several partitions of one application inside a single process and to
//! observe routing decisions in tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use super::{Assignment, CommError, Emitter, Listener, PartitionDescriptor};

struct NetworkInner {
    links: Vec<mpsc::Sender<Bytes>>,
    inboxes: Mutex<Vec<Option<mpsc::Receiver<Bytes>>>>,
    sent: Mutex<Vec<(usize, Bytes)>>,
    interrupted: Mutex<HashSet<usize>>,
}

/// A set of partitions connected by bounded in-memory links.
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    /// Creates `partition_count` links, each buffering up to `capacity`
    /// messages before senders wait.
    pub fn new(partition_count: usize, capacity: usize) -> Self {
        let (links, inboxes) = (0..partition_count)
            .map(|_| {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (tx, Some(rx))
            })
            .unzip();
        Self {
            inner: Arc::new(NetworkInner {
                links,
                inboxes: Mutex::new(inboxes),
                sent: Mutex::new(Vec::new()),
                interrupted: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Number of partitions in the network.
    pub fn partition_count(&self) -> usize {
        self.inner.links.len()
    }

    /// Returns an emitter that can reach every partition.
    pub fn emitter(&self) -> LoopbackEmitter {
        LoopbackEmitter {
            inner: self.inner.clone(),
        }
    }

    /// Takes the listener of `partition`. Each listener can be taken once.
    pub fn listener(&self, partition: usize) -> Option<LoopbackListener> {
        let rx = self.inner.inboxes.lock().get_mut(partition)?.take()?;
        Some(LoopbackListener {
            partition,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// Every `(partition, frame)` emitted so far, in emission order.
    pub fn sent(&self) -> Vec<(usize, Bytes)> {
        self.inner.sent.lock().clone()
    }

    /// Makes every later send to `partition` fail as interrupted.
    pub fn interrupt(&self, partition: usize) {
        self.inner.interrupted.lock().insert(partition);
    }
}

/// Emitter half of a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackEmitter {
    inner: Arc<NetworkInner>,
}

#[async_trait]
impl Emitter for LoopbackEmitter {
    async fn send(&self, partition: usize, message: Bytes) -> Result<(), CommError> {
        let link = self
            .inner
            .links
            .get(partition)
            .ok_or(CommError::UnknownPartition {
                partition,
                partition_count: self.inner.links.len(),
            })?;
        if self.inner.interrupted.lock().contains(&partition) {
            return Err(CommError::Interrupted { partition });
        }
        self.inner.sent.lock().push((partition, message.clone()));
        link.send(message)
            .await
            .map_err(|_| CommError::Transport(format!("partition {} is not listening", partition)))
    }

    fn partition_count(&self) -> usize {
        self.inner.links.len()
    }
}

/// Listener half of a [`LoopbackNetwork`], bound to one partition.
pub struct LoopbackListener {
    partition: usize,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

#[async_trait]
impl Listener for LoopbackListener {
    async fn receive(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }

    fn partition(&self) -> usize {
        self.partition
    }
}

/// Fixed partition assignment, changeable at runtime to simulate topology
/// changes.
pub struct StaticAssignment {
    descriptor: Mutex<PartitionDescriptor>,
    epoch: watch::Sender<u64>,
}

impl StaticAssignment {
    /// Assigns `partition` out of `partition_count`.
    pub fn new(partition: usize, partition_count: usize) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            descriptor: Mutex::new(PartitionDescriptor {
                partition,
                partition_count,
            }),
            epoch,
        }
    }

    /// Moves this process to another partition and bumps the topology epoch.
    pub fn reassign(&self, partition: usize, partition_count: usize) {
        *self.descriptor.lock() = PartitionDescriptor {
            partition,
            partition_count,
        };
        self.epoch.send_modify(|epoch| *epoch += 1);
    }
}

#[async_trait]
impl Assignment for StaticAssignment {
    async fn assign_local_partition(&self) -> Result<PartitionDescriptor, CommError> {
        let descriptor = *self.descriptor.lock();
        if descriptor.partition >= descriptor.partition_count {
            return Err(CommError::Assignment(format!(
                "partition {} out of range (partition count {})",
                descriptor.partition, descriptor.partition_count
            )));
        }
        Ok(descriptor)
    }

    fn watch_topology(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_reach_the_addressed_listener() {
        let network = LoopbackNetwork::new(2, 4);
        let listener = network.listener(1).unwrap();
        assert!(network.listener(1).is_none());

        network.emitter().send(1, Bytes::from_static(b"hi")).await.unwrap();

        assert_eq!(listener.receive().await.unwrap(), Bytes::from_static(b"hi"));
        assert_eq!(listener.partition(), 1);
        assert_eq!(network.sent().len(), 1);
    }

    #[tokio::test]
    async fn out_of_range_partition_is_rejected() {
        let network = LoopbackNetwork::new(2, 4);
        let err = network.emitter().send(5, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, CommError::UnknownPartition { partition: 5, partition_count: 2 }));
    }

    #[tokio::test]
    async fn interrupted_partition_fails_sends() {
        let network = LoopbackNetwork::new(2, 4);
        network.interrupt(0);
        let err = network.emitter().send(0, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, CommError::Interrupted { partition: 0 }));
        assert!(network.sent().is_empty());
    }

    #[tokio::test]
    async fn reassignment_bumps_the_epoch() {
        let assignment = StaticAssignment::new(0, 2);
        let mut topology = assignment.watch_topology();
        assignment.reassign(1, 2);
        assert!(topology.has_changed().unwrap());
        assert_eq!(*topology.borrow_and_update(), 1);
        assert_eq!(assignment.assign_local_partition().await.unwrap().partition, 1);
    }

    #[tokio::test]
    async fn invalid_assignment_is_an_error() {
        let assignment = StaticAssignment::new(3, 2);
        assert!(matches!(
            assignment.assign_local_partition().await,
            Err(CommError::Assignment(_))
        ));
    }
}
