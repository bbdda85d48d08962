//! Communication boundary between partitions.
//!
//! The runtime depends on three narrow collaborators: an [`Emitter`] that
//! delivers bytes to a partition, a [`Listener`] that yields bytes addressed to
//! this partition, and an [`Assignment`] service that tells this process which
//! partition it owns. [`Sender`](sender::Sender) and
//! [`Receiver`](receiver::Receiver) sit on top of them and make the local vs.
//! remote decision. [`loopback`] provides in-process implementations.

pub mod loopback;
pub mod receiver;
pub mod sender;

pub use loopback::{LoopbackEmitter, LoopbackListener, LoopbackNetwork, StaticAssignment};
pub use receiver::{Enqueued, InboxClosed, Receiver, StreamInbox};
pub use sender::Sender;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::codec::CodecError;

/// Communication errors.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// A blocking send was interrupted; the event is lost.
    #[error("send to partition {partition} interrupted")]
    Interrupted {
        /// Destination partition.
        partition: usize,
    },
    /// The destination partition does not exist.
    #[error("partition {partition} out of range (partition count {partition_count})")]
    UnknownPartition {
        /// Requested partition.
        partition: usize,
        /// Current partition count.
        partition_count: usize,
    },
    /// No partition could be assigned to this process.
    #[error("partition assignment failed: {0}")]
    Assignment(String),
    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// Encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// The partition owned by this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PartitionDescriptor {
    /// Index of the owned partition.
    pub partition: usize,
    /// Partition count at assignment time.
    pub partition_count: usize,
}

/// Outbound half of the network transport.
#[async_trait]
pub trait Emitter: Send + Sync {
    /// Delivers `message` to `partition`. May block on a congested link.
    async fn send(&self, partition: usize, message: Bytes) -> Result<(), CommError>;

    /// Current number of partitions.
    fn partition_count(&self) -> usize;
}

/// Inbound half of the network transport.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Waits for the next message; `None` once the transport is closed.
    async fn receive(&self) -> Option<Bytes>;

    /// Partition this listener serves.
    fn partition(&self) -> usize;
}

/// Cluster membership and partition assignment.
#[async_trait]
pub trait Assignment: Send + Sync {
    /// Blocks until this process owns a partition.
    async fn assign_local_partition(&self) -> Result<PartitionDescriptor, CommError>;

    /// Topology epoch; it changes whenever partitions or their owners change.
    fn watch_topology(&self) -> watch::Receiver<u64>;
}
