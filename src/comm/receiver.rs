//! Inbound routing from the transport to local streams.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::Listener;
use crate::config::QueueOverflow;
use crate::event::EventMessage;
use crate::metrics::RuntimeMetrics;

/// Outcome of [`StreamInbox::push`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// The message is queued for delivery.
    Accepted,
    /// The queue was full and the message was dropped.
    Shed,
}

/// Queue handle of one stream, shared by local puts and the [`Receiver`].
#[derive(Clone, Debug)]
pub struct StreamInbox {
    tx: mpsc::Sender<EventMessage>,
    overflow: QueueOverflow,
}

impl StreamInbox {
    /// Wraps the sending half of a stream queue.
    pub fn new(tx: mpsc::Sender<EventMessage>, overflow: QueueOverflow) -> Self {
        Self { tx, overflow }
    }

    /// Full-queue behavior of this inbox.
    pub fn overflow(&self) -> QueueOverflow {
        self.overflow
    }

    /// Queues `message`, waiting for room or dropping it when the queue is
    /// full depending on the overflow policy. Fails once the queue is closed.
    pub async fn push(&self, message: EventMessage) -> Result<Enqueued, InboxClosed> {
        match self.overflow {
            QueueOverflow::Block => self
                .tx
                .send(message)
                .await
                .map(|()| Enqueued::Accepted)
                .map_err(|_| InboxClosed),
            QueueOverflow::Shed => match self.tx.try_send(message) {
                Ok(()) => Ok(Enqueued::Accepted),
                Err(TrySendError::Full(_)) => Ok(Enqueued::Shed),
                Err(TrySendError::Closed(_)) => Err(InboxClosed),
            },
        }
    }
}

/// The stream behind an inbox stopped draining it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("stream queue is closed")]
pub struct InboxClosed;

/// Pulls frames from a [`Listener`] and hands them to the stream named in the
/// envelope. Frames for unknown streams are logged and dropped.
pub struct Receiver {
    listener: Arc<dyn Listener>,
    streams: DashMap<String, StreamInbox>,
    metrics: Arc<RuntimeMetrics>,
}

impl Receiver {
    /// Creates a receiver with no registered streams.
    pub fn new(listener: Arc<dyn Listener>, metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            listener,
            streams: DashMap::new(),
            metrics,
        }
    }

    /// Partition served by the underlying listener.
    pub fn partition(&self) -> usize {
        self.listener.partition()
    }

    /// Registers `inbox` under `stream_name`, replacing any previous one.
    pub fn add_stream(&self, stream_name: impl Into<String>, inbox: StreamInbox) {
        let stream_name = stream_name.into();
        debug!(stream = %stream_name, "stream registered with receiver");
        self.streams.insert(stream_name, inbox);
    }

    /// Unregisters a stream. Returns whether it was registered.
    pub fn remove_stream(&self, stream_name: &str) -> bool {
        self.streams.remove(stream_name).is_some()
    }

    /// Names of the registered streams.
    pub fn stream_names(&self) -> Vec<String> {
        self.streams.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Routes one frame. Returns `true` when a stream accepted it.
    ///
    /// A full target queue makes this wait, or shed the frame, per the
    /// stream's [`QueueOverflow`].
    pub async fn receive(&self, frame: Bytes) -> bool {
        self.metrics.received(frame.len());
        let message = match EventMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.lost();
                error!(partition = self.partition(), error = %e, "dropping undecodable frame");
                return false;
            }
        };

        let inbox = match self.streams.get(&message.stream_name) {
            Some(entry) => entry.value().clone(),
            None => {
                self.metrics.unroutable();
                error!(
                    stream = %message.stream_name,
                    app_id = message.app_id,
                    "cannot find stream for received event, dropping it"
                );
                return false;
            }
        };

        let stream_name = message.stream_name.clone();
        match inbox.push(message).await {
            Ok(Enqueued::Accepted) => true,
            Ok(Enqueued::Shed) => {
                self.metrics.shed();
                debug!(stream = %stream_name, "stream queue full, shedding received event");
                false
            }
            Err(InboxClosed) => {
                self.metrics.lost();
                warn!(stream = %stream_name, "stream closed, dropping received event");
                false
            }
        }
    }

    /// Spawns the receive loop. It ends when `cancel` fires or the listener
    /// closes.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(partition = self.partition(), "receiver started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = self.listener.receive() => match frame {
                        Some(frame) => {
                            self.receive(frame).await;
                        }
                        None => break,
                    },
                }
            }
            debug!(partition = self.partition(), "receiver stopped");
        })
    }
}
