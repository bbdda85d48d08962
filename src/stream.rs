//! Streams: named conduits from producers to processing element prototypes.
//!
//! A stream with a [`Key`] routes each event to the partition owning its key
//! and, locally, to the instance for that key. A stream without a key
//! broadcasts: every remote partition receives the event once through the
//! [`Sender`], this partition enqueues it once, and delivery reaches every
//! live instance of every target prototype.
//!
//! Local delivery goes through a bounded queue drained by one task per
//! stream, so events put on one stream are delivered in order.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::codec::{CodecError, SerializerDeserializer};
use crate::comm::{CommError, Enqueued, InboxClosed, Sender, StreamInbox};
use crate::config::StreamSettings;
use crate::event::{Event, EventMessage};
use crate::metrics::RuntimeMetrics;
use crate::partitioning::Key;
use crate::pe::StreamTarget;

/// Error type for stream operations.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The stream was closed.
    #[error("stream {0:?} is closed")]
    Closed(String),
    /// The delivery loop was already started.
    #[error("stream {0:?} already started")]
    AlreadyStarted(String),
    /// Routing the event failed.
    #[error(transparent)]
    Comm(#[from] CommError),
    /// Serializing the event failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Name-indexed streams of an application, shared with handlers so they can
/// emit.
pub struct StreamDirectory<E> {
    streams: Arc<RwLock<HashMap<String, Arc<Stream<E>>>>>,
}

impl<E> Clone for StreamDirectory<E> {
    fn clone(&self) -> Self {
        Self {
            streams: self.streams.clone(),
        }
    }
}

impl<E> Default for StreamDirectory<E> {
    fn default() -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<E> StreamDirectory<E> {
    /// Stream named `name`.
    pub fn get(&self, name: &str) -> Option<Arc<Stream<E>>> {
        self.streams.read().get(name).cloned()
    }

    pub(crate) fn insert(&self, stream: Arc<Stream<E>>) {
        self.streams.write().insert(stream.name.clone(), stream);
    }

    /// Names of all streams.
    pub fn names(&self) -> Vec<String> {
        self.streams.read().keys().cloned().collect()
    }
}

/// A named, typed stream.
pub struct Stream<E> {
    name: String,
    app_id: u32,
    key: Option<Key<E>>,
    targets: Vec<Arc<dyn StreamTarget<E>>>,
    sender: Arc<Sender<E>>,
    serdes: Arc<dyn SerializerDeserializer<E>>,
    metrics: Arc<RuntimeMetrics>,
    inbox: StreamInbox,
    rx: Mutex<Option<mpsc::Receiver<EventMessage>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Event> Stream<E> {
    /// Creates a stream. `key` of `None` makes it a broadcast stream.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        app_id: u32,
        key: Option<Key<E>>,
        targets: Vec<Arc<dyn StreamTarget<E>>>,
        sender: Arc<Sender<E>>,
        serdes: Arc<dyn SerializerDeserializer<E>>,
        queue: &StreamSettings,
        metrics: Arc<RuntimeMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue.queue_capacity.max(1));
        Self {
            name: name.into(),
            app_id,
            key,
            targets,
            sender,
            serdes,
            metrics,
            inbox: StreamInbox::new(tx, queue.overflow),
            rx: Mutex::new(Some(rx)),
            cancel,
            task: Mutex::new(None),
        }
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this stream broadcasts.
    pub fn is_broadcast(&self) -> bool {
        self.key.is_none()
    }

    /// Names of the target prototypes.
    pub fn target_names(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.name()).collect()
    }

    /// Handle the receiver uses to enqueue events from other partitions.
    pub fn inbox(&self) -> StreamInbox {
        self.inbox.clone()
    }

    /// Puts an event on the stream.
    ///
    /// Stamps the stream name and application id, then either enqueues it
    /// locally or lets the sender emit it. A full local queue makes this
    /// wait, or drop and count the event, per the stream's
    /// [`QueueOverflow`](crate::config::QueueOverflow). Fails once the stream
    /// is closed.
    pub async fn put(&self, mut event: E) -> Result<(), StreamError> {
        let header = event.header_mut();
        header.stream_name = self.name.clone();
        header.app_id = self.app_id;

        match &self.key {
            Some(key) => {
                let key = key.get(&event);
                if self.sender.send_and_check_if_local(&key, &event).await? {
                    self.enqueue(&event).await?;
                }
            }
            None => {
                self.sender.send_to_all_remote_partitions(&event).await?;
                self.enqueue(&event).await?;
            }
        }
        Ok(())
    }

    async fn enqueue(&self, event: &E) -> Result<(), StreamError> {
        let payload = self.serdes.serialize(event)?;
        let message = EventMessage::new(self.app_id, self.name.as_str(), payload);
        let pushed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(InboxClosed),
            pushed = self.inbox.push(message) => pushed,
        };
        match pushed {
            Ok(Enqueued::Accepted) => Ok(()),
            Ok(Enqueued::Shed) => {
                self.metrics.shed();
                debug!(stream = %self.name, "stream queue full, shedding event");
                Ok(())
            }
            Err(InboxClosed) => Err(StreamError::Closed(self.name.clone())),
        }
    }

    /// Spawns the delivery loop.
    pub fn start(self: &Arc<Self>) -> Result<(), StreamError> {
        let mut rx = self
            .rx
            .lock()
            .take()
            .ok_or_else(|| StreamError::AlreadyStarted(self.name.clone()))?;
        let stream = Arc::clone(self);
        let handle = tokio::spawn(async move {
            debug!(stream = %stream.name, "delivery loop started");
            loop {
                let message = tokio::select! {
                    biased;
                    _ = stream.cancel.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                stream.deliver(message).await;
            }
            debug!(stream = %stream.name, "delivery loop stopped");
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn deliver(&self, message: EventMessage) {
        let event = match self.serdes.deserialize(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                self.metrics.lost();
                error!(
                    stream = %self.name,
                    error = %e,
                    "cannot deserialize queued event, dropping it"
                );
                return;
            }
        };
        match &self.key {
            Some(key) => {
                let key = key.get(&event);
                trace!(stream = %self.name, key = %key, "delivering keyed event");
                for target in &self.targets {
                    target.deliver_keyed(&key, &event).await;
                }
            }
            None => {
                for target in &self.targets {
                    target.deliver_broadcast(&event).await;
                }
            }
        }
    }

    /// Stops the delivery loop and waits for it. The event being delivered,
    /// if any, completes; queued events are dropped.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(stream = %self.name, error = %e, "delivery loop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonSerDeser;
    use crate::comm::{LoopbackNetwork, StaticAssignment};
    use crate::config::QueueOverflow;
    use crate::event::{EventHeader, EventKind};
    use crate::partitioning::{DefaultHasher, Hasher, partition_for};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    struct Plain;

    impl EventKind for Plain {
        fn parent(&self) -> Option<Self> {
            None
        }
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Word {
        header: EventHeader,
        text: String,
    }

    impl Event for Word {
        type Kind = Plain;

        fn kind(&self) -> Plain {
            Plain
        }

        fn header(&self) -> &EventHeader {
            &self.header
        }

        fn header_mut(&mut self) -> &mut EventHeader {
            &mut self.header
        }
    }

    fn word(text: &str) -> Word {
        Word {
            header: EventHeader::now(),
            text: text.to_string(),
        }
    }

    #[derive(Default)]
    struct Recorder {
        keyed: Mutex<Vec<(String, String, String)>>,
        broadcast: Mutex<Vec<String>>,
        notify: tokio::sync::Notify,
    }

    #[async_trait]
    impl StreamTarget<Word> for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn deliver_keyed(&self, key: &str, event: &Word) {
            self.keyed.lock().push((
                key.to_string(),
                event.text.clone(),
                event.header.stream_name.clone(),
            ));
            self.notify.notify_one();
        }

        async fn deliver_broadcast(&self, event: &Word) {
            self.broadcast.lock().push(event.text.clone());
            self.notify.notify_one();
        }
    }

    impl Recorder {
        async fn wait_for(&self, count: usize) {
            while self.keyed.lock().len() + self.broadcast.lock().len() < count {
                self.notify.notified().await;
            }
        }
    }

    fn stream(
        network: &LoopbackNetwork,
        local: usize,
        keyed: bool,
        recorder: Arc<Recorder>,
    ) -> Arc<Stream<Word>> {
        stream_with(network, local, keyed, recorder, QueueOverflow::Block).0
    }

    fn stream_with(
        network: &LoopbackNetwork,
        local: usize,
        keyed: bool,
        recorder: Arc<Recorder>,
        overflow: QueueOverflow,
    ) -> (Arc<Stream<Word>>, Arc<RuntimeMetrics>) {
        let metrics = Arc::new(RuntimeMetrics::new());
        let sender = Arc::new(Sender::new(
            Arc::new(network.emitter()),
            Arc::new(JsonSerDeser),
            Arc::new(DefaultHasher),
            Arc::new(StaticAssignment::new(local, network.partition_count())),
            metrics.clone(),
        ));
        let key = keyed.then(|| Key::new(|w: &Word| vec![w.text.clone()]));
        let settings = StreamSettings {
            queue_capacity: 16,
            overflow,
        };
        let stream = Arc::new(Stream::new(
            "words",
            3,
            key,
            vec![recorder as Arc<dyn StreamTarget<Word>>],
            sender,
            Arc::new(JsonSerDeser),
            &settings,
            metrics.clone(),
            CancellationToken::new(),
        ));
        (stream, metrics)
    }

    fn text_for_partition(partition: usize, count: usize) -> String {
        (0..)
            .map(|i| format!("w{}", i))
            .find(|t| partition_for(DefaultHasher.hash(t), count) == partition)
            .unwrap()
    }

    #[tokio::test]
    async fn keyed_events_are_delivered_in_order() {
        let network = LoopbackNetwork::new(1, 16);
        let recorder = Arc::new(Recorder::default());
        let stream = stream(&network, 0, true, recorder.clone());
        stream.start().unwrap();

        for text in ["e1", "e2", "e3"] {
            stream.put(word(text)).await.unwrap();
        }
        recorder.wait_for(3).await;

        let delivered = recorder.keyed.lock().clone();
        let texts: Vec<&str> = delivered.iter().map(|(_, t, _)| t.as_str()).collect();
        assert_eq!(texts, vec!["e1", "e2", "e3"]);
        assert!(delivered.iter().all(|(k, t, s)| k == t && s == "words"));
        stream.close().await;
    }

    #[tokio::test]
    async fn remote_keys_are_not_enqueued() {
        let network = LoopbackNetwork::new(2, 16);
        let recorder = Arc::new(Recorder::default());
        let stream = stream(&network, 0, true, recorder.clone());
        stream.start().unwrap();

        stream.put(word(&text_for_partition(1, 2))).await.unwrap();
        let local = text_for_partition(0, 2);
        stream.put(word(&local)).await.unwrap();
        recorder.wait_for(1).await;

        assert_eq!(network.sent().len(), 1);
        assert_eq!(network.sent()[0].0, 1);
        assert_eq!(recorder.keyed.lock()[0].1, local);
        stream.close().await;
    }

    #[tokio::test]
    async fn broadcast_enqueues_locally_once_and_emits_to_others() {
        let network = LoopbackNetwork::new(3, 16);
        let recorder = Arc::new(Recorder::default());
        let stream = stream(&network, 2, false, recorder.clone());
        stream.start().unwrap();

        stream.put(word("hello")).await.unwrap();
        recorder.wait_for(1).await;

        let mut partitions: Vec<usize> = network.sent().into_iter().map(|(p, _)| p).collect();
        partitions.sort_unstable();
        assert_eq!(partitions, vec![0, 1]);
        assert_eq!(recorder.broadcast.lock().clone(), vec!["hello".to_string()]);
        stream.close().await;
        assert_eq!(recorder.broadcast.lock().len(), 1);
    }

    #[tokio::test]
    async fn put_blocks_on_full_queue_until_closed() {
        let network = LoopbackNetwork::new(1, 16);
        let recorder = Arc::new(Recorder::default());
        let stream = stream(&network, 0, true, recorder);
        // Not started: nothing drains the queue.
        for i in 0..16 {
            stream.put(word(&format!("w{}", i))).await.unwrap();
        }

        let blocked = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.put(word("overflow")).await })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        stream.close().await;
        assert!(matches!(blocked.await.unwrap(), Err(StreamError::Closed(_))));
    }

    #[tokio::test]
    async fn shedding_stream_drops_events_beyond_capacity() {
        let network = LoopbackNetwork::new(1, 16);
        let recorder = Arc::new(Recorder::default());
        let (stream, metrics) =
            stream_with(&network, 0, true, recorder.clone(), QueueOverflow::Shed);
        for i in 0..20 {
            stream.put(word(&format!("w{}", i))).await.unwrap();
        }
        assert_eq!(metrics.snapshot().events_shed, 4);

        stream.start().unwrap();
        recorder.wait_for(16).await;
        tokio::task::yield_now().await;

        let delivered: Vec<String> =
            recorder.keyed.lock().iter().map(|(_, t, _)| t.clone()).collect();
        let expected: Vec<String> = (0..16).map(|i| format!("w{}", i)).collect();
        assert_eq!(delivered, expected);
        stream.close().await;
        assert!(matches!(stream.put(word("late")).await, Err(StreamError::Closed(_))));
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let network = LoopbackNetwork::new(1, 16);
        let stream = stream(&network, 0, false, Arc::new(Recorder::default()));
        stream.start().unwrap();
        assert!(matches!(stream.start(), Err(StreamError::AlreadyStarted(_))));
        stream.close().await;
    }

    #[test]
    fn directory_lookup() {
        let directory: StreamDirectory<Word> = StreamDirectory::default();
        assert!(directory.get("words").is_none());
        assert!(directory.names().is_empty());
    }
}
