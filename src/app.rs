//! Application assembly and lifecycle.
//!
//! An application is a fixed graph of prototypes and streams declared on an
//! [`AppBuilder`] and frozen by [`AppBuilder::build`]. [`App::start`] brings
//! it up on the partition handed out by the assignment service;
//! [`App::close`] tears it down and waits for every background task.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::checkpoint::{SafeKeeper, StateStorage};
use crate::codec::{JsonSerDeser, SerializerDeserializer};
use crate::comm::{
    Assignment, Emitter, Listener, LoopbackNetwork, PartitionDescriptor, Receiver, Sender,
    StaticAssignment,
};
use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use crate::event::Event;
use crate::metrics::RuntimeMetrics;
use crate::partitioning::{DefaultHasher, Hasher, Key, KeyFinder};
use crate::pe::window::SlotBoundary;
use crate::pe::{
    ProcessingElement, Prototype, PrototypeConfig, PrototypeLifecycle, StreamTarget,
    WindowConfig, WindowLogic, WindowingPe,
};
use crate::stream::{Stream, StreamDirectory};

/// Network collaborators of one application process.
#[derive(Clone)]
pub struct Transport {
    /// Outbound transport.
    pub emitter: Arc<dyn Emitter>,
    /// Inbound transport.
    pub listener: Arc<dyn Listener>,
    /// Partition assignment.
    pub assignment: Arc<dyn Assignment>,
}

impl Transport {
    /// Partition `partition` of an in-process network. `None` if its
    /// listener was already taken.
    pub fn loopback(network: &LoopbackNetwork, partition: usize) -> Option<Self> {
        Some(Self {
            emitter: Arc::new(network.emitter()),
            listener: Arc::new(network.listener(partition)?),
            assignment: Arc::new(StaticAssignment::new(partition, network.partition_count())),
        })
    }
}

struct StreamDecl<E> {
    name: String,
    key: Option<Key<E>>,
    targets: Vec<Arc<dyn StreamTarget<E>>>,
}

/// Declares the prototypes and streams of an application.
pub struct AppBuilder<E: Event> {
    app_id: u32,
    config: RuntimeConfig,
    transport: Transport,
    serdes: Arc<dyn SerializerDeserializer<E>>,
    hasher: Arc<dyn Hasher>,
    metrics: Arc<RuntimeMetrics>,
    safe_keeper: Option<Arc<SafeKeeper>>,
    directory: StreamDirectory<E>,
    prototypes: Vec<Arc<dyn PrototypeLifecycle>>,
    streams: Vec<StreamDecl<E>>,
}

impl<E: Event> AppBuilder<E> {
    /// Starts a declaration with JSON event serialization and FNV-1a key
    /// hashing.
    pub fn new(
        app_id: u32,
        config: RuntimeConfig,
        transport: Transport,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        Ok(Self {
            app_id,
            config,
            transport,
            serdes: Arc::new(JsonSerDeser),
            hasher: Arc::new(DefaultHasher),
            metrics: Arc::new(RuntimeMetrics::new()),
            safe_keeper: None,
            directory: StreamDirectory::default(),
            prototypes: Vec::new(),
            streams: Vec::new(),
        })
    }

    /// Replaces the event serializer.
    pub fn with_serdes(mut self, serdes: Arc<dyn SerializerDeserializer<E>>) -> Self {
        self.serdes = serdes;
        self
    }

    /// Replaces the key hasher.
    pub fn with_hasher(mut self, hasher: Arc<dyn Hasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Enables checkpointing on `storage`. Must precede
    /// [`add_prototype`](Self::add_prototype), and must run inside a Tokio
    /// runtime because it spawns the checkpointing pools.
    pub fn with_state_storage(
        mut self,
        storage: Arc<dyn StateStorage>,
    ) -> Result<Self, RuntimeError> {
        if !self.prototypes.is_empty() {
            return Err(RuntimeError::Graph(
                "state storage must be configured before prototypes are added".to_string(),
            ));
        }
        self.safe_keeper = Some(Arc::new(SafeKeeper::new(
            storage,
            &self.config.checkpointing,
            self.metrics.clone(),
        )));
        Ok(self)
    }

    /// Metrics shared by every component of the application.
    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    /// Registers a prototype whose instances are built by `factory(key)`.
    ///
    /// Fails on a duplicate name or a name that
    /// [`PrototypeConfig::validate`] rejects.
    pub fn add_prototype<P>(
        &mut self,
        config: PrototypeConfig<<E as Event>::Kind>,
        factory: impl Fn(&str) -> P + Send + Sync + 'static,
    ) -> Result<Arc<Prototype<P>>, RuntimeError>
    where
        P: ProcessingElement<Event = E>,
    {
        config.validate()?;
        if self.prototypes.iter().any(|p| p.name() == config.name()) {
            return Err(RuntimeError::Graph(format!(
                "duplicate prototype name {:?}",
                config.name()
            )));
        }
        let prototype = Arc::new(Prototype::new(
            config,
            factory,
            self.directory.clone(),
            self.safe_keeper.clone(),
            self.metrics.clone(),
        ));
        self.prototypes.push(prototype.clone());
        Ok(prototype)
    }

    /// Registers a prototype whose instances keep a sliding window shaped by
    /// `window` and run `factory(key)` on it.
    ///
    /// Periodic windows roll on the prototype timer, which is set to the
    /// slot duration and overrides any timer already on `config`.
    pub fn add_windowing_prototype<L>(
        &mut self,
        config: PrototypeConfig<<E as Event>::Kind>,
        window: WindowConfig,
        factory: impl Fn(&str) -> L + Send + Sync + 'static,
    ) -> Result<Arc<Prototype<WindowingPe<L>>>, RuntimeError>
    where
        L: WindowLogic<Event = E>,
    {
        window.validate()?;
        let config = match window.boundary {
            SlotBoundary::Periodic(slot_duration) => config.timer(slot_duration),
            SlotBoundary::Count(_) => config,
        };
        self.add_prototype(config, move |key| WindowingPe::new(&window, factory(key)))
    }

    /// Declares a keyed stream.
    pub fn create_stream(
        &mut self,
        name: impl Into<String>,
        finder: impl KeyFinder<E> + 'static,
        targets: Vec<Arc<dyn StreamTarget<E>>>,
    ) -> &mut Self {
        self.streams.push(StreamDecl {
            name: name.into(),
            key: Some(Key::new(finder)),
            targets,
        });
        self
    }

    /// Declares a broadcast stream.
    pub fn create_broadcast_stream(
        &mut self,
        name: impl Into<String>,
        targets: Vec<Arc<dyn StreamTarget<E>>>,
    ) -> &mut Self {
        self.streams.push(StreamDecl {
            name: name.into(),
            key: None,
            targets,
        });
        self
    }

    /// Validates and freezes the graph.
    pub fn build(self) -> Result<App<E>, RuntimeError> {
        let mut names = HashSet::new();
        for decl in &self.streams {
            if !names.insert(decl.name.as_str()) {
                return Err(RuntimeError::Graph(format!("duplicate stream name {:?}", decl.name)));
            }
            if decl.targets.is_empty() {
                return Err(RuntimeError::Graph(format!("stream {:?} has no targets", decl.name)));
            }
        }

        let sender = Arc::new(Sender::new(
            self.transport.emitter.clone(),
            self.serdes.clone(),
            self.hasher.clone(),
            self.transport.assignment.clone(),
            self.metrics.clone(),
        ));
        let receiver = Arc::new(Receiver::new(
            self.transport.listener.clone(),
            self.metrics.clone(),
        ));
        let cancel = CancellationToken::new();

        let mut streams = Vec::with_capacity(self.streams.len());
        for decl in self.streams {
            let stream = Arc::new(Stream::new(
                decl.name,
                self.app_id,
                decl.key,
                decl.targets,
                sender.clone(),
                self.serdes.clone(),
                &self.config.stream,
                self.metrics.clone(),
                cancel.child_token(),
            ));
            self.directory.insert(stream.clone());
            streams.push(stream);
        }

        Ok(App {
            app_id: self.app_id,
            sender,
            receiver,
            directory: self.directory,
            streams,
            prototypes: self.prototypes,
            safe_keeper: self.safe_keeper,
            metrics: self.metrics,
            cancel,
            receiver_task: Mutex::new(None),
            state: Mutex::new(AppState::Built),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AppState {
    Built,
    Running,
    Closed,
}

/// A running (or runnable) application.
pub struct App<E: Event> {
    app_id: u32,
    sender: Arc<Sender<E>>,
    receiver: Arc<Receiver>,
    directory: StreamDirectory<E>,
    streams: Vec<Arc<Stream<E>>>,
    prototypes: Vec<Arc<dyn PrototypeLifecycle>>,
    safe_keeper: Option<Arc<SafeKeeper>>,
    metrics: Arc<RuntimeMetrics>,
    cancel: CancellationToken,
    receiver_task: Mutex<Option<JoinHandle<()>>>,
    state: Mutex<AppState>,
}

impl<E: Event> App<E> {
    /// Application id stamped on every event.
    pub fn app_id(&self) -> u32 {
        self.app_id
    }

    /// Stream named `name`.
    pub fn stream(&self, name: &str) -> Option<Arc<Stream<E>>> {
        self.directory.get(name)
    }

    /// Metrics of this application.
    pub fn metrics(&self) -> &Arc<RuntimeMetrics> {
        &self.metrics
    }

    /// Checkpointing pipeline, when state storage was configured.
    pub fn safe_keeper(&self) -> Option<&Arc<SafeKeeper>> {
        self.safe_keeper.as_ref()
    }

    /// Receiver routing inbound frames.
    pub fn receiver(&self) -> &Arc<Receiver> {
        &self.receiver
    }

    /// Resolves the local partition and starts prototypes, streams and the
    /// receiver.
    pub async fn start(&self) -> Result<PartitionDescriptor, RuntimeError> {
        {
            let mut state = self.state.lock();
            match *state {
                AppState::Built => *state = AppState::Running,
                AppState::Running => return Err(RuntimeError::Lifecycle("already running")),
                AppState::Closed => return Err(RuntimeError::Lifecycle("closed")),
            }
        }

        let descriptor = self.sender.resolve_local_partition().await?;
        for prototype in &self.prototypes {
            prototype.clone().start(self.cancel.child_token()).await?;
        }
        for stream in &self.streams {
            stream.start()?;
            self.receiver.add_stream(stream.name(), stream.inbox());
        }
        let task = self.receiver.clone().start(self.cancel.child_token());
        *self.receiver_task.lock() = Some(task);

        info!(
            app_id = self.app_id,
            partition = descriptor.partition,
            partition_count = descriptor.partition_count,
            streams = self.streams.len(),
            prototypes = self.prototypes.len(),
            "application started"
        );
        Ok(descriptor)
    }

    /// Stops the receiver, closes the streams, removes every instance and
    /// drains the checkpointing pipeline. Returns once every task is joined.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == AppState::Closed {
                return;
            }
            *state = AppState::Closed;
        }

        for stream in &self.streams {
            self.receiver.remove_stream(stream.name());
        }
        self.cancel.cancel();
        let receiver_task = self.receiver_task.lock().take();
        if let Some(task) = receiver_task {
            if let Err(e) = task.await {
                error!(app_id = self.app_id, error = %e, "receiver task failed");
            }
        }
        for stream in &self.streams {
            stream.close().await;
        }
        for prototype in &self.prototypes {
            prototype.remove_all().await;
        }
        if let Some(keeper) = &self.safe_keeper {
            keeper.shutdown().await;
        }
        info!(app_id = self.app_id, "application closed");
    }
}
