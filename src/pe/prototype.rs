//! Prototypes: per-PE-type configuration and the keyed instance cache.

use async_trait::async_trait;
use futures::FutureExt;
use moka::future::Cache;
use moka::notification::RemovalCause;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::instance::{Instance, InstanceSettings};
use super::trigger::{TriggerPolicy, TriggerRegistry};
use super::{PeContext, PeError, ProcessingElement};
use crate::checkpoint::{CHECKPOINT_ID_SEPARATOR, CheckpointingConfig, SafeKeeper};
use crate::event::{Event, EventKind};
use crate::metrics::RuntimeMetrics;
use crate::stream::StreamDirectory;

/// Instance id of singleton prototypes.
pub const SINGLETON_ID: &str = "";

/// Builder-style configuration of a prototype.
#[derive(Clone, Debug)]
pub struct PrototypeConfig<K: EventKind> {
    name: String,
    singleton: bool,
    max_instances: Option<u64>,
    expire_after_access: Option<Duration>,
    timer: Option<Duration>,
    triggers: HashMap<K, TriggerPolicy>,
    checkpointing: CheckpointingConfig,
}

impl<K: EventKind> PrototypeConfig<K> {
    /// Keyed prototype with an unbounded, non-expiring instance cache.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            singleton: false,
            max_instances: None,
            expire_after_access: None,
            timer: None,
            triggers: HashMap::new(),
            checkpointing: CheckpointingConfig::disabled(),
        }
    }

    /// Prototype name; also the prototype part of checkpoint ids.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Use a single instance regardless of the key.
    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    /// Evict instances beyond `max_instances`.
    ///
    /// Evicted instances leave the cache first; their
    /// [`on_remove`](ProcessingElement::on_remove) hook runs afterwards, during
    /// cache maintenance, so a lookup racing the eviction may already build a
    /// fresh instance for the same key.
    pub fn max_instances(mut self, max_instances: u64) -> Self {
        self.max_instances = Some(max_instances);
        self
    }

    /// Evict instances not used for `idle`, measured on the wall clock.
    ///
    /// As with [`max_instances`](Self::max_instances), an expired instance
    /// leaves the cache before its
    /// [`on_remove`](ProcessingElement::on_remove) hook runs.
    pub fn expire_after_access(mut self, idle: Duration) -> Self {
        self.expire_after_access = Some(idle);
        self
    }

    /// Call [`ProcessingElement::on_time`] on every instance each `interval`.
    /// A zero interval disables the timer.
    pub fn timer(mut self, interval: Duration) -> Self {
        self.timer = (!interval.is_zero()).then_some(interval);
        self
    }

    /// Registers a trigger for events of `kind` and its descendants.
    ///
    /// It fires every `num_events` events, or when `interval` has passed since
    /// it last fired (zero disables the time condition).
    pub fn set_trigger(
        mut self,
        kind: K,
        num_events: u64,
        interval: Duration,
    ) -> Result<Self, PeError> {
        if num_events < 1 {
            return Err(PeError::InvalidConfig(format!(
                "trigger for {:?} on {} needs num_events >= 1",
                kind, self.name
            )));
        }
        self.triggers.insert(kind, TriggerPolicy { num_events, interval });
        Ok(self)
    }

    /// Checkpointing policy inherited by every instance.
    pub fn checkpointing(mut self, checkpointing: CheckpointingConfig) -> Self {
        self.checkpointing = checkpointing;
        self
    }

    /// Rejects names that cannot be recovered from a checkpoint id string,
    /// i.e. names containing the `];[` separator.
    pub fn validate(&self) -> Result<(), PeError> {
        if self.name.contains(CHECKPOINT_ID_SEPARATOR) {
            return Err(PeError::InvalidConfig(format!(
                "prototype name {:?} contains {:?}",
                self.name, CHECKPOINT_ID_SEPARATOR
            )));
        }
        Ok(())
    }
}

type Factory<P> = Arc<dyn Fn(&str) -> P + Send + Sync>;

/// A stream's view of a prototype.
#[async_trait]
pub trait StreamTarget<E: Event>: Send + Sync {
    /// Prototype name.
    fn name(&self) -> &str;

    /// Delivers `event` to the instance for `key`, creating it if needed.
    async fn deliver_keyed(&self, key: &str, event: &E);

    /// Delivers `event` to every live instance.
    async fn deliver_broadcast(&self, event: &E);
}

/// Start and stop hooks the application drives for every prototype.
#[async_trait]
pub trait PrototypeLifecycle: Send + Sync {
    /// Prototype name.
    fn name(&self) -> &str;

    /// Creates the singleton instance and spawns the timer and checkpoint
    /// sweep tasks, all stopped by `cancel`.
    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), PeError>;

    /// Stops background tasks and removes every instance.
    async fn remove_all(&self);

    /// Number of live instances.
    async fn instance_count(&self) -> u64;
}

/// One PE type of an application and its instances.
pub struct Prototype<P: ProcessingElement> {
    name: Arc<str>,
    singleton: bool,
    timer: Option<Duration>,
    factory: Factory<P>,
    settings: Arc<InstanceSettings<P>>,
    streams: StreamDirectory<P::Event>,
    instances: Cache<String, Arc<Instance<P>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl<P: ProcessingElement> Prototype<P> {
    /// Creates a prototype whose instances are built by `factory(key)`.
    pub fn new(
        config: PrototypeConfig<<P::Event as Event>::Kind>,
        factory: impl Fn(&str) -> P + Send + Sync + 'static,
        streams: StreamDirectory<P::Event>,
        safe_keeper: Option<Arc<SafeKeeper>>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        let name: Arc<str> = Arc::from(config.name.as_str());

        let mut builder = Cache::builder().async_eviction_listener(
            |_key: Arc<String>, instance: Arc<Instance<P>>, cause: RemovalCause| {
                async move {
                    if cause.was_evicted() {
                        trace!(instance = instance.id(), ?cause, "instance evicted");
                        instance.teardown().await;
                    }
                }
                .boxed()
            },
        );
        if let Some(max) = config.max_instances {
            builder = builder.max_capacity(max);
        }
        if let Some(idle) = config.expire_after_access {
            builder = builder.time_to_idle(idle);
        }

        Self {
            singleton: config.singleton,
            timer: config.timer,
            factory: Arc::new(factory),
            settings: Arc::new(InstanceSettings {
                prototype: name.clone(),
                thread_safe: P::THREAD_SAFE,
                triggers: TriggerRegistry::new(config.triggers),
                checkpointing: config.checkpointing,
                safe_keeper,
                metrics,
            }),
            name,
            streams,
            instances: builder.build(),
            tasks: Mutex::new(Vec::new()),
            cancel: Mutex::new(None),
        }
    }

    /// Prototype name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This prototype as a stream target.
    pub fn as_target(self: &Arc<Self>) -> Arc<dyn StreamTarget<P::Event>> {
        self.clone()
    }

    /// Whether instances may interleave between handler calls.
    pub fn is_thread_safe(&self) -> bool {
        self.settings.thread_safe
    }

    /// Interval of the timer driving `on_time`, if any.
    pub fn timer(&self) -> Option<Duration> {
        self.timer
    }

    /// Checkpointing policy of the instances.
    pub fn checkpointing(&self) -> &CheckpointingConfig {
        &self.settings.checkpointing
    }

    /// Returns the instance for `key`, creating it on first use.
    ///
    /// Concurrent calls for the same key run the factory, the creation hook
    /// and checkpoint recovery once, and all observe the same instance. A
    /// failed creation hook caches nothing, so the next call tries again.
    /// Singleton prototypes ignore `key`.
    pub async fn get_instance_for_key(&self, key: &str) -> Result<Arc<Instance<P>>, PeError> {
        let id = if self.singleton { SINGLETON_ID } else { key };
        self.instances
            .try_get_with(id.to_string(), self.create_instance(id))
            .await
            .map_err(|e| (*e).clone())
    }

    async fn create_instance(&self, id: &str) -> Result<Arc<Instance<P>>, PeError> {
        let mut pe = (self.factory)(id);
        let ctx = PeContext::new(id, self.name.clone(), self.streams.clone());
        if let Err(e) = pe.on_create(&ctx).await {
            self.settings.metrics.instance_creation_failed();
            error!(prototype = %self.name, instance = id, error = %e, "cannot create instance");
            return Err(PeError::Creation {
                prototype: self.name.to_string(),
                key: id.to_string(),
                reason: e.to_string(),
            });
        }
        let instance = Arc::new(Instance::new(pe, ctx, self.settings.clone()));
        instance.recover().await;
        self.settings.metrics.instance_created();
        trace!(prototype = %self.name, instance = id, "instance created");
        Ok(instance)
    }

    /// Returns the instance for `key` without creating it.
    pub async fn get_existing(&self, key: &str) -> Option<Arc<Instance<P>>> {
        let id = if self.singleton { SINGLETON_ID } else { key };
        self.instances.get(id).await
    }

    /// Snapshot of the live instances.
    pub fn instances(&self) -> Vec<Arc<Instance<P>>> {
        self.instances.iter().map(|(_, instance)| instance).collect()
    }

    /// Number of live instances, after pending evictions are applied.
    pub async fn instance_count(&self) -> u64 {
        self.instances.run_pending_tasks().await;
        self.instances.entry_count()
    }

    /// Runs the teardown hook of the instance for `key`, then drops it.
    /// Returns whether an instance existed.
    pub async fn remove_instance_for_key(&self, key: &str) -> bool {
        let id = if self.singleton { SINGLETON_ID } else { key };
        match self.instances.get(id).await {
            Some(instance) => {
                instance.teardown().await;
                self.instances.invalidate(id).await;
                true
            }
            None => false,
        }
    }

    /// Stops the timer and sweep tasks, then tears down and drops every
    /// instance.
    pub async fn remove_all(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(prototype = %self.name, error = %e, "prototype task failed");
            }
        }
        for instance in self.instances() {
            instance.teardown().await;
        }
        self.instances.invalidate_all();
        self.instances.run_pending_tasks().await;
        info!(prototype = %self.name, "all instances removed");
    }

    fn spawn_timer(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let prototype = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => {
                        for instance in prototype.instances() {
                            let outcome = AssertUnwindSafe(instance.on_time()).catch_unwind().await;
                            if outcome.is_err() {
                                error!(
                                    prototype = %prototype.name,
                                    instance = instance.id(),
                                    "timer handler panicked"
                                );
                            }
                        }
                    }
                }
            }
            debug!(prototype = %prototype.name, "timer stopped");
        })
    }

    fn spawn_checkpoint_sweep(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let prototype = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => {
                        for instance in prototype.instances() {
                            if instance.is_dirty() {
                                instance.checkpoint().await;
                            }
                        }
                    }
                }
            }
            debug!(prototype = %prototype.name, "checkpoint sweep stopped");
        })
    }
}

#[async_trait]
impl<P: ProcessingElement> StreamTarget<P::Event> for Prototype<P> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver_keyed(&self, key: &str, event: &P::Event) {
        match self.get_instance_for_key(key).await {
            Ok(instance) => instance.handle_input_event(event).await,
            Err(e) => error!(
                prototype = %self.name,
                stream = event.stream_name(),
                key,
                error = %e,
                "no instance for key, dropping event"
            ),
        }
    }

    async fn deliver_broadcast(&self, event: &P::Event) {
        for instance in self.instances() {
            instance.handle_input_event(event).await;
        }
    }
}

#[async_trait]
impl<P: ProcessingElement> PrototypeLifecycle for Prototype<P> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), PeError> {
        if self.singleton {
            self.get_instance_for_key(SINGLETON_ID).await?;
        }
        let mut tasks = Vec::new();
        if let Some(interval) = self.timer {
            tasks.push(self.spawn_timer(interval, cancel.clone()));
        }
        let sweep = self.settings.checkpointing.interval();
        if let (Some(interval), Some(_)) = (sweep, &self.settings.safe_keeper) {
            tasks.push(self.spawn_checkpoint_sweep(interval, cancel.clone()));
        }
        self.tasks.lock().extend(tasks);
        *self.cancel.lock() = Some(cancel);
        Ok(())
    }

    async fn remove_all(&self) {
        Prototype::remove_all(self).await;
    }

    async fn instance_count(&self) -> u64 {
        Prototype::instance_count(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointId, InMemoryStateStorage, StateStorage};
    use bytes::Bytes;
    use crate::config::CheckpointingSettings;
    use crate::event::EventHeader;
    use crate::pe::PeContext;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    enum Kind {
        Any,
        Click,
        Purchase,
    }

    impl EventKind for Kind {
        fn parent(&self) -> Option<Self> {
            match self {
                Kind::Any => None,
                _ => Some(Kind::Any),
            }
        }
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Activity {
        header: EventHeader,
        user: String,
        purchase: bool,
        seq: u64,
    }

    impl Event for Activity {
        type Kind = Kind;

        fn kind(&self) -> Kind {
            if self.purchase { Kind::Purchase } else { Kind::Click }
        }

        fn header(&self) -> &EventHeader {
            &self.header
        }

        fn header_mut(&mut self) -> &mut EventHeader {
            &mut self.header
        }
    }

    fn click(user: &str, seq: u64) -> Activity {
        Activity {
            header: EventHeader::now(),
            user: user.to_string(),
            purchase: false,
            seq,
        }
    }

    #[derive(Default)]
    struct Probe {
        created: AtomicUsize,
        removed: AtomicUsize,
        good_ticks: AtomicUsize,
        events: AtomicUsize,
    }

    #[derive(Serialize, Deserialize)]
    struct Tracker {
        seen: Vec<u64>,
        triggers: u32,
        #[serde(default)]
        ticks: u64,
        #[serde(skip)]
        probe: Arc<Probe>,
        #[serde(skip)]
        fail_create: bool,
    }

    #[async_trait]
    impl ProcessingElement for Tracker {
        type Event = Activity;

        async fn on_create(&mut self, _ctx: &PeContext<Activity>) -> Result<(), PeError> {
            // Keep the creation window open so concurrent lookups overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_create {
                return Err(PeError::handler("refused"));
            }
            self.probe.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_remove(&mut self, _ctx: &PeContext<Activity>) {
            self.probe.removed.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_event(
            &mut self,
            event: &Activity,
            _ctx: &PeContext<Activity>,
        ) -> Result<(), PeError> {
            self.seen.push(event.seq);
            self.probe.events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_trigger(
            &mut self,
            _event: &Activity,
            _ctx: &PeContext<Activity>,
        ) -> Result<(), PeError> {
            self.triggers += 1;
            Ok(())
        }

        async fn on_time(&mut self, ctx: &PeContext<Activity>) -> Result<(), PeError> {
            if ctx.id() == "bad" {
                return Err(PeError::handler("timer failure"));
            }
            self.ticks += 1;
            self.probe.good_ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn restore_state(&mut self, restored: Self) {
            self.seen = restored.seen;
            self.triggers = restored.triggers;
            self.ticks = restored.ticks;
        }
    }

    fn prototype(
        config: PrototypeConfig<Kind>,
        probe: Arc<Probe>,
        safe_keeper: Option<Arc<SafeKeeper>>,
    ) -> Arc<Prototype<Tracker>> {
        Arc::new(Prototype::new(
            config,
            move |key| Tracker {
                seen: Vec::new(),
                triggers: 0,
                ticks: 0,
                probe: probe.clone(),
                fail_create: key == "refuse",
            },
            StreamDirectory::default(),
            safe_keeper,
            Arc::new(RuntimeMetrics::new()),
        ))
    }

    #[tokio::test]
    async fn concurrent_lookups_create_one_instance() {
        let probe = Arc::new(Probe::default());
        let proto = prototype(PrototypeConfig::new("tracker"), probe.clone(), None);

        let lookups = (0..16).map(|_| {
            let proto = proto.clone();
            tokio::spawn(async move { proto.get_instance_for_key("alice").await.unwrap() })
        });
        let instances = futures::future::join_all(lookups).await;

        assert_eq!(probe.created.load(Ordering::SeqCst), 1);
        let first = instances[0].as_ref().unwrap();
        for instance in &instances {
            assert!(Arc::ptr_eq(first, instance.as_ref().unwrap()));
        }
        assert_eq!(proto.instance_count().await, 1);
    }

    #[tokio::test]
    async fn failed_creation_is_not_cached() {
        let probe = Arc::new(Probe::default());
        let proto = prototype(PrototypeConfig::new("tracker"), probe.clone(), None);

        let err = proto.get_instance_for_key("refuse").await.unwrap_err();
        assert!(matches!(err, PeError::Creation { ref key, .. } if key == "refuse"));
        assert_eq!(proto.instance_count().await, 0);
        assert!(proto.get_instance_for_key("refuse").await.is_err());
    }

    #[tokio::test]
    async fn singleton_ignores_the_key() {
        let probe = Arc::new(Probe::default());
        let proto = prototype(PrototypeConfig::new("tracker").singleton(), probe.clone(), None);
        proto.clone().start(CancellationToken::new()).await.unwrap();

        let a = proto.get_instance_for_key("a").await.unwrap();
        let b = proto.get_instance_for_key("b").await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id(), SINGLETON_ID);
        assert_eq!(probe.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn trigger_fires_on_fifth_event_and_resets() {
        let config = PrototypeConfig::new("tracker")
            .set_trigger(Kind::Click, 5, Duration::ZERO)
            .unwrap();
        let proto = prototype(config, Arc::new(Probe::default()), None);
        let instance = proto.get_instance_for_key("alice").await.unwrap();

        for seq in 1..=4 {
            instance.handle_input_event(&click("alice", seq)).await;
        }
        assert_eq!(instance.with_state(|pe| pe.triggers).await, 0);
        instance.handle_input_event(&click("alice", 5)).await;
        assert_eq!(instance.with_state(|pe| pe.triggers).await, 1);
        for seq in 6..=9 {
            instance.handle_input_event(&click("alice", seq)).await;
        }
        assert_eq!(instance.with_state(|pe| pe.triggers).await, 1);
        instance.handle_input_event(&click("alice", 10)).await;
        assert_eq!(instance.with_state(|pe| pe.triggers).await, 2);
    }

    #[tokio::test]
    async fn trigger_registered_on_ancestor_applies_to_descendants() {
        let config = PrototypeConfig::new("tracker")
            .set_trigger(Kind::Any, 2, Duration::ZERO)
            .unwrap();
        let proto = prototype(config, Arc::new(Probe::default()), None);
        let instance = proto.get_instance_for_key("bob").await.unwrap();

        instance.handle_input_event(&click("bob", 1)).await;
        let mut purchase = click("bob", 2);
        purchase.purchase = true;
        instance.handle_input_event(&purchase).await;

        assert_eq!(instance.with_state(|pe| pe.triggers).await, 1);
    }

    #[test]
    fn trigger_needs_at_least_one_event() {
        let err = PrototypeConfig::new("tracker")
            .set_trigger(Kind::Click, 0, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, PeError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn removal_runs_teardown_first() {
        let probe = Arc::new(Probe::default());
        let proto = prototype(PrototypeConfig::new("tracker"), probe.clone(), None);
        proto.get_instance_for_key("a").await.unwrap();
        proto.get_instance_for_key("b").await.unwrap();

        assert!(proto.remove_instance_for_key("a").await);
        assert!(!proto.remove_instance_for_key("a").await);
        assert_eq!(probe.removed.load(Ordering::SeqCst), 1);
        assert_eq!(proto.instance_count().await, 1);

        proto.remove_all().await;
        assert_eq!(probe.removed.load(Ordering::SeqCst), 2);
        assert_eq!(proto.instance_count().await, 0);
    }

    #[tokio::test]
    async fn capacity_eviction_runs_teardown() {
        let probe = Arc::new(Probe::default());
        let config = PrototypeConfig::new("tracker").max_instances(2);
        let proto = prototype(config, probe.clone(), None);
        for key in ["a", "b", "c", "d"] {
            proto.get_instance_for_key(key).await.unwrap();
            proto.instance_count().await;
        }

        assert!(proto.instance_count().await <= 2);
        // Eviction listeners run during maintenance.
        proto.instance_count().await;
        assert!(probe.removed.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn timer_failures_do_not_stop_other_instances() {
        let probe = Arc::new(Probe::default());
        let proto = prototype(
            PrototypeConfig::new("tracker").timer(Duration::from_millis(10)),
            probe.clone(),
            None,
        );
        proto.get_instance_for_key("bad").await.unwrap();
        proto.get_instance_for_key("good").await.unwrap();

        let cancel = CancellationToken::new();
        proto.clone().start(cancel.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(55)).await;
        proto.remove_all().await;

        let ticks = probe.good_ticks.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected repeated ticks on the healthy instance, got {}", ticks);
    }

    #[tokio::test]
    async fn event_count_checkpoint_and_recovery() {
        let storage = Arc::new(InMemoryStateStorage::new());
        let keeper = Arc::new(SafeKeeper::new(
            storage.clone(),
            &CheckpointingSettings::default(),
            Arc::new(RuntimeMetrics::new()),
        ));
        let config =
            PrototypeConfig::new("tracker").checkpointing(CheckpointingConfig::every_events(2));

        let first = prototype(config.clone(), Arc::new(Probe::default()), Some(keeper.clone()));
        let instance = first.get_instance_for_key("carol").await.unwrap();
        instance.handle_input_event(&click("carol", 1)).await;
        instance.handle_input_event(&click("carol", 2)).await;
        keeper.shutdown().await;
        assert_eq!(storage.len(), 1);
        assert!(!instance.is_dirty());

        let keeper = Arc::new(SafeKeeper::new(
            storage.clone(),
            &CheckpointingSettings::default(),
            Arc::new(RuntimeMetrics::new()),
        ));
        let second = prototype(config, Arc::new(Probe::default()), Some(keeper));
        let recovered = second.get_instance_for_key("carol").await.unwrap();
        recovered.handle_input_event(&click("carol", 3)).await;

        assert_eq!(recovered.with_state(|pe| pe.seen.clone()).await, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_only_checkpoints_dirty_instances() {
        let storage = Arc::new(InMemoryStateStorage::new());
        let metrics = Arc::new(RuntimeMetrics::new());
        let keeper = Arc::new(SafeKeeper::new(
            storage.clone(),
            &CheckpointingSettings::default(),
            metrics.clone(),
        ));
        let config = PrototypeConfig::new("tracker")
            .checkpointing(CheckpointingConfig::every(1, crate::checkpoint::TimeUnit::Seconds));
        let proto = prototype(config, Arc::new(Probe::default()), Some(keeper.clone()));
        let instance = proto.get_instance_for_key("dave").await.unwrap();
        instance.handle_input_event(&click("dave", 1)).await;
        proto.clone().start(CancellationToken::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(metrics.snapshot().checkpoints_requested, 1);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(metrics.snapshot().checkpoints_requested, 1);

        instance.handle_input_event(&click("dave", 2)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(metrics.snapshot().checkpoints_requested, 2);

        proto.remove_all().await;
        keeper.shutdown().await;
        assert_eq!(storage.len(), 1);
    }

    fn keeper(storage: Arc<InMemoryStateStorage>) -> Arc<SafeKeeper> {
        Arc::new(SafeKeeper::new(
            storage,
            &CheckpointingSettings::default(),
            Arc::new(RuntimeMetrics::new()),
        ))
    }

    #[tokio::test]
    async fn recovery_keeps_factory_shared_handles() {
        let storage = Arc::new(InMemoryStateStorage::new());
        let id = CheckpointId::new("tracker", "erin");
        storage
            .save_state(&id, Bytes::from_static(br#"{"seen":[1,2],"triggers":0}"#))
            .await
            .unwrap();
        let probe = Arc::new(Probe::default());
        let config =
            PrototypeConfig::new("tracker").checkpointing(CheckpointingConfig::every_events(5));
        let proto = prototype(config, probe.clone(), Some(keeper(storage)));

        let instance = proto.get_instance_for_key("erin").await.unwrap();
        instance.handle_input_event(&click("erin", 3)).await;

        assert_eq!(instance.with_state(|pe| pe.seen.clone()).await, vec![1, 2, 3]);
        assert_eq!(probe.events.load(Ordering::SeqCst), 1);
        assert!(instance.with_state(|pe| Arc::ptr_eq(&pe.probe, &probe)).await);
    }

    #[tokio::test]
    async fn singleton_timer_work_survives_the_first_event() {
        let storage = Arc::new(InMemoryStateStorage::new());
        storage
            .save_state(
                &CheckpointId::new("tracker", SINGLETON_ID),
                Bytes::from_static(br#"{"seen":[1,2],"triggers":0,"ticks":0}"#),
            )
            .await
            .unwrap();
        let config = PrototypeConfig::new("tracker")
            .singleton()
            .timer(Duration::from_millis(10))
            .checkpointing(CheckpointingConfig::every_events(100));
        let proto = prototype(config, Arc::new(Probe::default()), Some(keeper(storage)));
        proto.clone().start(CancellationToken::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(55)).await;
        let instance = proto.get_instance_for_key("any").await.unwrap();
        let ticks_before = instance.with_state(|pe| pe.ticks).await;
        instance.handle_input_event(&click("any", 3)).await;
        let (seen, ticks_after) = instance.with_state(|pe| (pe.seen.clone(), pe.ticks)).await;
        proto.remove_all().await;

        assert!(ticks_before >= 2, "timer ticks before first event: {}", ticks_before);
        assert!(ticks_after >= ticks_before);
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn idle_instances_expire_and_run_teardown() {
        let probe = Arc::new(Probe::default());
        let config = PrototypeConfig::new("tracker").expire_after_access(Duration::from_millis(50));
        let proto = prototype(config, probe.clone(), None);
        proto.get_instance_for_key("idle").await.unwrap();
        assert_eq!(proto.instance_count().await, 1);

        // The cache clock is wall time.
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(proto.instance_count().await, 0);
        assert!(proto.get_existing("idle").await.is_none());
        proto.instance_count().await;
        assert_eq!(probe.removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn names_must_survive_checkpoint_ids() {
        for name in ["counter", "a]b", "[x", ""] {
            assert!(PrototypeConfig::<Kind>::new(name).validate().is_ok(), "{:?}", name);
        }
        let err = PrototypeConfig::<Kind>::new("a];[b").validate().unwrap_err();
        assert!(matches!(err, PeError::InvalidConfig(_)));
    }
}
