//! One keyed processing element instance.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::trigger::{TriggerCounters, TriggerRegistry};
use super::{PeContext, ProcessingElement};
use crate::checkpoint::{
    CheckpointError, CheckpointId, Checkpointable, CheckpointingConfig, SafeKeeper,
};
use crate::event::Event;
use crate::metrics::RuntimeMetrics;

type KindOf<P> = <<P as ProcessingElement>::Event as Event>::Kind;

/// Prototype-level settings every instance reads.
pub(crate) struct InstanceSettings<P: ProcessingElement> {
    pub(crate) prototype: Arc<str>,
    pub(crate) thread_safe: bool,
    pub(crate) triggers: TriggerRegistry<KindOf<P>>,
    pub(crate) checkpointing: CheckpointingConfig,
    pub(crate) safe_keeper: Option<Arc<SafeKeeper>>,
    pub(crate) metrics: Arc<RuntimeMetrics>,
}

/// A processing element bound to one key.
pub struct Instance<P: ProcessingElement> {
    pe: Mutex<P>,
    ctx: PeContext<P::Event>,
    settings: Arc<InstanceSettings<P>>,
    counters: parking_lot::Mutex<TriggerCounters<KindOf<P>>>,
    event_count: AtomicU64,
    dirty: AtomicBool,
}

impl<P: ProcessingElement> Instance<P> {
    pub(crate) fn new(pe: P, ctx: PeContext<P::Event>, settings: Arc<InstanceSettings<P>>) -> Self {
        Self {
            pe: Mutex::new(pe),
            ctx,
            settings,
            counters: parking_lot::Mutex::new(TriggerCounters::new(Instant::now())),
            event_count: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    /// Instance id.
    pub fn id(&self) -> &str {
        self.ctx.id()
    }

    /// Events handled so far.
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Acquire)
    }

    /// Whether state changed since the last checkpoint.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Runs `f` with exclusive access to the application state.
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        let mut pe = self.pe.lock().await;
        f(&mut pe)
    }

    /// Delivers one event: the event handler, the trigger check and handler,
    /// then the checkpoint decision.
    pub async fn handle_input_event(self: &Arc<Self>, event: &P::Event) {
        if self.settings.thread_safe {
            let fired = {
                let mut pe = self.pe.lock().await;
                self.dispatch_event(&mut pe, event).await
            };
            if fired {
                let mut pe = self.pe.lock().await;
                self.dispatch_trigger(&mut pe, event).await;
            }
        } else {
            let mut pe = self.pe.lock().await;
            if self.dispatch_event(&mut pe, event).await {
                self.dispatch_trigger(&mut pe, event).await;
            }
        }

        let count = self.event_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.dirty.store(true, Ordering::Release);
        if self.settings.checkpointing.is_checkpointable(count, true) {
            self.checkpoint().await;
        }
    }

    /// Runs the event handler and reports whether a trigger fired.
    async fn dispatch_event(&self, pe: &mut P, event: &P::Event) -> bool {
        if let Err(e) = pe.on_event(event, &self.ctx).await {
            self.settings.metrics.handler_error();
            error!(
                prototype = %self.settings.prototype,
                instance = self.id(),
                stream = event.stream_name(),
                error = %e,
                "event handler failed"
            );
            return false;
        }
        self.check_trigger(event.kind())
    }

    fn check_trigger(&self, kind: KindOf<P>) -> bool {
        let triggers = &self.settings.triggers;
        if triggers.is_empty() {
            return false;
        }
        let Some(registered) = triggers.resolve(kind) else {
            return false;
        };
        let Some(policy) = triggers.policy(registered) else {
            return false;
        };
        self.counters
            .lock()
            .check_and_update(registered, policy, Instant::now())
    }

    async fn dispatch_trigger(&self, pe: &mut P, event: &P::Event) {
        if let Err(e) = pe.on_trigger(event, &self.ctx).await {
            self.settings.metrics.handler_error();
            error!(
                prototype = %self.settings.prototype,
                instance = self.id(),
                kind = ?event.kind(),
                error = %e,
                "trigger handler failed"
            );
        }
    }

    /// Runs the timer handler. Failures are logged.
    pub(crate) async fn on_time(&self) {
        let mut pe = self.pe.lock().await;
        if let Err(e) = pe.on_time(&self.ctx).await {
            self.settings.metrics.handler_error();
            error!(
                prototype = %self.settings.prototype,
                instance = self.id(),
                error = %e,
                "timer handler failed"
            );
        }
    }

    /// Runs the teardown hook.
    pub(crate) async fn teardown(&self) {
        let mut pe = self.pe.lock().await;
        pe.on_remove(&self.ctx).await;
        debug!(prototype = %self.settings.prototype, instance = self.id(), "instance removed");
    }

    /// Requests an asynchronous checkpoint if a safe keeper is configured.
    pub(crate) async fn checkpoint(self: &Arc<Self>) {
        if let Some(keeper) = &self.settings.safe_keeper {
            let target: Arc<dyn Checkpointable> = self.clone();
            keeper.save_state(target).await;
        }
    }

    /// Applies the stored checkpoint, if any. Runs once, while the instance
    /// is being created.
    pub(crate) async fn recover(&self) {
        if !self.settings.checkpointing.is_enabled() {
            return;
        }
        let Some(keeper) = &self.settings.safe_keeper else {
            return;
        };
        let id = self.checkpoint_id();
        let Some(state) = keeper.fetch_serialized_state(&id).await else {
            return;
        };
        match serde_json::from_slice::<P>(&state) {
            Ok(restored) => {
                self.pe.lock().await.restore_state(restored);
                info!(checkpoint_id = %id, "instance state recovered");
            }
            Err(e) => {
                warn!(checkpoint_id = %id, error = %e, "cannot restore checkpoint, starting fresh")
            }
        }
    }
}

#[async_trait]
impl<P: ProcessingElement> Checkpointable for Instance<P> {
    fn checkpoint_id(&self) -> CheckpointId {
        CheckpointId::new(self.settings.prototype.as_ref(), self.id())
    }

    async fn serialize_state(&self, lock_wait: Duration) -> Result<Bytes, CheckpointError> {
        let pe = tokio::time::timeout(lock_wait, self.pe.lock())
            .await
            .map_err(|_| CheckpointError::LockTimeout(lock_wait))?;
        let state =
            serde_json::to_vec(&*pe).map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        self.dirty.store(false, Ordering::Release);
        Ok(Bytes::from(state))
    }
}

impl<P: ProcessingElement> std::fmt::Debug for Instance<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("prototype", &self.settings.prototype)
            .field("id", &self.id())
            .field("event_count", &self.event_count())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
