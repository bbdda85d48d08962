//! Sliding windows over the events of one instance.
//!
//! A [`SlidingWindow`] is a ring of at most `num_slots` slots. The newest
//! slot is open and absorbs data; when the slot boundary is reached it is
//! closed, a fresh open slot is appended and, once the ring is full, the
//! oldest slot falls off. Boundaries are either periodic (every instance
//! rolls on each tick of the prototype timer) or counted (a slot rolls once
//! it absorbed `slot_capacity` data).
//!
//! [`WindowingPe`] wraps a [`WindowLogic`] into a [`ProcessingElement`]
//! that feeds the window and calls back whenever a slot closes. Register it
//! with [`AppBuilder::add_windowing_prototype`], which sets the prototype
//! timer to the slot duration.
//!
//! [`AppBuilder::add_windowing_prototype`]: crate::app::AppBuilder::add_windowing_prototype
//!
//! # Example
//!
//! ```rust
//! use s4rs::pe::window::{AggregatingSlot, SlidingWindow};
//!
//! let mut window: SlidingWindow<AggregatingSlot<u32>> = SlidingWindow::counted(3, 2);
//! for value in 1..=7 {
//!     window.update_open_slot(value);
//! }
//! let slots: Vec<&[u32]> = window.slots().map(|s| s.data()).collect();
//! assert_eq!(slots, vec![&[4, 5, 6][..], &[7][..]]);
//! ```

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use super::{PeContext, PeError, ProcessingElement};
use crate::event::Event;

/// One bucket of a sliding window.
pub trait Slot: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// What the slot absorbs.
    type Datum: Send;

    /// Absorbs `datum`. Closed slots ignore updates.
    fn update(&mut self, datum: Self::Datum);

    /// Seals the slot.
    fn close(&mut self);
}

/// Keeps every datum it absorbed, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatingSlot<T> {
    data: Vec<T>,
    closed: bool,
}

impl<T> Default for AggregatingSlot<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            closed: false,
        }
    }
}

impl<T> AggregatingSlot<T> {
    /// Data absorbed so far.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Whether the slot was sealed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<T> Slot for AggregatingSlot<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Datum = T;

    fn update(&mut self, datum: T) {
        if !self.closed {
            self.data.push(datum);
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// When the open slot of a window is closed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotBoundary {
    /// Every tick of the prototype timer.
    Periodic(Duration),
    /// After this many data.
    Count(u64),
}

/// Shape of the windows of a windowing prototype.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowConfig {
    /// Slots kept per instance, the open one included.
    pub num_slots: usize,
    /// When slots roll.
    pub boundary: SlotBoundary,
}

impl WindowConfig {
    /// `num_slots` slots of `slot_duration` each.
    pub fn periodic(slot_duration: Duration, num_slots: usize) -> Self {
        Self {
            num_slots,
            boundary: SlotBoundary::Periodic(slot_duration),
        }
    }

    /// `num_slots` slots of `slot_capacity` data each.
    pub fn counted(slot_capacity: u64, num_slots: usize) -> Self {
        Self {
            num_slots,
            boundary: SlotBoundary::Count(slot_capacity),
        }
    }

    /// Rejects empty windows, zero durations and zero capacities.
    pub fn validate(&self) -> Result<(), PeError> {
        if self.num_slots == 0 {
            return Err(PeError::InvalidConfig("a window needs at least one slot".to_string()));
        }
        match self.boundary {
            SlotBoundary::Periodic(duration) if duration.is_zero() => Err(PeError::InvalidConfig(
                "periodic windows need a non-zero slot duration".to_string(),
            )),
            SlotBoundary::Count(0) => Err(PeError::InvalidConfig(
                "counted windows need a slot capacity of at least one".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Empty window of this shape.
    pub fn window<S: Slot>(&self) -> SlidingWindow<S> {
        match self.boundary {
            SlotBoundary::Periodic(_) => SlidingWindow::periodic(self.num_slots),
            SlotBoundary::Count(capacity) => SlidingWindow::counted(capacity, self.num_slots),
        }
    }
}

/// Ring of slots, oldest first; the newest slot is the open one.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct SlidingWindow<S: Slot> {
    num_slots: usize,
    slot_capacity: Option<u64>,
    in_open_slot: u64,
    slots: VecDeque<S>,
}

impl<S: Slot> SlidingWindow<S> {
    /// Window rolled from outside, see [`roll`](Self::roll).
    pub fn periodic(num_slots: usize) -> Self {
        Self::with_capacity(num_slots, None)
    }

    /// Window that rolls after every `slot_capacity` data.
    pub fn counted(slot_capacity: u64, num_slots: usize) -> Self {
        Self::with_capacity(num_slots, Some(slot_capacity.max(1)))
    }

    fn with_capacity(num_slots: usize, slot_capacity: Option<u64>) -> Self {
        let num_slots = num_slots.max(1);
        let mut slots = VecDeque::with_capacity(num_slots);
        slots.push_back(S::default());
        Self {
            num_slots,
            slot_capacity,
            in_open_slot: 0,
            slots,
        }
    }

    /// Maximum number of slots.
    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Whether slots roll on a timer rather than by count.
    pub fn is_periodic(&self) -> bool {
        self.slot_capacity.is_none()
    }

    /// Slots, oldest first, the open slot last.
    pub fn slots(&self) -> impl Iterator<Item = &S> {
        self.slots.iter()
    }

    /// Oldest slot still in the window.
    pub fn oldest_slot(&self) -> Option<&S> {
        self.slots.front()
    }

    /// Slot currently absorbing data.
    pub fn open_slot(&self) -> Option<&S> {
        self.slots.back()
    }

    /// Feeds the open slot. In a counted window this rolls the window once
    /// the open slot is full; returns whether it rolled.
    pub fn update_open_slot(&mut self, datum: S::Datum) -> bool {
        if let Some(open) = self.slots.back_mut() {
            open.update(datum);
        }
        self.in_open_slot += 1;
        match self.slot_capacity {
            Some(capacity) if self.in_open_slot >= capacity => {
                self.roll();
                true
            }
            _ => false,
        }
    }

    /// Closes the open slot and opens a new one. Returns the slot that fell
    /// off the window, if it was full.
    pub fn roll(&mut self) -> Option<S> {
        if let Some(open) = self.slots.back_mut() {
            open.close();
        }
        self.slots.push_back(S::default());
        self.in_open_slot = 0;
        if self.slots.len() > self.num_slots {
            self.slots.pop_front()
        } else {
            None
        }
    }

    /// Takes the slots of a recovered window, keeping this window's shape.
    /// Slots beyond `num_slots` are dropped oldest first.
    pub fn restore(&mut self, restored: Self) {
        self.slots = restored.slots;
        self.in_open_slot = restored.in_open_slot;
        while self.slots.len() > self.num_slots {
            self.slots.pop_front();
        }
        if self.slots.is_empty() {
            self.slots.push_back(S::default());
            self.in_open_slot = 0;
        }
    }
}

/// Application logic of a windowing prototype.
#[async_trait]
pub trait WindowLogic: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Event type consumed and emitted.
    type Event: Event;
    /// Slot type of the window.
    type Slot: Slot;

    /// Datum to record for `event`, if any.
    fn datum(&mut self, event: &Self::Event) -> Option<<Self::Slot as Slot>::Datum>;

    /// Called each time a slot closes, with the window right after the roll.
    async fn on_slot_closed(
        &mut self,
        window: &SlidingWindow<Self::Slot>,
        ctx: &PeContext<Self::Event>,
    ) -> Result<(), PeError>;

    /// Applies the persisted part of recovered logic state, see
    /// [`ProcessingElement::restore_state`].
    fn restore_state(&mut self, restored: Self);
}

/// A processing element keeping a [`SlidingWindow`] per instance.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct WindowingPe<L: WindowLogic> {
    window: SlidingWindow<L::Slot>,
    logic: L,
}

impl<L: WindowLogic> WindowingPe<L> {
    /// Wraps `logic` with an empty window shaped by `config`.
    pub fn new(config: &WindowConfig, logic: L) -> Self {
        Self {
            window: config.window(),
            logic,
        }
    }

    /// The window.
    pub fn window(&self) -> &SlidingWindow<L::Slot> {
        &self.window
    }

    /// The wrapped logic.
    pub fn logic(&self) -> &L {
        &self.logic
    }
}

#[async_trait]
impl<L: WindowLogic> ProcessingElement for WindowingPe<L> {
    type Event = L::Event;

    async fn on_event(
        &mut self,
        event: &Self::Event,
        ctx: &PeContext<Self::Event>,
    ) -> Result<(), PeError> {
        let Some(datum) = self.logic.datum(event) else {
            return Ok(());
        };
        if self.window.update_open_slot(datum) {
            self.logic.on_slot_closed(&self.window, ctx).await?;
        }
        Ok(())
    }

    async fn on_time(&mut self, ctx: &PeContext<Self::Event>) -> Result<(), PeError> {
        if !self.window.is_periodic() {
            return Ok(());
        }
        self.window.roll();
        self.logic.on_slot_closed(&self.window, ctx).await
    }

    fn restore_state(&mut self, restored: Self) {
        self.window.restore(restored.window);
        self.logic.restore_state(restored.logic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointingConfig, InMemoryStateStorage, SafeKeeper};
    use crate::config::CheckpointingSettings;
    use crate::event::{EventHeader, EventKind};
    use crate::metrics::RuntimeMetrics;
    use crate::pe::{Prototype, PrototypeConfig, PrototypeLifecycle};
    use crate::stream::StreamDirectory;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    type Window = SlidingWindow<AggregatingSlot<u32>>;

    fn contents(window: &Window) -> Vec<Vec<u32>> {
        window.slots().map(|slot| slot.data().to_vec()).collect()
    }

    #[test]
    fn periodic_window_keeps_the_newest_slots() {
        let mut window = Window::periodic(3);
        window.update_open_slot(1);
        assert_eq!(window.roll(), None);
        window.update_open_slot(2);
        window.update_open_slot(3);
        assert_eq!(window.roll(), None);
        window.update_open_slot(4);

        let evicted = window.roll().unwrap();
        assert_eq!(evicted.data(), &[1]);
        assert!(evicted.is_closed());
        assert_eq!(contents(&window), vec![vec![2, 3], vec![4], vec![]]);
        assert_eq!(window.oldest_slot().unwrap().data(), &[2, 3]);
        assert!(!window.open_slot().unwrap().is_closed());
    }

    #[test]
    fn counted_window_rolls_when_the_open_slot_fills() {
        let mut window = Window::counted(2, 2);
        assert!(!window.update_open_slot(1));
        assert!(window.update_open_slot(2));
        assert!(!window.update_open_slot(3));
        assert!(window.update_open_slot(4));

        assert_eq!(contents(&window), vec![vec![3, 4], vec![]]);
        assert!(!window.is_periodic());
    }

    #[test]
    fn closed_slots_ignore_updates() {
        let mut slot: AggregatingSlot<String> = AggregatingSlot::default();
        slot.update("a".to_string());
        slot.close();
        slot.update("b".to_string());
        assert_eq!(slot.data(), &["a".to_string()]);
    }

    #[test]
    fn restore_trims_to_the_configured_size() {
        let mut recovered = Window::periodic(4);
        for value in 0..4 {
            recovered.update_open_slot(value);
            recovered.roll();
        }
        let json = serde_json::to_vec(&recovered).unwrap();

        let mut window = Window::periodic(2);
        window.restore(serde_json::from_slice(&json).unwrap());

        assert_eq!(window.num_slots(), 2);
        assert_eq!(contents(&window), vec![vec![3], vec![]]);
    }

    #[test]
    fn invalid_shapes_are_rejected() {
        assert!(WindowConfig::periodic(Duration::from_secs(1), 3).validate().is_ok());
        assert!(WindowConfig::counted(5, 1).validate().is_ok());
        for config in [
            WindowConfig::periodic(Duration::ZERO, 3),
            WindowConfig::counted(0, 3),
            WindowConfig::counted(5, 0),
        ] {
            assert!(matches!(config.validate(), Err(PeError::InvalidConfig(_))), "{:?}", config);
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    struct Sample;

    impl EventKind for Sample {
        fn parent(&self) -> Option<Self> {
            None
        }
    }

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Reading {
        header: EventHeader,
        value: u32,
    }

    impl Event for Reading {
        type Kind = Sample;

        fn kind(&self) -> Sample {
            Sample
        }

        fn header(&self) -> &EventHeader {
            &self.header
        }

        fn header_mut(&mut self) -> &mut EventHeader {
            &mut self.header
        }
    }

    fn reading(value: u32) -> Reading {
        Reading {
            header: EventHeader::now(),
            value,
        }
    }

    /// Sums the window every time a slot closes.
    #[derive(Default, Serialize, Deserialize)]
    struct MovingSum {
        sums: Vec<u32>,
    }

    #[async_trait]
    impl WindowLogic for MovingSum {
        type Event = Reading;
        type Slot = AggregatingSlot<u32>;

        fn datum(&mut self, event: &Reading) -> Option<u32> {
            (event.value > 0).then_some(event.value)
        }

        async fn on_slot_closed(
            &mut self,
            window: &SlidingWindow<Self::Slot>,
            _ctx: &PeContext<Reading>,
        ) -> Result<(), PeError> {
            self.sums.push(window.slots().flat_map(|slot| slot.data()).sum());
            Ok(())
        }

        fn restore_state(&mut self, restored: Self) {
            self.sums = restored.sums;
        }
    }

    fn windowing(
        window: WindowConfig,
        prototype: PrototypeConfig<Sample>,
        safe_keeper: Option<Arc<SafeKeeper>>,
    ) -> Arc<Prototype<WindowingPe<MovingSum>>> {
        Arc::new(Prototype::new(
            prototype,
            move |_key| WindowingPe::new(&window, MovingSum::default()),
            StreamDirectory::default(),
            safe_keeper,
            Arc::new(RuntimeMetrics::new()),
        ))
    }

    #[tokio::test]
    async fn counted_windowing_pe_evaluates_on_each_full_slot() {
        let proto = windowing(WindowConfig::counted(2, 3), PrototypeConfig::new("sum"), None);
        let instance = proto.get_instance_for_key("s1").await.unwrap();

        for value in [1, 0, 2, 3, 4, 5, 6] {
            instance.handle_input_event(&reading(value)).await;
        }

        let (sums, open) = instance
            .with_state(|pe| {
                let open = pe.window().open_slot().unwrap().data().to_vec();
                (pe.logic().sums.clone(), open)
            })
            .await;
        assert_eq!(sums, vec![3, 10, 18]);
        assert!(open.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_windowing_pe_rolls_on_the_prototype_timer() {
        let slot = Duration::from_millis(100);
        let proto = windowing(
            WindowConfig::periodic(slot, 4),
            PrototypeConfig::new("sum").timer(slot),
            None,
        );
        let instance = proto.get_instance_for_key("s1").await.unwrap();
        instance.handle_input_event(&reading(5)).await;
        proto.clone().start(CancellationToken::new()).await.unwrap();

        // The first tick is immediate; two more follow within 250ms.
        tokio::time::sleep(Duration::from_millis(250)).await;
        instance.handle_input_event(&reading(7)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        proto.remove_all().await;

        let sums = instance.with_state(|pe| pe.logic().sums.clone()).await;
        assert_eq!(sums, vec![5, 5, 5, 7]);
    }

    #[tokio::test]
    async fn window_contents_survive_recovery() {
        let storage = Arc::new(InMemoryStateStorage::new());
        let keeper = Arc::new(SafeKeeper::new(
            storage.clone(),
            &CheckpointingSettings::default(),
            Arc::new(RuntimeMetrics::new()),
        ));
        let checkpointing = CheckpointingConfig::every_events(3);
        let config = || PrototypeConfig::new("sum").checkpointing(checkpointing);

        let first = windowing(WindowConfig::counted(2, 3), config(), Some(keeper.clone()));
        let instance = first.get_instance_for_key("s1").await.unwrap();
        for value in [1, 2, 3] {
            instance.handle_input_event(&reading(value)).await;
        }
        keeper.shutdown().await;
        assert_eq!(storage.len(), 1);

        let keeper = Arc::new(SafeKeeper::new(
            storage,
            &CheckpointingSettings::default(),
            Arc::new(RuntimeMetrics::new()),
        ));
        let second = windowing(WindowConfig::counted(2, 3), config(), Some(keeper));
        let recovered = second.get_instance_for_key("s1").await.unwrap();
        recovered.handle_input_event(&reading(4)).await;

        let sums = recovered.with_state(|pe| pe.logic().sums.clone()).await;
        assert_eq!(sums, vec![3, 10]);
    }
}
