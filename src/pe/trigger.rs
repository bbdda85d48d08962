//! Count and time based triggers.
//!
//! Policies are registered per [`EventKind`] on the prototype. An event is
//! matched against the policy of its own kind or, failing that, of its
//! nearest ancestor kind. Kinds with no policy anywhere up the hierarchy are
//! remembered as inactive so the walk happens once per concrete kind.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::event::EventKind;

/// When a trigger fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriggerPolicy {
    /// Fire once this many events have arrived since the last fire.
    pub num_events: u64,
    /// Fire when this much time has passed since the last fire. Zero
    /// disables the time condition.
    pub interval: Duration,
}

/// Trigger policies of one prototype.
#[derive(Debug)]
pub struct TriggerRegistry<K: EventKind> {
    policies: HashMap<K, TriggerPolicy>,
    routes: RwLock<HashMap<K, Option<K>>>,
}

impl<K: EventKind> TriggerRegistry<K> {
    pub(crate) fn new(policies: HashMap<K, TriggerPolicy>) -> Self {
        Self {
            policies,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Whether any policy is registered.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Policy registered for exactly `kind`.
    pub fn policy(&self, kind: K) -> Option<&TriggerPolicy> {
        self.policies.get(&kind)
    }

    /// Kind whose policy applies to events of `kind`, or `None` if the
    /// trigger is inactive for it.
    pub fn resolve(&self, kind: K) -> Option<K> {
        if let Some(route) = self.routes.read().get(&kind) {
            return *route;
        }
        let mut current = Some(kind);
        let route = loop {
            match current {
                Some(k) if self.policies.contains_key(&k) => break Some(k),
                Some(k) => current = k.parent(),
                None => break None,
            }
        };
        self.routes.write().insert(kind, route);
        route
    }

    #[cfg(test)]
    fn cached_routes(&self) -> usize {
        self.routes.read().len()
    }
}

#[derive(Clone, Copy, Debug)]
struct TriggerState {
    events_since_fire: u64,
    last_fire: Instant,
}

/// Trigger counters of one instance.
#[derive(Debug)]
pub struct TriggerCounters<K: EventKind> {
    created: Instant,
    states: HashMap<K, TriggerState>,
}

impl<K: EventKind> TriggerCounters<K> {
    /// Counters that treat `created` as the time of the last fire.
    pub fn new(created: Instant) -> Self {
        Self {
            created,
            states: HashMap::new(),
        }
    }

    /// Counts one event against the trigger registered for `kind` and
    /// reports whether it fires. Firing resets the count.
    pub fn check_and_update(&mut self, kind: K, policy: &TriggerPolicy, now: Instant) -> bool {
        let state = self.states.entry(kind).or_insert(TriggerState {
            events_since_fire: 0,
            last_fire: self.created,
        });
        state.events_since_fire += 1;
        let by_count = state.events_since_fire >= policy.num_events;
        let by_time = !policy.interval.is_zero()
            && now.saturating_duration_since(state.last_fire) >= policy.interval;
        if by_count || by_time {
            state.events_since_fire = 0;
            state.last_fire = now;
            true
        } else {
            false
        }
    }
}
