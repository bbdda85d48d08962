//! Circuit breaker for state fetches.
//!
//! After `max_consecutive_failures` failed fetches in a row the breaker opens
//! and fetching is skipped for `disabled_duration`. The first fetch attempted
//! after the cooldown closes it again with a zeroed failure count.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct FetchCircuitBreaker {
    max_consecutive_failures: u32,
    disabled_duration: Duration,
    state: Mutex<BreakerState>,
}

impl FetchCircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(max_consecutive_failures: u32, disabled_duration: Duration) -> Self {
        Self {
            max_consecutive_failures: max_consecutive_failures.max(1),
            disabled_duration,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a fetch may proceed now. Closes the breaker if the cooldown
    /// has elapsed.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match state.opened_at {
            None => true,
            Some(opened_at) if opened_at.elapsed() >= self.disabled_duration => {
                info!("fetch cooldown elapsed, re-enabling checkpoint fetching");
                state.opened_at = None;
                state.consecutive_failures = 0;
                true
            }
            Some(_) => false,
        }
    }

    /// Records a successful fetch.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    /// Records a failed fetch. Returns `true` when this failure opened the
    /// breaker.
    pub fn record_failure(&self) -> bool {
        let mut state = self.state.lock();
        if state.opened_at.is_some() {
            return false;
        }
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.max_consecutive_failures {
            state.opened_at = Some(Instant::now());
            warn!(
                failures = state.consecutive_failures,
                disabled_ms = self.disabled_duration.as_millis() as u64,
                "too many consecutive fetch failures, checkpoint fetching disabled"
            );
            return true;
        }
        false
    }

    /// Failures since the last success or reset.
    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Whether fetching is currently disabled. Does not close the breaker.
    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .opened_at
            .is_some_and(|opened_at| opened_at.elapsed() < self.disabled_duration)
    }
}
