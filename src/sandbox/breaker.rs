//! Per-gear circuit breaker.
//!
//! A rolling window of failure timestamps per gear. The breaker opens
//! when failures within the window reach the threshold; while open,
//! executions short-circuit. Once the window has elapsed it half-opens:
//! the next execution is allowed through, a success closes the breaker,
//! a failure re-opens it.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::warn;

use crate::dag::CircuitProbe;

#[derive(Debug, Default)]
struct GearWindow {
    failures: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
}

/// Rolling-window circuit breaker keyed by gear id.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    window: Duration,
    state: Mutex<HashMap<String, GearWindow>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, window_ms: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            window: Duration::milliseconds(window_ms as i64),
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_failure(&self, gear_id: &str) {
        let now = Utc::now();
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let window = state.entry(gear_id.to_string()).or_default();

        let cutoff = now - self.window;
        while window.failures.front().is_some_and(|ts| *ts < cutoff) {
            window.failures.pop_front();
        }
        window.failures.push_back(now);

        if window.failures.len() >= self.threshold as usize {
            if window.opened_at.is_none() {
                warn!(gear_id, failures = window.failures.len(), "circuit breaker opened");
            }
            window.opened_at = Some(now);
        }
    }

    /// A success in the half-open window closes the breaker fully.
    pub fn record_success(&self, gear_id: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(window) = state.get_mut(gear_id) {
            if window.opened_at.is_some() {
                window.opened_at = None;
                window.failures.clear();
            }
        }
    }

    /// Open while the window since opening has not elapsed; half-open
    /// (reported closed, next attempt allowed) afterwards.
    pub fn is_open(&self, gear_id: &str) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        state
            .get(gear_id)
            .and_then(|w| w.opened_at)
            .is_some_and(|opened| Utc::now() < opened + self.window)
    }
}

impl CircuitProbe for CircuitBreaker {
    fn is_open(&self, plugin: &str) -> bool {
        CircuitBreaker::is_open(self, plugin)
    }
}
