//! Replay guard - bounded seen-ids cache.
//!
//! Makes envelope verification idempotent within a time window: an id is
//! accepted at most once, stale and far-future timestamps are refused, and
//! the cache is pruned window-first then oldest-first when full.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::types::{Error, Result};

/// Accepted clock skew into the future.
const MAX_FUTURE_SKEW_MS: i64 = 5_000;

/// Default bound on cached message ids.
const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Default)]
struct ReplayState {
    seen: HashMap<String, DateTime<Utc>>,
    // Arrival order, oldest at the front.
    order: VecDeque<String>,
}

/// Bounded ordered map from message id to arrival time.
///
/// Mutated by every dispatch; guarded by a mutex per the shared-resource
/// rules of the concurrency model.
#[derive(Debug)]
pub struct ReplayGuard {
    window: Duration,
    max_entries: usize,
    state: Mutex<ReplayState>,
}

impl ReplayGuard {
    pub fn new(window_ms: u64) -> Self {
        Self::with_capacity(window_ms, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(window_ms: u64, max_entries: usize) -> Self {
        Self {
            window: Duration::milliseconds(window_ms as i64),
            max_entries: max_entries.max(1),
            state: Mutex::new(ReplayState::default()),
        }
    }

    /// Accept or refuse a message id with the envelope's claimed timestamp.
    ///
    /// Refused when (a) the id has been seen, (b) the timestamp is older
    /// than the replay window, or (c) the timestamp is more than 5 s in
    /// the future.
    pub fn check(&self, message_id: &str, timestamp: DateTime<Utc>) -> Result<()> {
        let now = Utc::now();

        if timestamp < now - self.window {
            return Err(Error::auth(format!(
                "message {} timestamp outside replay window",
                message_id
            )));
        }
        if timestamp > now + Duration::milliseconds(MAX_FUTURE_SKEW_MS) {
            return Err(Error::auth(format!(
                "message {} timestamp too far in the future",
                message_id
            )));
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::internal("replay guard lock poisoned"))?;

        if state.seen.contains_key(message_id) {
            return Err(Error::auth(format!(
                "message {} already seen within replay window",
                message_id
            )));
        }

        state.seen.insert(message_id.to_string(), now);
        state.order.push_back(message_id.to_string());

        if state.seen.len() > self.max_entries {
            self.prune(&mut state, now);
        }
        Ok(())
    }

    /// Window-first pruning, then oldest-first eviction down to the bound.
    fn prune(&self, state: &mut ReplayState, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while let Some(front) = state.order.front() {
            let expired = state
                .seen
                .get(front)
                .map(|arrived| *arrived < cutoff)
                .unwrap_or(true);
            if !expired {
                break;
            }
            if let Some(id) = state.order.pop_front() {
                state.seen.remove(&id);
            }
        }
        while state.seen.len() > self.max_entries {
            match state.order.pop_front() {
                Some(id) => {
                    state.seen.remove(&id);
                }
                None => break,
            }
        }
    }

    /// Number of ids currently cached.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.seen.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_seen_accepted_second_refused() {
        let guard = ReplayGuard::new(60_000);
        let now = Utc::now();

        assert!(guard.check("msg_1", now).is_ok());
        let err = guard.check("msg_1", now).unwrap_err();
        assert!(err.to_string().contains("already seen"));
    }

    #[test]
    fn test_stale_timestamp_refused() {
        let guard = ReplayGuard::new(60_000);
        let stale = Utc::now() - Duration::milliseconds(61_000);
        assert!(guard.check("msg_old", stale).is_err());
    }

    #[test]
    fn test_future_timestamp_refused() {
        let guard = ReplayGuard::new(60_000);
        let future = Utc::now() + Duration::milliseconds(6_000);
        assert!(guard.check("msg_future", future).is_err());

        // Within the 5s skew is fine.
        let near_future = Utc::now() + Duration::milliseconds(3_000);
        assert!(guard.check("msg_near", near_future).is_ok());
    }

    #[test]
    fn test_distinct_ids_accepted() {
        let guard = ReplayGuard::new(60_000);
        let now = Utc::now();
        for i in 0..100 {
            assert!(guard.check(&format!("msg_{}", i), now).is_ok());
        }
        assert_eq!(guard.len(), 100);
    }

    #[test]
    fn test_eviction_at_capacity() {
        let guard = ReplayGuard::with_capacity(60_000, 10);
        let now = Utc::now();
        for i in 0..25 {
            guard.check(&format!("msg_{}", i), now).unwrap();
        }
        // All entries are within the window, so the oldest were evicted.
        assert!(guard.len() <= 10);

        // An evicted id would be accepted again; the newest is still cached.
        assert!(guard.check("msg_24", now).is_err());
    }
}
