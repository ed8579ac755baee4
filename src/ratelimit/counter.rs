//! Fixed-window request counter.
//!
//! A [`WindowCounter`] tracks one tier's requests for every identity key it
//! has seen. Each key owns a [`CounterEntry`]; the map is sharded so that
//! checks for unrelated keys never contend on a shared lock, while checks for
//! the same key are serialized by the shard guard.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace};

use super::clock::Clock;
use super::rules::MAX_WINDOW_SECS;

/// Errors a counter check can produce.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CounterError {
    /// The counter is tracking as many keys as it is allowed to.
    #[error("counter capacity of {0} keys reached")]
    Capacity(usize),
}

/// Outcome of a single counter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is within the limit
    pub allowed: bool,
    /// Configured maximum for the window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window ends
    pub reset_at: Instant,
    /// Time left until `reset_at`, measured at check time
    pub reset_in: Duration,
}

/// Cap `window` at [`MAX_WINDOW_SECS`] so window arithmetic cannot overflow.
pub(crate) fn bounded_window(window: Duration) -> Duration {
    window.min(Duration::from_secs(MAX_WINDOW_SECS))
}

/// Count of requests for one key within its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// When the current window started
    pub window_start: Instant,
    /// Requests counted in the current window
    pub count: u64,
}

impl CounterEntry {
    /// Start an empty window at `now`.
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    /// Whether the window starting at `window_start` has lapsed at `now`.
    pub fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }

    /// Count one request and decide it.
    ///
    /// The request that first exceeds `limit` is counted; later requests in
    /// the same window are rejected without growing the count further, so
    /// `count` never exceeds `limit + 1`.
    pub fn hit(&mut self, now: Instant, window: Duration, limit: u64) -> Decision {
        let window = bounded_window(window);
        if self.is_expired(now, window) {
            self.window_start = now;
            self.count = 0;
        }

        if self.count <= limit {
            self.count += 1;
        }

        let reset_at = self.window_start + window;
        Decision {
            allowed: self.count <= limit,
            limit,
            remaining: limit.saturating_sub(self.count),
            reset_at,
            reset_in: reset_at.saturating_duration_since(now),
        }
    }
}

/// A fixed-window counter for one tier.
///
/// The counter is thread-safe and is shared by reference across request
/// tasks.
#[derive(Debug)]
pub struct WindowCounter {
    /// Per-key entries
    entries: DashMap<String, CounterEntry>,
    /// Maximum requests per window
    limit: u64,
    /// Window length
    window: Duration,
    /// Soft cap on tracked keys
    max_keys: usize,
    clock: Arc<dyn Clock>,
}

impl WindowCounter {
    /// Create a new counter.
    pub fn new(limit: u64, window: Duration, max_keys: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            limit,
            window: bounded_window(window),
            max_keys,
            clock,
        }
    }

    /// Count a request for `key` and decide it.
    pub fn check(&self, key: &str) -> Result<Decision, CounterError> {
        let now = self.clock.now();

        if let Some(mut entry) = self.entries.get_mut(key) {
            let decision = entry.hit(now, self.window, self.limit);
            trace!(key, count = entry.count, allowed = decision.allowed, "Counter checked");
            return Ok(decision);
        }

        if self.entries.len() >= self.max_keys {
            self.sweep();
            if self.entries.len() >= self.max_keys {
                return Err(CounterError::Capacity(self.max_keys));
            }
        }

        let mut entry = self.entries.entry(key.to_owned()).or_insert_with(|| {
            debug!(key, limit = self.limit, window = ?self.window, "Creating new counter entry");
            CounterEntry::new(now)
        });
        let decision = entry.hit(now, self.window, self.limit);
        trace!(key, count = entry.count, allowed = decision.allowed, "Counter checked");
        Ok(decision)
    }

    /// Current count for `key` in its live window, without counting a request.
    pub fn peek(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now, self.window))
            .map(|entry| entry.count)
    }

    /// Remove entries whose window has lapsed. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now, self.window));
        before.saturating_sub(self.entries.len())
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The limit for this counter.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// The window for this counter.
    pub fn window(&self) -> Duration {
        self.window
    }
}
