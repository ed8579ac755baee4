//! Tier dispatcher: the static part of admission control.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::clock::Clock;
use super::counter::WindowCounter;
use super::outcome::{tighter, AdmissionResult, Rejection};
use super::request::RequestMeta;
use super::rules::{FailMode, TierTable};
use crate::audit::{RejectionRecord, SinkSet};

/// Runs a request through every applicable tier.
///
/// Tiers are evaluated in table order and the request is admitted only if
/// every applicable tier admits it. Evaluation stops at the first violation.
///
/// A counter that cannot answer never fails the request path: with
/// [`FailMode::Open`] (the default) the tier is skipped with a warning.
#[derive(Debug)]
pub struct TierDispatcher {
    table: TierTable,
    /// One counter per tier, same order as the table
    counters: Vec<WindowCounter>,
    sinks: SinkSet,
}

impl TierDispatcher {
    /// Create counters for every tier in `table`.
    pub fn new(table: TierTable, max_keys: usize, clock: Arc<dyn Clock>, sinks: SinkSet) -> Self {
        let counters = table
            .tiers()
            .iter()
            .map(|tier| {
                debug!(
                    tier = %tier.name,
                    limit = tier.max_requests,
                    window_secs = tier.window_secs,
                    "Creating tier counter"
                );
                WindowCounter::new(tier.max_requests, tier.window(), max_keys, Arc::clone(&clock))
            })
            .collect();

        Self {
            table,
            counters,
            sinks,
        }
    }

    /// Decide a request against the static tiers.
    pub fn admit(&self, request: &RequestMeta) -> AdmissionResult {
        let mut quota = None;

        for (tier, counter) in self.table.tiers().iter().zip(&self.counters) {
            if !tier.applies(request) {
                continue;
            }

            let key = tier.key.resolve(request);
            trace!(tier = %tier.name, key = %key, "Checking tier");

            match counter.check(&key) {
                Ok(decision) if decision.allowed => {
                    quota = tighter(quota, decision);
                }
                Ok(decision) => {
                    debug!(tier = %tier.name, key = %key, "Tier limit exceeded");
                    self.sinks
                        .emit(&RejectionRecord::now(&tier.name, &key, &request.method, &request.path));
                    return AdmissionResult::rejected(Rejection::limit_exceeded(tier, Some(decision)));
                }
                Err(e) => match tier.fail_mode {
                    FailMode::Open => {
                        warn!(tier = %tier.name, key = %key, error = %e, "Tier counter failed, failing open");
                    }
                    FailMode::Closed => {
                        warn!(tier = %tier.name, key = %key, error = %e, "Tier counter failed, failing closed");
                        self.sinks
                            .emit(&RejectionRecord::now(&tier.name, &key, &request.method, &request.path));
                        return AdmissionResult::rejected(Rejection::limit_exceeded(tier, None));
                    }
                },
            }
        }

        AdmissionResult::allowed(quota)
    }

    /// Current count for `key` in tier `tier`.
    pub fn counter_value(&self, tier: &str, key: &str) -> Option<u64> {
        self.table
            .position(tier)
            .and_then(|index| self.counters[index].peek(key))
    }

    /// Drop lapsed counter entries in every tier.
    pub fn sweep(&self) -> usize {
        self.counters.iter().map(WindowCounter::sweep).sum()
    }

    /// Number of keys tracked across all tiers.
    pub fn tracked_keys(&self) -> usize {
        self.counters.iter().map(WindowCounter::len).sum()
    }

    /// The tier table.
    pub fn table(&self) -> &TierTable {
        &self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecentRejections;
    use crate::ratelimit::clock::MockClock;
    use crate::ratelimit::rules::{default_tiers, Tier};
    use std::collections::HashMap;
    use std::time::Duration;

    fn dispatcher_with(tiers: Vec<Tier>, max_keys: usize) -> (TierDispatcher, MockClock, Arc<RecentRejections>) {
        let clock = MockClock::default();
        let recent = Arc::new(RecentRejections::new(16));
        let table = TierTable::new(tiers, &HashMap::new()).unwrap();
        let dispatcher = TierDispatcher::new(
            table,
            max_keys,
            Arc::new(clock.clone()),
            SinkSet::new().with(recent.clone()),
        );
        (dispatcher, clock, recent)
    }

    fn dispatcher() -> (TierDispatcher, MockClock, Arc<RecentRejections>) {
        dispatcher_with(default_tiers(), 10_000)
    }

    #[test]
    fn test_exempt_path_is_not_counted() {
        let (dispatcher, _, _) = dispatcher();
        let request = RequestMeta::new("GET", "/health").with_ip("10.0.0.1");

        let result = dispatcher.admit(&request);
        assert!(result.allowed);
        assert_eq!(result.quota, None);
        assert_eq!(dispatcher.tracked_keys(), 0);
    }

    #[test]
    fn test_upload_tier_rejects_sixth_request() {
        let (dispatcher, clock, recent) = dispatcher();
        let request = RequestMeta::new("POST", "/api/upload").with_user("userA");

        for expected in [4, 3, 2, 1, 0] {
            let result = dispatcher.admit(&request);
            assert!(result.allowed);
            assert_eq!(result.quota.unwrap().remaining, expected);
        }

        let result = dispatcher.admit(&request);
        assert!(!result.allowed);
        assert_eq!(result.violated_tier(), Some("upload"));
        assert_eq!(result.retry_after(), Some("5 minutes"));

        let records = recent.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tier, "upload");
        assert_eq!(records[0].key, "userA");
        assert_eq!(records[0].method, "POST");

        clock.advance(Duration::from_secs(300));
        assert!(dispatcher.admit(&request).allowed);
    }

    #[test]
    fn test_general_and_sensitive_are_anded() {
        let mut tiers = default_tiers();
        tiers[0].max_requests = 3;
        let (dispatcher, _, _) = dispatcher_with(tiers, 10_000);

        // Exhaust general on a non-sensitive path.
        for _ in 0..3 {
            assert!(dispatcher.admit(&RequestMeta::new("GET", "/api/files").with_ip("9.9.9.9")).allowed);
        }

        // Sensitive has headroom, general does not.
        let result = dispatcher.admit(&RequestMeta::new("GET", "/api/admin/stats").with_ip("9.9.9.9"));
        assert!(!result.allowed);
        assert_eq!(result.violated_tier(), Some("general"));
        assert_eq!(dispatcher.counter_value("sensitive", "9.9.9.9"), None);
    }

    #[test]
    fn test_sensitive_rejects_when_general_has_headroom() {
        let (dispatcher, _, _) = dispatcher();
        let request = RequestMeta::new("POST", "/api/moderation/act").with_user("mod-1");

        for _ in 0..20 {
            assert!(dispatcher.admit(&request).allowed);
        }
        let result = dispatcher.admit(&request);
        assert!(!result.allowed);
        assert_eq!(result.violated_tier(), Some("sensitive"));
        assert_eq!(dispatcher.counter_value("general", "mod-1"), Some(21));
    }

    #[test]
    fn test_login_keys_are_per_account() {
        let (dispatcher, _, _) = dispatcher();
        let login = |email: &str| {
            RequestMeta::new("POST", "/api/auth/login")
                .with_ip("1.2.3.4")
                .with_field("email", email)
        };

        for _ in 0..5 {
            assert!(dispatcher.admit(&login("a@x.com")).allowed);
        }
        let result = dispatcher.admit(&login("a@x.com"));
        assert_eq!(result.violated_tier(), Some("login"));
        assert_eq!(result.retry_after(), Some("10 minutes"));

        assert!(dispatcher.admit(&login("b@x.com")).allowed);
        assert_eq!(dispatcher.counter_value("login", "1.2.3.4:b@x.com"), Some(1));
    }

    #[test]
    fn test_quota_reports_tightest_tier() {
        let (dispatcher, _, _) = dispatcher();
        let request = RequestMeta::new("PUT", "/api/users/profile").with_user("u1");

        let result = dispatcher.admit(&request);
        let quota = result.quota.unwrap();
        assert_eq!(quota.limit, 3);
        assert_eq!(quota.remaining, 2);
    }

    #[test]
    fn test_counter_failure_fails_open() {
        let (dispatcher, _, recent) = dispatcher_with(default_tiers(), 1);

        assert!(dispatcher.admit(&RequestMeta::new("GET", "/api/files").with_ip("1.1.1.1")).allowed);
        // The general counter is full; a new client is let through.
        let result = dispatcher.admit(&RequestMeta::new("GET", "/api/files").with_ip("2.2.2.2"));
        assert!(result.allowed);
        assert!(recent.is_empty());
    }

    #[test]
    fn test_counter_failure_fails_closed_when_configured() {
        let mut tiers = default_tiers();
        tiers[0].fail_mode = FailMode::Closed;
        let (dispatcher, _, recent) = dispatcher_with(tiers, 1);

        assert!(dispatcher.admit(&RequestMeta::new("GET", "/api/files").with_ip("1.1.1.1")).allowed);
        let result = dispatcher.admit(&RequestMeta::new("GET", "/api/files").with_ip("2.2.2.2"));
        assert!(!result.allowed);
        assert_eq!(result.violated_tier(), Some("general"));
        assert_eq!(result.quota, None);
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn test_sweep_clears_lapsed_entries() {
        let (dispatcher, clock, _) = dispatcher();
        dispatcher.admit(&RequestMeta::new("POST", "/api/upload").with_ip("3.3.3.3"));
        assert_eq!(dispatcher.tracked_keys(), 2);

        clock.advance(Duration::from_secs(60));
        assert_eq!(dispatcher.sweep(), 1);
        clock.advance(Duration::from_secs(240));
        assert_eq!(dispatcher.sweep(), 1);
        assert_eq!(dispatcher.tracked_keys(), 0);
    }
}
