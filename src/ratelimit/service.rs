//! The admission control service.

use std::sync::Arc;

use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::dispatcher::TierDispatcher;
use super::escalation::{EscalationController, EscalationLevel};
use super::outcome::{tighter, AdmissionResult, Rejection, SUSPICIOUS_ACTIVITY_LIMIT};
use super::request::RequestMeta;
use super::risk::RiskScorer;
use super::rules::TierTable;
use crate::audit::{RejectionRecord, SinkSet};
use crate::config::{EscalationConfig, GatekeeperConfig};
use crate::error::Result;

/// Owns all admission state: tier counters and escalations.
///
/// Constructed once at startup and shared through an `Arc`.
#[derive(Debug)]
pub struct AdmissionControlService {
    dispatcher: TierDispatcher,
    escalation: EscalationController,
    sinks: SinkSet,
}

impl AdmissionControlService {
    /// Assemble a service from its parts.
    pub fn new(
        table: TierTable,
        escalation: EscalationConfig,
        scorer: Arc<dyn RiskScorer>,
        sinks: SinkSet,
        max_keys_per_tier: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dispatcher: TierDispatcher::new(table, max_keys_per_tier, Arc::clone(&clock), sinks.clone()),
            escalation: EscalationController::new(scorer, escalation, clock),
            sinks,
        }
    }

    /// Build a service from configuration using the system clock.
    pub fn from_config(config: &GatekeeperConfig, scorer: Arc<dyn RiskScorer>, sinks: SinkSet) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            config.tier_table()?,
            config.escalation.clone(),
            scorer,
            sinks,
            config.server.max_keys_per_tier,
            Arc::new(SystemClock::new()),
        ))
    }

    /// Decide whether a request may proceed.
    ///
    /// Static tiers are checked first. Authenticated requests that pass them
    /// are then charged to the user's escalated counter, if the risk scorer
    /// puts the user at an elevated level. When the scorer cannot answer the
    /// request is decided by the static tiers alone.
    pub async fn admit(&self, request: &RequestMeta) -> AdmissionResult {
        let result = self.dispatcher.admit(request);
        if !result.allowed || !self.escalation.is_enabled() {
            return result;
        }
        let Some(user_id) = request.user() else {
            return result;
        };

        let level = match self.escalation.evaluate(user_id).await {
            Ok(level) => level,
            Err(_) => return result,
        };
        trace!(user_id, level = %level, "Escalation evaluated");
        if level == EscalationLevel::None {
            return result;
        }

        match self.escalation.enforce(user_id) {
            Some(outcome) if !outcome.decision.allowed => {
                debug!(user_id, level = %outcome.level, "Escalated limit exceeded");
                self.sinks.emit(&RejectionRecord::now(
                    SUSPICIOUS_ACTIVITY_LIMIT,
                    user_id,
                    &request.method,
                    &request.path,
                ));
                AdmissionResult::rejected(Rejection::suspicious_activity(
                    outcome.level,
                    self.escalation.message(),
                    &self.escalation.retry_after_label(),
                    outcome.decision,
                ))
            }
            Some(outcome) => AdmissionResult::allowed(tighter(result.quota, outcome.decision)),
            None => result,
        }
    }

    /// Escalation level currently in force for a user.
    pub fn escalation_level(&self, user_id: &str) -> EscalationLevel {
        self.escalation.active_level(user_id)
    }

    /// Drop lapsed counters and escalations.
    pub fn sweep(&self) -> usize {
        let removed = self.dispatcher.sweep() + self.escalation.sweep();
        debug!(removed, tracked = self.dispatcher.tracked_keys(), "Swept admission state");
        removed
    }

    /// The static tier dispatcher.
    pub fn dispatcher(&self) -> &TierDispatcher {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecentRejections;
    use crate::error::CollaboratorError;
    use crate::ratelimit::clock::MockClock;
    use crate::ratelimit::outcome::RejectionKind;
    use crate::ratelimit::risk::{ActivityStats, InMemoryRiskScores};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct FailingScorer;

    #[async_trait]
    impl RiskScorer for FailingScorer {
        async fn user_activity_stats(&self, _user_id: &str) -> std::result::Result<Option<ActivityStats>, CollaboratorError> {
            Err(CollaboratorError::Unavailable("engine down".to_string()))
        }
    }

    /// Answers from an in-memory table until switched into an outage.
    struct OutageScorer {
        scores: InMemoryRiskScores,
        down: AtomicBool,
    }

    #[async_trait]
    impl RiskScorer for OutageScorer {
        async fn user_activity_stats(&self, user_id: &str) -> std::result::Result<Option<ActivityStats>, CollaboratorError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(CollaboratorError::Unavailable("engine down".to_string()));
            }
            self.scores.user_activity_stats(user_id).await
        }
    }

    struct Harness {
        service: AdmissionControlService,
        scores: Arc<InMemoryRiskScores>,
        recent: Arc<RecentRejections>,
        clock: MockClock,
    }

    fn harness() -> Harness {
        let scores = Arc::new(InMemoryRiskScores::new());
        let recent = Arc::new(RecentRejections::new(32));
        let clock = MockClock::default();
        let service = AdmissionControlService::new(
            TierTable::default(),
            EscalationConfig::default(),
            scores.clone(),
            SinkSet::new().with(recent.clone()),
            1_000,
            Arc::new(clock.clone()),
        );
        Harness {
            service,
            scores,
            recent,
            clock,
        }
    }

    #[tokio::test]
    async fn test_critical_risk_overrides_static_tiers() {
        let h = harness();
        h.scores.set("u1", 75);
        let request = RequestMeta::new("GET", "/api/files").with_user("u1");

        for _ in 0..5 {
            let result = h.service.admit(&request).await;
            assert!(result.allowed);
        }

        let result = h.service.admit(&request).await;
        assert!(!result.allowed);
        let rejection = result.rejection.unwrap();
        assert_eq!(
            rejection.kind,
            RejectionKind::SuspiciousActivity {
                level: EscalationLevel::Critical
            }
        );
        assert_eq!(rejection.limit_type(), "suspicious_activity");
        assert_eq!(rejection.retry_after, "1 minute");
        assert!(rejection.message.contains("Suspicious activity"));

        let records = h.recent.snapshot();
        assert_eq!(records[0].tier, "suspicious_activity");
        assert_eq!(records[0].key, "u1");
    }

    #[tokio::test]
    async fn test_low_risk_uses_static_tiers_only() {
        let h = harness();
        h.scores.set("u1", 10);
        let request = RequestMeta::new("GET", "/api/files").with_user("u1");

        for _ in 0..100 {
            assert!(h.service.admit(&request).await.allowed);
        }
        let result = h.service.admit(&request).await;
        assert_eq!(result.violated_tier(), Some("general"));
    }

    #[tokio::test]
    async fn test_moderate_quota_is_reported() {
        let h = harness();
        h.scores.set("u1", 55);
        let request = RequestMeta::new("GET", "/api/files").with_user("u1");

        let result = h.service.admit(&request).await;
        let quota = result.quota.unwrap();
        assert_eq!(quota.limit, 20);
        assert_eq!(quota.remaining, 19);
        assert_eq!(h.service.escalation_level("u1"), EscalationLevel::Moderate);
    }

    #[tokio::test]
    async fn test_scorer_failure_falls_back_to_static_tiers() {
        let service = AdmissionControlService::new(
            TierTable::default(),
            EscalationConfig::default(),
            Arc::new(FailingScorer),
            SinkSet::new(),
            1_000,
            Arc::new(MockClock::default()),
        );
        let request = RequestMeta::new("POST", "/api/upload").with_user("u1");

        for _ in 0..5 {
            assert!(service.admit(&request).await.allowed);
        }
        assert_eq!(service.admit(&request).await.violated_tier(), Some("upload"));
    }

    #[tokio::test]
    async fn test_scorer_outage_ignores_active_escalation() {
        let scorer = Arc::new(OutageScorer {
            scores: InMemoryRiskScores::new(),
            down: AtomicBool::new(false),
        });
        scorer.scores.set("u1", 75);
        let service = AdmissionControlService::new(
            TierTable::default(),
            EscalationConfig::default(),
            scorer.clone(),
            SinkSet::new(),
            1_000,
            Arc::new(MockClock::default()),
        );
        let request = RequestMeta::new("GET", "/api/files").with_user("u1");

        for _ in 0..5 {
            assert!(service.admit(&request).await.allowed);
        }

        scorer.down.store(true, Ordering::SeqCst);
        let result = service.admit(&request).await;
        assert!(result.allowed);
        assert_eq!(result.quota.unwrap().limit, 100);
        assert_eq!(service.escalation_level("u1"), EscalationLevel::Critical);

        // The retained counter applies again once the scorer answers.
        scorer.down.store(false, Ordering::SeqCst);
        let result = service.admit(&request).await;
        assert_eq!(result.violated_tier(), Some(SUSPICIOUS_ACTIVITY_LIMIT));
    }

    #[tokio::test]
    async fn test_anonymous_requests_skip_escalation() {
        let h = harness();
        h.scores.set("anonymous", 100);
        let request = RequestMeta::new("GET", "/api/files");

        for _ in 0..10 {
            assert!(h.service.admit(&request).await.allowed);
        }
    }

    #[tokio::test]
    async fn test_static_rejection_skips_escalation() {
        let h = harness();
        let request = RequestMeta::new("POST", "/api/upload").with_user("u1");
        for _ in 0..5 {
            h.service.admit(&request).await;
        }

        h.scores.set("u1", 90);
        let result = h.service.admit(&request).await;
        assert_eq!(result.violated_tier(), Some("upload"));
        assert_eq!(h.service.escalation_level("u1"), EscalationLevel::None);
    }

    #[tokio::test]
    async fn test_disabled_escalation() {
        let mut escalation = EscalationConfig::default();
        escalation.enabled = false;
        let scores = Arc::new(InMemoryRiskScores::new());
        scores.set("u1", 100);
        let service = AdmissionControlService::new(
            TierTable::default(),
            escalation,
            scores,
            SinkSet::new(),
            1_000,
            Arc::new(MockClock::default()),
        );

        let request = RequestMeta::new("GET", "/api/files").with_user("u1");
        for _ in 0..10 {
            assert!(service.admit(&request).await.allowed);
        }
    }

    #[tokio::test]
    async fn test_sweep_after_windows_lapse() {
        let h = harness();
        h.scores.set("u1", 80);
        h.service
            .admit(&RequestMeta::new("GET", "/api/files").with_user("u1"))
            .await;

        h.clock.advance(Duration::from_secs(60));
        // general counter + escalation state
        assert_eq!(h.service.sweep(), 2);
    }

    #[tokio::test]
    async fn test_from_config_applies_overrides() {
        let mut config = GatekeeperConfig::default();
        config.limits = HashMap::from([(
            "general".to_string(),
            crate::ratelimit::LimitOverride {
                window_secs: None,
                max_requests: Some(2),
            },
        )]);
        let service = AdmissionControlService::from_config(
            &config,
            Arc::new(InMemoryRiskScores::new()),
            SinkSet::new(),
        )
        .unwrap();

        let request = RequestMeta::new("GET", "/api/files").with_ip("8.8.8.8");
        assert!(service.admit(&request).await.allowed);
        assert!(service.admit(&request).await.allowed);
        assert!(!service.admit(&request).await.allowed);
    }
}
