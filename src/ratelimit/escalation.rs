//! Risk-driven escalation of per-user limits.
//!
//! After authentication, the controller asks the risk scorer about the user
//! and maps the score to an [`EscalationLevel`]. An elevated level installs a
//! stricter per-user fixed-window counter that applies on top of the static
//! tiers until its window lapses. The scorer is a defense-in-depth signal:
//! when it fails, times out or panics the user is treated as not escalated.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::counter::{bounded_window, CounterEntry, Decision};
use super::risk::{ActivityStats, RiskScorer};
use super::rules::humanize_window;
use crate::config::EscalationConfig;
use crate::error::CollaboratorError;

/// How much a user's limits are tightened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationLevel {
    /// Static tiers only
    #[default]
    None,
    /// Moderate risk
    Moderate,
    /// Critical risk
    Critical,
}

impl EscalationLevel {
    /// Lowercase name for logs and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationLevel::None => "none",
            EscalationLevel::Moderate => "moderate",
            EscalationLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Active escalation for one user.
#[derive(Debug, Clone, Copy)]
pub struct EscalationState {
    /// Level the counter was installed for
    pub level: EscalationLevel,
    /// The elevated counter
    pub entry: CounterEntry,
    /// When the state stops applying
    pub expires_at: Instant,
}

impl EscalationState {
    fn new(level: EscalationLevel, now: Instant, window: Duration) -> Self {
        Self {
            level,
            entry: CounterEntry::new(now),
            expires_at: now + bounded_window(window),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Result of charging a request to a user's elevated counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationDecision {
    /// Level in force
    pub level: EscalationLevel,
    /// Counter decision
    pub decision: Decision,
}

/// Maps risk scores to per-user escalated counters.
pub struct EscalationController {
    scorer: Arc<dyn RiskScorer>,
    config: EscalationConfig,
    states: DashMap<String, EscalationState>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EscalationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationController")
            .field("config", &self.config)
            .field("active", &self.states.len())
            .finish()
    }
}

impl EscalationController {
    /// Create a controller around a risk scorer.
    pub fn new(scorer: Arc<dyn RiskScorer>, config: EscalationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            scorer,
            config,
            states: DashMap::new(),
            clock,
        }
    }

    /// Map a risk score to a level.
    pub fn level_for_score(&self, score: u8) -> EscalationLevel {
        if score >= self.config.critical_threshold {
            EscalationLevel::Critical
        } else if score >= self.config.moderate_threshold {
            EscalationLevel::Moderate
        } else {
            EscalationLevel::None
        }
    }

    /// Requests per window allowed at `level`; `None` when not escalated.
    pub fn max_requests(&self, level: EscalationLevel) -> Option<u64> {
        match level {
            EscalationLevel::None => None,
            EscalationLevel::Moderate => Some(self.config.moderate_max_requests),
            EscalationLevel::Critical => Some(self.config.critical_max_requests),
        }
    }

    /// Query the scorer for `user_id` and update the user's escalation.
    ///
    /// A successful answer always wins: an elevated level installs (or keeps)
    /// the matching counter, and `none` removes any active one. A scorer
    /// error, timeout or panic is returned as `Err` and leaves stored state
    /// untouched; callers treat it as level `none` and must not [`enforce`]
    /// on the strength of an earlier answer.
    ///
    /// [`enforce`]: EscalationController::enforce
    pub async fn evaluate(&self, user_id: &str) -> Result<EscalationLevel, CollaboratorError> {
        let stats = self.fetch_stats(user_id).await.map_err(|e| {
            warn!(user_id, error = %e, "Risk scorer unavailable, failing open");
            e
        })?;
        let level = stats
            .map(|s| self.level_for_score(s.risk_score))
            .unwrap_or_default();
        self.apply(user_id, level);
        Ok(level)
    }

    async fn fetch_stats(&self, user_id: &str) -> Result<Option<ActivityStats>, CollaboratorError> {
        let call = AssertUnwindSafe(self.scorer.user_activity_stats(user_id)).catch_unwind();
        match tokio::time::timeout(self.config.risk_timeout(), call).await {
            Err(_) => Err(CollaboratorError::Timeout(self.config.risk_timeout_ms)),
            Ok(Err(_)) => Err(CollaboratorError::Panicked),
            Ok(Ok(result)) => result,
        }
    }

    fn apply(&self, user_id: &str, level: EscalationLevel) {
        let now = self.clock.now();
        let window = self.config.window();

        if level == EscalationLevel::None {
            if let Some((_, state)) = self.states.remove(user_id) {
                info!(user_id, previous = %state.level, "Escalation lifted");
            }
            return;
        }

        match self.states.entry(user_id.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.level != level || current.is_expired(now) {
                    info!(user_id, previous = %current.level, level = %level, "Escalation replaced");
                    occupied.insert(EscalationState::new(level, now, window));
                }
            }
            Entry::Vacant(vacant) => {
                info!(user_id, level = %level, "Escalation installed");
                vacant.insert(EscalationState::new(level, now, window));
            }
        }
    }

    /// Charge a request to the user's elevated counter, if one is active.
    pub fn enforce(&self, user_id: &str) -> Option<EscalationDecision> {
        let now = self.clock.now();
        let window = self.config.window();

        {
            let mut state = self.states.get_mut(user_id)?;
            if !state.is_expired(now) {
                let level = state.level;
                let limit = self.max_requests(level)?;
                let decision = state.entry.hit(now, window, limit);
                return Some(EscalationDecision { level, decision });
            }
        }

        if self
            .states
            .remove_if(user_id, |_, state| state.is_expired(now))
            .is_some()
        {
            debug!(user_id, "Escalation expired");
        }
        None
    }

    /// Level currently in force for a user.
    pub fn active_level(&self, user_id: &str) -> EscalationLevel {
        let now = self.clock.now();
        self.states
            .get(user_id)
            .filter(|state| !state.is_expired(now))
            .map(|state| state.level)
            .unwrap_or_default()
    }

    /// Remove expired escalations. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.states.len();
        self.states.retain(|_, state| !state.is_expired(now));
        before.saturating_sub(self.states.len())
    }

    /// Message for escalated rejections.
    pub fn message(&self) -> &str {
        &self.config.message
    }

    /// Retry hint for escalated rejections.
    pub fn retry_after_label(&self) -> String {
        self.config
            .retry_after
            .clone()
            .unwrap_or_else(|| humanize_window(self.config.window_secs))
    }

    /// Whether escalation is switched on.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}
