//! Admission control: tiered fixed-window limits and risk-driven escalation.

mod clock;
mod counter;
mod dispatcher;
mod escalation;
mod key;
mod outcome;
mod request;
mod risk;
mod rules;
mod service;

#[cfg(any(test, feature = "test-helpers"))]
pub use clock::MockClock;
pub use clock::{Clock, SystemClock};
pub use counter::{CounterEntry, CounterError, Decision, WindowCounter};
pub use dispatcher::TierDispatcher;
pub use escalation::{EscalationController, EscalationDecision, EscalationLevel, EscalationState};
pub use key::{KeyStrategy, ANONYMOUS_KEY, UNKNOWN_PART};
pub use outcome::{AdmissionResult, Rejection, RejectionKind, SUSPICIOUS_ACTIVITY_LIMIT};
pub use request::RequestMeta;
pub use risk::{ActivityStats, InMemoryRiskScores, NoRiskScores, RiskScorer, MAX_RISK_SCORE};
pub use rules::{default_tiers, humanize_window, FailMode, MAX_WINDOW_SECS, LimitOverride, RouteMatcher, Tier, TierTable};
pub use service::AdmissionControlService;
