//! Admission results and rejection taxonomy.

use super::counter::Decision;
use super::escalation::EscalationLevel;
use super::rules::Tier;

/// `limitType` reported for rejections by an escalated per-user counter.
pub const SUSPICIOUS_ACTIVITY_LIMIT: &str = "suspicious_activity";

/// Why a request was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionKind {
    /// A static tier's quota is exhausted
    LimitExceeded {
        /// Name of the violated tier
        tier: String,
    },
    /// The user's escalated counter is exhausted
    SuspiciousActivity {
        /// Escalation level in force
        level: EscalationLevel,
    },
}

/// A rejected admission, with everything needed to answer the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Why the request was rejected
    pub kind: RejectionKind,
    /// Message for the caller
    pub message: String,
    /// Human-readable retry hint
    pub retry_after: String,
    /// Counter state at rejection, when a counter produced the decision
    pub decision: Option<Decision>,
}

impl Rejection {
    /// Rejection by a static tier.
    pub fn limit_exceeded(tier: &Tier, decision: Option<Decision>) -> Self {
        Self {
            kind: RejectionKind::LimitExceeded {
                tier: tier.name.clone(),
            },
            message: tier.message.clone(),
            retry_after: tier.retry_after_label(),
            decision,
        }
    }

    /// Rejection by an escalated per-user counter.
    pub fn suspicious_activity(
        level: EscalationLevel,
        message: &str,
        retry_after: &str,
        decision: Decision,
    ) -> Self {
        Self {
            kind: RejectionKind::SuspiciousActivity { level },
            message: message.to_string(),
            retry_after: retry_after.to_string(),
            decision: Some(decision),
        }
    }

    /// Value reported as `limitType`.
    pub fn limit_type(&self) -> &str {
        match &self.kind {
            RejectionKind::LimitExceeded { tier } => tier.as_str(),
            RejectionKind::SuspiciousActivity { .. } => SUSPICIOUS_ACTIVITY_LIMIT,
        }
    }
}

/// Result of running a request through admission control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Set when `allowed` is false
    pub rejection: Option<Rejection>,
    /// Most constraining counter state seen for an admitted request
    pub quota: Option<Decision>,
}

impl AdmissionResult {
    /// An admitted request.
    pub fn allowed(quota: Option<Decision>) -> Self {
        Self {
            allowed: true,
            rejection: None,
            quota,
        }
    }

    /// A rejected request.
    pub fn rejected(rejection: Rejection) -> Self {
        Self {
            allowed: false,
            quota: rejection.decision,
            rejection: Some(rejection),
        }
    }

    /// Name of the tier that rejected the request.
    pub fn violated_tier(&self) -> Option<&str> {
        self.rejection.as_ref().map(Rejection::limit_type)
    }

    /// Retry hint of the rejection.
    pub fn retry_after(&self) -> Option<&str> {
        self.rejection.as_ref().map(|r| r.retry_after.as_str())
    }
}

/// Pick whichever decision leaves fewer requests.
pub(crate) fn tighter(current: Option<Decision>, candidate: Decision) -> Option<Decision> {
    match current {
        Some(existing) if existing.remaining <= candidate.remaining => Some(existing),
        _ => Some(candidate),
    }
}
