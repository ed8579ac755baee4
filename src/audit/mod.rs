//! Rejection auditing.
//!
//! Every rejected request produces a [`RejectionRecord`] that is handed to a
//! [`SinkSet`]. Sinks are fire-and-forget: they must not block the request
//! path and their failures are swallowed.

mod sinks;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use sinks::{JsonLinesSink, RecentRejections, RejectionSink, SinkSet, TracingSink};

/// A single rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionRecord {
    /// Tier (or escalation) that rejected the request
    pub tier: String,
    /// Identity key the request was charged to
    pub key: String,
    /// Request path
    pub path: String,
    /// Request method
    pub method: String,
    /// When the rejection happened
    pub timestamp: DateTime<Utc>,
}

impl RejectionRecord {
    /// Build a record stamped with the current time.
    pub fn now(tier: &str, key: &str, method: &str, path: &str) -> Self {
        Self {
            tier: tier.to_string(),
            key: key.to_string(),
            path: path.to_string(),
            method: method.to_string(),
            timestamp: Utc::now(),
        }
    }
}
