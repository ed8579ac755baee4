//! Rejection responses and rate limit headers.

use std::time::Duration;

use axum::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::ratelimit::{Decision, Rejection};

/// `RateLimit-Limit` header.
pub static RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
/// `RateLimit-Remaining` header.
pub static RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
/// `RateLimit-Reset` header, in seconds.
pub static RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    /// Message for the caller
    pub error: String,
    /// Human-readable retry hint, e.g. "5 minutes"
    pub retry_after: String,
    /// Tier name, or `suspicious_activity`
    pub limit_type: String,
    /// RFC 3339 UTC timestamp of the rejection
    pub timestamp: String,
}

impl From<&Rejection> for RejectionBody {
    fn from(rejection: &Rejection) -> Self {
        Self {
            error: rejection.message.clone(),
            retry_after: rejection.retry_after.clone(),
            limit_type: rejection.limit_type().to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

/// Whole seconds until reset, rounded up.
pub(crate) fn reset_secs(reset_in: Duration) -> u64 {
    let secs = reset_in.as_secs();
    if reset_in.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Set the `RateLimit-*` headers for a counter decision.
pub fn insert_quota_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
    headers.insert(RATELIMIT_REMAINING.clone(), HeaderValue::from(decision.remaining));
    headers.insert(RATELIMIT_RESET.clone(), HeaderValue::from(reset_secs(decision.reset_in)));
}

/// Build the 429 response for a rejection.
pub fn rejection_response(rejection: &Rejection) -> Response {
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(RejectionBody::from(rejection))).into_response();
    if let Some(decision) = &rejection.decision {
        let headers = response.headers_mut();
        insert_quota_headers(headers, decision);
        headers.insert(RETRY_AFTER, HeaderValue::from(reset_secs(decision.reset_in).max(1)));
    }
    response
}
