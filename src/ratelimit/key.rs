//! Identity key resolution.

use serde::{Deserialize, Serialize};

use super::request::RequestMeta;

/// Key used when a request carries neither a user nor an IP.
pub const ANONYMOUS_KEY: &str = "anonymous";
/// Placeholder for a missing part of a composite key.
pub const UNKNOWN_PART: &str = "unknown";

/// How a tier derives the identity a counter is tracked against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Authenticated user id, else source IP, else `anonymous`
    #[default]
    UserOrIp,
    /// `ip:field`, e.g. source IP plus attempted email
    IpAndField {
        /// Name of the body field to combine with the IP
        field: String,
    },
}

impl KeyStrategy {
    /// Body field this strategy needs, if any.
    pub fn required_field(&self) -> Option<&str> {
        match self {
            KeyStrategy::UserOrIp => None,
            KeyStrategy::IpAndField { field } => Some(field.as_str()),
        }
    }

    /// Resolve the key for a request. Never fails; missing parts degrade to
    /// sentinel values.
    pub fn resolve(&self, request: &RequestMeta) -> String {
        match self {
            KeyStrategy::UserOrIp => request
                .user()
                .or_else(|| request.source_ip())
                .unwrap_or(ANONYMOUS_KEY)
                .to_string(),
            KeyStrategy::IpAndField { field } => {
                let ip = request.source_ip().unwrap_or(UNKNOWN_PART);
                let value = request
                    .fields
                    .get(field)
                    .map(|v| v.trim().to_lowercase())
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| UNKNOWN_PART.to_string());
                format!("{}:{}", ip, value)
            }
        }
    }
}
