//! Request metadata consumed by the admission path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The parts of an inbound request that admission control looks at.
///
/// Built by the HTTP layer (or sent directly to the admission endpoint); the
/// core never sees the HTTP request itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// HTTP method, upper case
    pub method: String,
    /// Request path
    pub path: String,
    /// Source IP, if known
    #[serde(default)]
    pub ip: Option<String>,
    /// Authenticated user id, if the request passed authentication
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
    /// Body fields needed by composite keys (e.g. the attempted email)
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl RequestMeta {
    /// Create request metadata for a method and path.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the source IP.
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Set the authenticated user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Add a body field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// The authenticated user id, ignoring blank values.
    pub fn user(&self) -> Option<&str> {
        non_blank(self.user_id.as_deref())
    }

    /// The source IP, ignoring blank values.
    pub fn source_ip(&self) -> Option<&str> {
        non_blank(self.ip.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
