//! Tier policy table.
//!
//! A tier is a named fixed-window policy together with the predicate that
//! decides which requests it applies to and the key strategy that decides
//! whose counter a request is charged to. The table is built once at startup
//! from configuration and is immutable afterwards.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::key::KeyStrategy;
use super::request::RequestMeta;
use crate::error::{GatekeeperError, Result};

/// Longest accepted window: one year.
pub const MAX_WINDOW_SECS: u64 = 365 * 86_400;

/// What a tier does when its counter cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Log and let the request through
    #[default]
    Open,
    /// Treat the request as over the limit
    Closed,
}

/// Request predicate for a tier.
///
/// All configured conditions must hold. Empty lists place no constraint.
/// Path comparisons are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMatcher {
    /// Methods the tier applies to
    #[serde(default)]
    pub methods: Vec<String>,
    /// The path must contain at least one of these fragments
    #[serde(default)]
    pub path_contains: Vec<String>,
    /// Paths at or below any of these prefixes are never matched
    #[serde(default)]
    pub exempt_prefixes: Vec<String>,
}

impl RouteMatcher {
    /// Whether a request with this method and path is covered.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        let path = path.to_ascii_lowercase();

        if self
            .exempt_prefixes
            .iter()
            .any(|prefix| under_prefix(&path, &prefix.to_ascii_lowercase()))
        {
            return false;
        }

        let method_ok = self.methods.is_empty()
            || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method));
        let path_ok = self.path_contains.is_empty()
            || self
                .path_contains
                .iter()
                .any(|fragment| path.contains(&fragment.to_ascii_lowercase()));

        method_ok && path_ok
    }
}

/// Whether `path` is `prefix` itself or lies below it.
fn under_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// A named rate limiting policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    /// Tier name, also reported as `limitType`
    pub name: String,
    /// Window length in seconds
    pub window_secs: u64,
    /// Requests allowed per window
    pub max_requests: u64,
    /// Whose counter a request is charged to
    #[serde(default)]
    pub key: KeyStrategy,
    /// Which requests the tier covers
    #[serde(default)]
    pub applies_to: RouteMatcher,
    /// Message returned when the tier rejects
    pub message: String,
    /// Human-readable retry hint; derived from the window when unset
    #[serde(default)]
    pub retry_after: Option<String>,
    /// Behavior when the counter fails
    #[serde(default)]
    pub fail_mode: FailMode,
}

impl Tier {
    /// The window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Whether this tier covers the request.
    pub fn applies(&self, request: &RequestMeta) -> bool {
        self.applies_to.matches(&request.method, &request.path)
    }

    /// Retry hint shown to rejected callers.
    pub fn retry_after_label(&self) -> String {
        self.retry_after
            .clone()
            .unwrap_or_else(|| humanize_window(self.window_secs))
    }
}

/// Per-tier override of the numeric parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverride {
    /// Replacement window length in seconds
    #[serde(default)]
    pub window_secs: Option<u64>,
    /// Replacement request maximum
    #[serde(default)]
    pub max_requests: Option<u64>,
}

/// Render a window length the way it is shown to callers, e.g. "5 minutes".
pub fn humanize_window(secs: u64) -> String {
    let (amount, unit) = match secs {
        s if s >= 86_400 && s % 86_400 == 0 => (s / 86_400, "day"),
        s if s >= 3_600 && s % 3_600 == 0 => (s / 3_600, "hour"),
        s if s >= 60 && s % 60 == 0 => (s / 60, "minute"),
        s => (s, "second"),
    };
    if amount == 1 {
        format!("1 {}", unit)
    } else {
        format!("{} {}s", amount, unit)
    }
}

/// The reference tier set: general, upload, login, profile, sensitive.
pub fn default_tiers() -> Vec<Tier> {
    vec![
        Tier {
            name: "general".to_string(),
            window_secs: 60,
            max_requests: 100,
            key: KeyStrategy::UserOrIp,
            applies_to: RouteMatcher {
                exempt_prefixes: vec!["/health".to_string(), "/static".to_string()],
                ..Default::default()
            },
            message: "Too many requests from this client, please try again later.".to_string(),
            retry_after: None,
            fail_mode: FailMode::Open,
        },
        Tier {
            name: "upload".to_string(),
            window_secs: 300,
            max_requests: 5,
            key: KeyStrategy::UserOrIp,
            applies_to: RouteMatcher {
                path_contains: vec!["/upload".to_string()],
                ..Default::default()
            },
            message: "Too many uploads, please try again later.".to_string(),
            retry_after: None,
            fail_mode: FailMode::Open,
        },
        Tier {
            name: "login".to_string(),
            window_secs: 600,
            max_requests: 5,
            key: KeyStrategy::IpAndField {
                field: "email".to_string(),
            },
            applies_to: RouteMatcher {
                methods: vec!["POST".to_string()],
                path_contains: vec!["/auth/login".to_string()],
                ..Default::default()
            },
            message: "Too many login attempts, please try again later.".to_string(),
            retry_after: None,
            fail_mode: FailMode::Open,
        },
        Tier {
            name: "profile".to_string(),
            window_secs: 3_600,
            max_requests: 3,
            key: KeyStrategy::UserOrIp,
            applies_to: RouteMatcher {
                methods: vec!["PUT".to_string(), "PATCH".to_string()],
                path_contains: vec!["/profile".to_string()],
                ..Default::default()
            },
            message: "Too many profile updates, please try again later.".to_string(),
            retry_after: None,
            fail_mode: FailMode::Open,
        },
        Tier {
            name: "sensitive".to_string(),
            window_secs: 60,
            max_requests: 20,
            key: KeyStrategy::UserOrIp,
            applies_to: RouteMatcher {
                path_contains: vec![
                    "/admin".to_string(),
                    "/delete".to_string(),
                    "/moderation".to_string(),
                    "/report".to_string(),
                ],
                ..Default::default()
            },
            message: "Too many sensitive operations, please slow down.".to_string(),
            retry_after: None,
            fail_mode: FailMode::Open,
        },
    ]
}

/// Ordered, validated set of tiers. Order is evaluation priority.
#[derive(Debug, Clone)]
pub struct TierTable {
    tiers: Vec<Tier>,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
        }
    }
}

impl TierTable {
    /// Build a table from tier definitions and per-tier overrides.
    pub fn new(mut tiers: Vec<Tier>, overrides: &HashMap<String, LimitOverride>) -> Result<Self> {
        for (name, limits) in overrides {
            let tier = tiers
                .iter_mut()
                .find(|tier| tier.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| {
                    GatekeeperError::Config(format!("limit override for unknown tier '{}'", name))
                })?;
            if let Some(window_secs) = limits.window_secs {
                tier.window_secs = window_secs;
            }
            if let Some(max_requests) = limits.max_requests {
                tier.max_requests = max_requests;
            }
        }

        let mut seen = HashSet::new();
        for tier in &tiers {
            if tier.name.trim().is_empty() {
                return Err(GatekeeperError::Config("tier name must not be empty".to_string()));
            }
            if !seen.insert(tier.name.to_ascii_lowercase()) {
                return Err(GatekeeperError::Config(format!("duplicate tier '{}'", tier.name)));
            }
            if tier.window_secs == 0 || tier.window_secs > MAX_WINDOW_SECS {
                return Err(GatekeeperError::Config(format!(
                    "tier '{}' window must be between 1 and {} seconds",
                    tier.name, MAX_WINDOW_SECS
                )));
            }
            if tier.max_requests == 0 {
                return Err(GatekeeperError::Config(format!(
                    "tier '{}' must allow at least one request",
                    tier.name
                )));
            }
        }

        Ok(Self { tiers })
    }

    /// All tiers in priority order.
    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// Look up a tier by name, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&Tier> {
        self.position(name).map(|index| &self.tiers[index])
    }

    /// Evaluation index of the named tier, ignoring ASCII case.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.tiers.iter().position(|tier| tier.name.eq_ignore_ascii_case(name))
    }

    /// Tiers covering a request, in priority order.
    pub fn applicable<'a>(&'a self, request: &'a RequestMeta) -> impl Iterator<Item = &'a Tier> + 'a {
        self.tiers.iter().filter(move |tier| tier.applies(request))
    }

    /// Body fields needed to key the tiers covering `method` and `path`.
    pub fn required_fields(&self, method: &str, path: &str) -> Vec<&str> {
        self.tiers
            .iter()
            .filter(|tier| tier.applies_to.matches(method, path))
            .filter_map(|tier| tier.key.required_field())
            .collect()
    }
}
