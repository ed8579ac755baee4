//! Configuration management for Gatekeeper.
//!
//! Configuration is layered: built-in defaults, then an optional file
//! (YAML, TOML or JSON by extension), then environment variables of the form
//! `GATEKEEPER__SECTION__KEY`, e.g. `GATEKEEPER__LIMITS__UPLOAD__MAX_REQUESTS=10`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{default_tiers, LimitOverride, Tier, TierTable, MAX_WINDOW_SECS};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Tier definitions, in evaluation order
    #[serde(default = "default_tiers")]
    pub tiers: Vec<Tier>,

    /// Per-tier overrides of window and maximum
    #[serde(default)]
    pub limits: HashMap<String, LimitOverride>,

    /// Risk-driven escalation
    #[serde(default)]
    pub escalation: EscalationConfig,

    /// Rejection auditing
    #[serde(default)]
    pub audit: AuditConfig,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tiers: default_tiers(),
            limits: HashMap::new(),
            escalation: EscalationConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Take the client IP from the first `X-Forwarded-For` hop
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Largest body buffered to read composite key fields
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Soft cap on keys tracked by each tier counter
    #[serde(default = "default_max_keys_per_tier")]
    pub max_keys_per_tier: usize,

    /// How often lapsed counters are swept, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_forwarded_for: false,
            max_body_bytes: default_max_body_bytes(),
            max_keys_per_tier: default_max_keys_per_tier(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

fn default_max_keys_per_tier() -> usize {
    100_000
}

fn default_sweep_interval() -> u64 {
    60
}

/// Risk-driven escalation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Whether authenticated requests consult the risk scorer
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lowest score that escalates to moderate
    #[serde(default = "default_moderate_threshold")]
    pub moderate_threshold: u8,

    /// Lowest score that escalates to critical
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: u8,

    /// Requests per window at moderate
    #[serde(default = "default_moderate_max_requests")]
    pub moderate_max_requests: u64,

    /// Requests per window at critical
    #[serde(default = "default_critical_max_requests")]
    pub critical_max_requests: u64,

    /// Escalated window length in seconds
    #[serde(default = "default_escalation_window")]
    pub window_secs: u64,

    /// Risk scorer call budget in milliseconds
    #[serde(default = "default_risk_timeout")]
    pub risk_timeout_ms: u64,

    /// Message for requests rejected by an escalated counter
    #[serde(default = "default_suspicious_message")]
    pub message: String,

    /// Retry hint; derived from the window when unset
    #[serde(default)]
    pub retry_after: Option<String>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            moderate_threshold: default_moderate_threshold(),
            critical_threshold: default_critical_threshold(),
            moderate_max_requests: default_moderate_max_requests(),
            critical_max_requests: default_critical_max_requests(),
            window_secs: default_escalation_window(),
            risk_timeout_ms: default_risk_timeout(),
            message: default_suspicious_message(),
            retry_after: None,
        }
    }
}

impl EscalationConfig {
    /// Escalated window as a duration.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Risk scorer call budget as a duration.
    pub fn risk_timeout(&self) -> Duration {
        Duration::from_millis(self.risk_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_moderate_threshold() -> u8 {
    40
}

fn default_critical_threshold() -> u8 {
    70
}

fn default_moderate_max_requests() -> u64 {
    20
}

fn default_critical_max_requests() -> u64 {
    5
}

fn default_escalation_window() -> u64 {
    60
}

fn default_risk_timeout() -> u64 {
    250
}

fn default_suspicious_message() -> String {
    "Suspicious activity detected on this account. Requests are temporarily restricted.".to_string()
}

/// Rejection auditing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Log every rejection as a warning
    #[serde(default = "default_true")]
    pub log_rejections: bool,

    /// Rejections kept for the recent-rejections feed
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,

    /// Append rejections to this JSON-lines file
    #[serde(default)]
    pub jsonl_path: Option<PathBuf>,

    /// Records buffered for the file writer before new ones are dropped
    #[serde(default = "default_jsonl_buffer")]
    pub jsonl_buffer: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_rejections: true,
            recent_capacity: default_recent_capacity(),
            jsonl_path: None,
            jsonl_buffer: default_jsonl_buffer(),
        }
    }
}

fn default_recent_capacity() -> usize {
    500
}

fn default_jsonl_buffer() -> usize {
    1024
}

impl GatekeeperConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: GatekeeperConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig =
            serde_yaml::from_str(yaml).map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| GatekeeperError::Config(e.to_string()))
    }

    /// Build the tier table with overrides applied.
    pub fn tier_table(&self) -> Result<TierTable> {
        TierTable::new(self.tiers.clone(), &self.limits)
    }

    /// Check the configuration for values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.tier_table()?;

        let escalation = &self.escalation;
        if escalation.moderate_threshold > escalation.critical_threshold {
            return Err(GatekeeperError::Config(format!(
                "escalation moderate_threshold ({}) must not exceed critical_threshold ({})",
                escalation.moderate_threshold, escalation.critical_threshold
            )));
        }
        if escalation.critical_threshold > 100 {
            return Err(GatekeeperError::Config(
                "escalation critical_threshold must be at most 100".to_string(),
            ));
        }
        if escalation.window_secs == 0 || escalation.window_secs > MAX_WINDOW_SECS {
            return Err(GatekeeperError::Config(format!(
                "escalation window_secs must be between 1 and {}",
                MAX_WINDOW_SECS
            )));
        }
        if escalation.moderate_max_requests == 0 || escalation.critical_max_requests == 0 {
            return Err(GatekeeperError::Config(
                "escalation limits must allow at least one request".to_string(),
            ));
        }
        if self.server.max_keys_per_tier == 0 {
            return Err(GatekeeperError::Config(
                "server max_keys_per_tier must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
