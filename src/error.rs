//! Error types for the Gatekeeper service.
//!
//! Admission decisions themselves are never errors: a rejected request is a
//! normal outcome (see [`crate::ratelimit::Rejection`]). The types here cover
//! process-level failures and the collaborator/counter failures that the
//! admission path converts into fail-open decisions.

use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Serve(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for GatekeeperError {
    fn from(err: ::config::ConfigError) -> Self {
        GatekeeperError::Config(err.to_string())
    }
}

/// Failure of an external collaborator (risk scorer, audit sink).
///
/// Never surfaced to the caller of the admission path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The collaborator reported a failure
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator did not answer in time
    #[error("collaborator timed out after {0} ms")]
    Timeout(u64),

    /// The collaborator panicked while serving the call
    #[error("collaborator panicked")]
    Panicked,
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;
