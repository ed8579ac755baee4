//! Gatekeeper - Request Admission Control
//!
//! This crate implements tiered, per-route rate limiting keyed by client
//! identity, with an adaptive escalation path that tightens limits for users
//! an external risk scorer flags as suspicious. It can be embedded as axum
//! middleware or run as a standalone admission service.

pub mod audit;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
