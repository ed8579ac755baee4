//! HTTP surface: embeddable middleware and the standalone admission server.

mod middleware;
mod response;
mod server;

pub use middleware::{admission_middleware, protect, AdmissionState, AuthenticatedUser};
pub use response::{
    insert_quota_headers, rejection_response, RejectionBody, RATELIMIT_LIMIT, RATELIMIT_REMAINING,
    RATELIMIT_RESET,
};
pub use server::{router, spawn_sweeper, AdmissionServer, AdmitResponse, AppState, RiskUpdate, RiskUpdateResponse};
