//! Standalone admission server.
//!
//! Exposes admission decisions to proxies and services that cannot embed the
//! middleware, plus the risk score feed used by the behavior-analysis engine
//! and a feed of recent rejections for the moderation dashboard.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::response::{insert_quota_headers, rejection_response, reset_secs};
use crate::audit::{RecentRejections, RejectionRecord};
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{AdmissionControlService, EscalationLevel, InMemoryRiskScores, RequestMeta};

/// Shared state of the admission server routes.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Admission decisions
    pub service: Arc<AdmissionControlService>,
    /// Risk scores fed by the behavior-analysis engine
    pub scores: Arc<InMemoryRiskScores>,
    /// Recent rejections
    pub recent: Arc<RecentRejections>,
}

/// Body of an admitted `/v1/admit` answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmitResponse {
    /// Always true; rejections are answered with 429
    pub allowed: bool,
    /// Limit of the most constraining counter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Requests left on the most constraining counter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    /// Seconds until that counter resets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset: Option<u64>,
}

/// Body of a risk score update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskUpdate {
    /// New score; values above 100 are clamped
    pub risk_score: u32,
}

/// Answer to a risk score update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskUpdateResponse {
    /// User the score applies to
    pub user_id: String,
    /// Stored score
    pub risk_score: u8,
    /// Escalation currently in force for the user
    pub active_level: EscalationLevel,
}

/// Build the admission server routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/admit", post(admit))
        .route("/v1/risk/:user_id", put(set_risk).delete(clear_risk))
        .route("/v1/rejections", get(rejections))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn admit(State(state): State<AppState>, Json(request): Json<RequestMeta>) -> Response {
    let request = RequestMeta {
        method: request.method.to_ascii_uppercase(),
        ..request
    };
    let result = state.service.admit(&request).await;

    if let Some(rejection) = &result.rejection {
        return rejection_response(rejection);
    }

    let body = AdmitResponse {
        allowed: true,
        limit: result.quota.map(|q| q.limit),
        remaining: result.quota.map(|q| q.remaining),
        reset: result.quota.map(|q| reset_secs(q.reset_in)),
    };
    let mut response = Json(body).into_response();
    if let Some(quota) = &result.quota {
        insert_quota_headers(response.headers_mut(), quota);
    }
    response
}

async fn set_risk(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(update): Json<RiskUpdate>,
) -> Json<RiskUpdateResponse> {
    let risk_score = state.scores.set(&user_id, update.risk_score);
    info!(user_id = %user_id, risk_score, "Risk score updated");
    Json(RiskUpdateResponse {
        active_level: state.service.escalation_level(&user_id),
        user_id,
        risk_score,
    })
}

async fn clear_risk(State(state): State<AppState>, Path(user_id): Path<String>) -> StatusCode {
    if state.scores.clear(&user_id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn rejections(State(state): State<AppState>) -> Json<Vec<RejectionRecord>> {
    Json(state.recent.snapshot())
}

/// HTTP server for admission decisions.
pub struct AdmissionServer {
    /// Address to bind to
    addr: SocketAddr,
    state: AppState,
}

impl AdmissionServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// Serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Admission server listening");

        axum::serve(
            listener,
            router(self.state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "Admission server failed");
            GatekeeperError::Serve(e.to_string())
        })
    }
}

/// Periodically drop lapsed counters and escalations.
pub fn spawn_sweeper(service: Arc<AdmissionControlService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            service.sweep();
        }
    })
}
