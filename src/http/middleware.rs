//! Axum middleware applying admission control to a router.
//!
//! ```ignore
//! let state = AdmissionState::new(service, &config.server);
//! let app = gatekeeper::http::protect(Router::new().route("/api/files", get(list)), state);
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tracing::debug;

use super::response::{insert_quota_headers, rejection_response};
use crate::config::ServerConfig;
use crate::ratelimit::{AdmissionControlService, RequestMeta};

/// Identity placed in request extensions by the host's authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// State shared by the admission middleware.
#[derive(Debug, Clone)]
pub struct AdmissionState {
    service: Arc<AdmissionControlService>,
    trust_forwarded_for: bool,
    max_body_bytes: usize,
}

impl AdmissionState {
    /// Wrap a service with the request extraction settings from `server`.
    pub fn new(service: Arc<AdmissionControlService>, server: &ServerConfig) -> Self {
        Self {
            service,
            trust_forwarded_for: server.trust_forwarded_for,
            max_body_bytes: server.max_body_bytes,
        }
    }

    /// The wrapped service.
    pub fn service(&self) -> &Arc<AdmissionControlService> {
        &self.service
    }
}

/// Apply admission control to every route of `router`.
pub fn protect<S>(router: Router<S>, state: AdmissionState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(from_fn_with_state(state, admission_middleware))
}

/// Admit or reject a request before it reaches the handler.
pub async fn admission_middleware(State(state): State<AdmissionState>, request: Request, next: Next) -> Response {
    let (meta, request) = match extract_meta(&state, request).await {
        Ok(extracted) => extracted,
        Err(response) => return response,
    };

    let result = state.service.admit(&meta).await;
    if let Some(rejection) = &result.rejection {
        return rejection_response(rejection);
    }

    let mut response = next.run(request).await;
    if let Some(quota) = &result.quota {
        insert_quota_headers(response.headers_mut(), quota);
    }
    response
}

/// Collect request metadata, buffering the body only when a tier keys on a
/// body field.
async fn extract_meta(state: &AdmissionState, request: Request) -> Result<(RequestMeta, Request), Response> {
    let mut meta = RequestMeta::new(request.method().as_str(), request.uri().path());
    meta.ip = client_ip(&request, state.trust_forwarded_for);
    meta.user_id = request
        .extensions()
        .get::<AuthenticatedUser>()
        .map(|user| user.0.clone());

    let fields: Vec<String> = state
        .service
        .dispatcher()
        .table()
        .required_fields(&meta.method, &meta.path)
        .into_iter()
        .map(str::to_string)
        .collect();
    if fields.is_empty() || declared_length(request.headers()).is_some_and(|len| len > state.max_body_bytes) {
        return Ok((meta, request));
    }

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!(error = %e, path = %meta.path, "Request body unreadable");
            return Err((
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({ "error": "Request body too large" })),
            )
                .into_response());
        }
    };

    if let Ok(serde_json::Value::Object(object)) = serde_json::from_slice::<serde_json::Value>(&bytes) {
        for field in fields {
            if let Some(value) = object.get(&field).and_then(serde_json::Value::as_str) {
                meta.fields.insert(field, value.to_string());
            }
        }
    }

    Ok((meta, Request::from_parts(parts, Body::from(bytes))))
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

fn client_ip(request: &Request, trust_forwarded_for: bool) -> Option<String> {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty());
        if let Some(hop) = forwarded {
            return Some(hop.to_string());
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::SinkSet;
    use crate::config::EscalationConfig;
    use crate::http::response::{RATELIMIT_LIMIT, RATELIMIT_REMAINING};
    use crate::ratelimit::{InMemoryRiskScores, MockClock, TierTable};
    use axum::routing::{get, post};
    use tower::ServiceExt;

    fn app(trust_forwarded_for: bool) -> (Router, Arc<InMemoryRiskScores>) {
        let scores = Arc::new(InMemoryRiskScores::new());
        let service = Arc::new(AdmissionControlService::new(
            TierTable::default(),
            EscalationConfig::default(),
            scores.clone(),
            SinkSet::new(),
            1_000,
            Arc::new(MockClock::default()),
        ));
        let server = ServerConfig {
            trust_forwarded_for,
            ..Default::default()
        };
        let router = Router::new()
            .route("/api/files", get(|| async { "files" }))
            .route("/api/upload", post(|| async { "stored" }))
            .route("/api/auth/login", post(|body: String| async move { body }))
            .route("/health", get(|| async { "ok" }));
        (protect(router, AdmissionState::new(service, &server)), scores)
    }

    fn get_from(path: &str, ip: &str) -> Request {
        Request::builder()
            .uri(path)
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    fn login(email: &str) -> Request {
        Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("x-forwarded-for", "1.2.3.4")
            .header("content-type", "application/json")
            .body(Body::from(format!(r#"{{"email":"{}","password":"pw"}}"#, email)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_allowed_request_carries_quota_headers() {
        let (app, _) = app(true);

        let response = app.oneshot(get_from("/api/files", "5.5.5.5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[&RATELIMIT_LIMIT], "100");
        assert_eq!(response.headers()[&RATELIMIT_REMAINING], "99");
    }

    #[tokio::test]
    async fn test_exempt_route_has_no_headers() {
        let (app, _) = app(true);

        let response = app.oneshot(get_from("/health", "5.5.5.5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(&RATELIMIT_LIMIT).is_none());
    }

    #[tokio::test]
    async fn test_upload_limit_returns_429() {
        let (app, _) = app(true);
        let upload = || {
            Request::builder()
                .method("POST")
                .uri("/api/upload")
                .header("x-forwarded-for", "6.6.6.6")
                .body(Body::empty())
                .unwrap()
        };

        for _ in 0..5 {
            let response = app.clone().oneshot(upload()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(upload()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["limitType"], "upload");
        assert_eq!(body["retryAfter"], "5 minutes");
    }

    #[tokio::test]
    async fn test_login_keyed_by_email_and_body_preserved() {
        let (app, _) = app(true);

        for _ in 0..5 {
            let response = app.clone().oneshot(login("a@x.com")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let blocked = app.clone().oneshot(login("a@x.com")).await.unwrap();
        assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);

        let other = app.clone().oneshot(login("b@x.com")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(other.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], br#"{"email":"b@x.com","password":"pw"}"#);
    }

    #[tokio::test]
    async fn test_forwarded_for_ignored_when_untrusted() {
        let (app, _) = app(false);

        // Without a trusted header or socket address every client is anonymous.
        for i in 0..5 {
            let request = Request::builder()
                .method("POST")
                .uri("/api/upload")
                .header("x-forwarded-for", format!("10.0.0.{}", i))
                .body(Body::empty())
                .unwrap();
            assert_eq!(app.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);
        }
        let request = Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header("x-forwarded-for", "10.0.0.99")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            app.clone().oneshot(request).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_authenticated_user_escalation() {
        let (app, scores) = app(true);
        scores.set("risky", 90);

        let request = || {
            let mut request = get_from("/api/files", "7.7.7.7");
            request
                .extensions_mut()
                .insert(AuthenticatedUser("risky".to_string()));
            request
        };

        for _ in 0..5 {
            assert_eq!(app.clone().oneshot(request()).await.unwrap().status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["limitType"], "suspicious_activity");
    }

    #[tokio::test]
    async fn test_oversized_declared_body_skips_field_extraction() {
        let (app, _) = app(true);
        let big = "x".repeat(70 * 1024);
        let request = Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("x-forwarded-for", "1.2.3.4")
            .header("content-length", big.len().to_string())
            .body(Body::from(big.clone()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
