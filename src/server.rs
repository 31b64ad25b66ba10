//! HTTP surface: axum middleware and an auth-subrequest endpoint.

use crate::guard::{Decision, RequestGuard, REJECTION_BODY};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// The fixed rejection response.
pub fn rejection() -> Response {
    (StatusCode::FORBIDDEN, REJECTION_BODY).into_response()
}

fn peer_ip(request: &Request) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Middleware that rejects requests from denied addresses before they reach
/// the inner service.
///
/// ```ignore
/// let app = Router::new()
///     .route("/", get(handler))
///     .layer(axum::middleware::from_fn_with_state(guard, reputation_middleware));
/// ```
pub async fn reputation_middleware(
    State(guard): State<Arc<RequestGuard>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = peer_ip(&request);
    match guard.check(request.headers(), peer).await {
        Decision::Allow => next.run(request).await,
        Decision::Reject => rejection(),
    }
}

/// `GET /check`: 200 if the caller may proceed, 403 otherwise.
async fn check(
    State(guard): State<Arc<RequestGuard>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let peer = peer.map(|ConnectInfo(addr)| addr.ip());
    match guard.check(&headers, peer).await {
        Decision::Allow => StatusCode::OK.into_response(),
        Decision::Reject => rejection(),
    }
}

async fn stats(State(guard): State<Arc<RequestGuard>>) -> impl IntoResponse {
    Json(guard.gate().stats())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Standalone gate service for proxies that delegate the decision.
pub fn router(guard: Arc<RequestGuard>) -> Router {
    Router::new()
        .route("/check", get(check))
        .route("/stats", get(stats))
        .route("/healthz", get(healthz))
        .with_state(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryVerdictCache;
    use crate::client::{LookupError, ReputationLookup};
    use crate::config::Config;
    use crate::gate::{GateOptions, ReputationGate};
    use crate::policy::{ReputationScore, Verdict};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use std::time::Duration;
    use tower::ServiceExt;

    struct FixedScore(ReputationScore);

    #[async_trait]
    impl ReputationLookup for FixedScore {
        async fn lookup(&self, _address: &str) -> Result<ReputationScore, LookupError> {
            Ok(self.0)
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn test_guard(score: ReputationScore) -> (Arc<RequestGuard>, Arc<MemoryVerdictCache>) {
        let cache = Arc::new(MemoryVerdictCache::new(100));
        let gate = ReputationGate::new(
            cache.clone(),
            Arc::new(FixedScore(score)),
            GateOptions::default(),
        );
        let guard = RequestGuard::with_gate(Config::with_api_key("k"), gate).unwrap();
        (Arc::new(guard), cache)
    }

    fn request(uri: &str, client_ip: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .header("x-forwarded-for", client_ip)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn app(guard: Arc<RequestGuard>) -> Router {
        Router::new()
            .route("/", get(|| async { "hello" }))
            .layer(axum::middleware::from_fn_with_state(guard, reputation_middleware))
    }

    #[tokio::test]
    async fn test_middleware_rejects_abusive_ip() {
        let (guard, cache) = test_guard(87);

        let response = app(guard).oneshot(request("/", "203.0.113.9")).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_string(response).await, REJECTION_BODY);
        assert_eq!(cache.get_entry("203.0.113.9").unwrap().verdict, Verdict::Deny);
    }

    #[tokio::test]
    async fn test_middleware_judges_direct_peer_not_header() {
        let (guard, cache) = test_guard(0);
        cache.insert("203.0.113.9", Verdict::Deny, Duration::from_secs(86_400));

        let peer: SocketAddr = "203.0.113.9:51234".parse().unwrap();
        let spoofed = HttpRequest::builder()
            .uri("/")
            .header("x-forwarded-for", "8.8.8.8")
            .extension(ConnectInfo(peer))
            .body(Body::empty())
            .unwrap();

        let response = app(guard).oneshot(spoofed).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_middleware_passes_clean_ip() {
        let (guard, _cache) = test_guard(0);

        let response = app(guard).oneshot(request("/", "198.51.100.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "hello");
    }

    #[tokio::test]
    async fn test_check_endpoint() {
        let (guard, cache) = test_guard(0);
        cache.insert("198.51.100.4", Verdict::Deny, Duration::from_secs(86_400));
        let router = router(guard.clone());

        let denied = router
            .clone()
            .oneshot(request("/check", "198.51.100.4"))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let allowed = router
            .oneshot(request("/check", "198.51.100.5"))
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);

        let stats = guard.gate().stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.lookups, 1);
        assert_eq!(stats.denials, 1);
    }

    #[tokio::test]
    async fn test_stats_and_healthz() {
        let (guard, _cache) = test_guard(0);
        let router = router(guard);

        let health = router
            .clone()
            .oneshot(HttpRequest::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let stats = router
            .oneshot(HttpRequest::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(stats.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_string(stats).await).unwrap();
        assert_eq!(body["lookups"], 0);
    }
}
