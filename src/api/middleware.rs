//! API middleware: request ids, access logging, rate limiting, cache health.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Instant;
use tracing::{info, Span};
use uuid::Uuid;

use crate::cache::monitor::CacheMonitor;
use crate::ratelimit::{RateLimitService, RequestIdentity};

// ============================================================================
// Request ID Middleware
// ============================================================================

/// Header name for request ID.
pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Request ID extension for extracting in handlers.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Middleware that ensures every request has a unique request ID.
///
/// If the incoming request has an `X-Request-ID` header, it is preserved
/// only when `GYMFLOW_TRUST_REQUEST_ID=true`; otherwise a new UUID is
/// generated. The id is recorded in the tracing span and echoed in the
/// response headers.
pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let trust_incoming = std::env::var("GYMFLOW_TRUST_REQUEST_ID")
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false);

    let request_id = if trust_incoming {
        request
            .headers()
            .get(&REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    } else {
        Uuid::new_v4().to_string()
    };

    Span::current().record("request_id", &request_id);
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(REQUEST_ID_HEADER.clone(), header_value);
    }

    response
}

// ============================================================================
// Structured Access Logging Middleware
// ============================================================================

/// Middleware that logs each request/response in structured form.
///
/// Environment:
/// - GYMFLOW_ACCESS_LOG: Set to "false" to disable (default: enabled)
pub async fn access_log_middleware(request: Request<Body>, next: Next) -> Response {
    let enabled = std::env::var("GYMFLOW_ACCESS_LOG")
        .map(|v| v.to_lowercase() != "false")
        .unwrap_or(true);

    if !enabled {
        return next.run(request).await;
    }

    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(|q| q.to_string());

    let client_ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string());

    let request_id = request.extensions().get::<RequestId>().map(|r| r.0.clone());

    let response = next.run(request).await;

    info!(
        target: "gymflow::access",
        method = %method,
        path = %path,
        query = ?query,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        request_id = ?request_id,
        client_ip = ?client_ip,
        "request completed"
    );

    response
}

// ============================================================================
// Rate Limit Middleware
// ============================================================================

/// Identity headers set by the (out-of-scope) auth layer in front of this
/// service. IP falls back to `X-Forwarded-For`.
const ORGANIZATION_HEADER: &str = "x-organization-id";
const USER_HEADER: &str = "x-user-id";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

fn identity_from_request(request: &Request<Body>) -> RequestIdentity {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };

    RequestIdentity {
        organization_id: header(ORGANIZATION_HEADER),
        user_id: header(USER_HEADER),
        ip: header(FORWARDED_FOR_HEADER)
            .and_then(|s| s.split(',').next().map(|p| p.trim().to_string())),
    }
}

/// Middleware that admits or rejects requests against the tenant's budget.
///
/// `X-RateLimit-Limit`, `X-RateLimit-Remaining`, and `X-RateLimit-Reset` are
/// set on admitted and rejected responses alike. Rejection is HTTP 429 with
/// `{"error": "Too many requests", "retryAfter": <seconds>}`.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimitService>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let identity = identity_from_request(&request);
    let decision = limiter.check(&identity).await;

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Too many requests",
                "retryAfter": decision.retry_after_secs(),
            })),
        )
            .into_response()
    };

    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset.timestamp().to_string()) {
        headers.insert("x-ratelimit-reset", v);
    }

    response
}

// ============================================================================
// Cache Health Middleware
// ============================================================================

/// Optional middleware that annotates responses with cache health headers:
/// `X-Cache-Status`, `X-Cache-Latency`, `X-Cache-Hit-Ratio`,
/// `X-Cache-Recommendation`.
pub async fn cache_health_middleware(
    State(monitor): State<CacheMonitor>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let snapshot = monitor.snapshot().await;
    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(
        "x-cache-status",
        HeaderValue::from_static(snapshot.status.as_str()),
    );
    if let Some(latency) = snapshot.latency_ms {
        if let Ok(v) = HeaderValue::from_str(&format!("{}ms", latency)) {
            headers.insert("x-cache-latency", v);
        }
    }
    if let Ok(v) = HeaderValue::from_str(&format!("{:.2}", snapshot.hit_ratio)) {
        headers.insert("x-cache-hit-ratio", v);
    }
    if let Ok(v) = HeaderValue::from_str(&snapshot.recommendation) {
        headers.insert("x-cache-recommendation", v);
    }

    response
}
