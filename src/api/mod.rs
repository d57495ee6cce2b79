//! HTTP API server for gymflow.

pub mod middleware;
pub mod webhook;

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::actions::{ActionConfig, ActionRegistry, ExecutionContext};
use crate::cache::monitor::CacheMonitor;
use crate::cache::{CacheService, MemoryBackend, RedisBackend};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::ratelimit::RateLimitService;
use crate::storage::models::{Automation, Organization};
use crate::storage::SqliteStorage;
use crate::webhooks::{FloodLimiter, ReplayGuard};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub storage: SqliteStorage,
    pub cache: CacheService,
    pub limiter: RateLimitService,
    pub actions: Arc<ActionRegistry>,
    pub replay: Arc<ReplayGuard>,
    pub flood: Arc<FloodLimiter>,
}

impl AppState {
    pub fn new(storage: SqliteStorage, cache: CacheService, limiter: RateLimitService) -> Self {
        let actions = Arc::new(ActionRegistry::new(storage.clone()));
        Self {
            storage,
            cache,
            limiter,
            actions,
            replay: Arc::new(ReplayGuard::new()),
            flood: Arc::new(FloodLimiter::new()),
        }
    }
}

/// Wrap data in the `{success, data}` envelope.
fn success_json(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Create a sanitized error response for external consumers.
///
/// The full error is logged internally; the client sees only safe
/// information.
fn error_response(e: Error) -> Response {
    error!("API error: {:?}", e);
    (e.status(), Json(e.to_external_json())).into_response()
}

/// Create CORS layer based on environment configuration.
///
/// - GYMFLOW_CORS_ORIGINS: Comma-separated allowed origins (default: http://localhost:3000)
/// - GYMFLOW_CORS_ALLOW_ALL: Set to "true" to allow all origins (NOT recommended for production)
pub fn create_cors_layer() -> CorsLayer {
    let allow_all = std::env::var("GYMFLOW_CORS_ALLOW_ALL")
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false);

    if allow_all {
        warn!("CORS configured to allow all origins - this is NOT secure for production!");
        return CorsLayer::very_permissive();
    }

    let origins_str = std::env::var("GYMFLOW_CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000".to_string());

    let origins: Vec<HeaderValue> = origins_str
        .split(',')
        .filter_map(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            match trimmed.parse::<HeaderValue>() {
                Ok(hv) => Some(hv),
                Err(e) => {
                    warn!("Invalid CORS origin '{}': {}", trimmed, e);
                    None
                }
            }
        })
        .collect();

    let origins = if origins.is_empty() {
        vec!["http://localhost:3000".parse().unwrap()]
    } else {
        origins
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
        ])
}

/// Default maximum concurrent requests.
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Create a concurrency limit layer to prevent resource exhaustion.
///
/// - GYMFLOW_MAX_CONCURRENT_REQUESTS: Maximum concurrent requests (default: 100)
pub fn create_concurrency_limit() -> tower::limit::ConcurrencyLimitLayer {
    let max = std::env::var("GYMFLOW_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_CONCURRENT_REQUESTS);
    tower::limit::ConcurrencyLimitLayer::new(max)
}

/// Create the API router (without state applied).
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/metrics", get(metrics_endpoint))
        .route("/api/organizations", post(create_organization))
        .route("/api/organizations/{id}", get(get_organization))
        .route(
            "/api/automations",
            get(list_automations).post(create_automation),
        )
        .route("/api/automations/{id}", get(get_automation))
        .route("/api/automations/{id}/execute", post(execute_automation))
}

/// Build the full application router with middleware applied.
pub fn create_app(state: AppState) -> Router {
    let monitor = CacheMonitor::new(state.cache.clone());

    create_api_routes()
        .merge(webhook::webhook_routes())
        .layer(axum::middleware::from_fn_with_state(
            state.limiter.clone(),
            middleware::rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            monitor,
            middleware::cache_health_middleware,
        ))
        .layer(axum::middleware::from_fn(
            middleware::access_log_middleware,
        ))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(create_cors_layer())
        .layer(create_concurrency_limit())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server with the given configuration.
pub async fn run_server(config: Config) -> Result<()> {
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let storage = SqliteStorage::open(&db_path)?;

    let cache = match &config.cache.redis_url {
        Some(url) => match RedisBackend::connect(url).await {
            Ok(backend) => {
                info!("cache backend: redis");
                CacheService::new(Arc::new(backend))
            }
            Err(e) => {
                warn!(error = %e, "redis unavailable, continuing without cache");
                CacheService::disabled()
            }
        },
        None => {
            info!("cache backend: in-memory");
            CacheService::new(Arc::new(MemoryBackend::new()))
        }
    };

    let limiter =
        RateLimitService::new(config.rate_limit.clone()).with_storage(storage.clone());

    let state = AppState::new(storage, cache, limiter);
    let app = create_app(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("gymflow listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_check(State(state): State<AppState>) -> Response {
    let database = match state.storage.health_check().await {
        Ok(health) => json!({
            "ok": health.integrity_check == "ok",
            "organizations": health.organization_count,
            "leads": health.lead_count,
            "automations": health.automation_count,
        }),
        Err(e) => {
            error!("health check storage error: {:?}", e);
            json!({ "ok": false })
        }
    };

    let cache = CacheMonitor::new(state.cache.clone()).snapshot().await;

    success_json(json!({
        "status": "ok",
        "database": database,
        "cache": cache,
    }))
    .into_response()
}

async fn metrics_endpoint() -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::render_metrics(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrganizationRequest {
    id: Option<String>,
    name: String,
    #[serde(default)]
    plan_tier: Option<String>,
    #[serde(default)]
    webhook_secret: Option<String>,
}

async fn create_organization(
    State(state): State<AppState>,
    Json(body): Json<CreateOrganizationRequest>,
) -> Response {
    if body.name.trim().is_empty() {
        return error_response(Error::Validation("name is required".to_string()));
    }

    let org = Organization {
        id: body.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        name: body.name,
        plan_tier: body.plan_tier.unwrap_or_else(|| "basic".to_string()),
        webhook_secret: body.webhook_secret,
        created_at: Utc::now(),
    };

    match state.storage.get_organization(&org.id).await {
        Ok(Some(_)) => {
            return error_response(Error::Conflict(format!(
                "Organization '{}' already exists",
                org.id
            )));
        }
        Ok(None) => {}
        Err(e) => return error_response(e),
    }

    match state.storage.create_organization(&org).await {
        Ok(()) => (
            StatusCode::CREATED,
            success_json(serde_json::to_value(&org).unwrap_or_default()),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_organization(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.storage.get_organization(&id).await {
        Ok(Some(org)) => {
            success_json(serde_json::to_value(&org).unwrap_or_default()).into_response()
        }
        Ok(None) => error_response(Error::NotFound("Organization not found".to_string())),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrganizationQuery {
    organization_id: String,
}

async fn list_automations(
    State(state): State<AppState>,
    Query(query): Query<OrganizationQuery>,
) -> Response {
    match state.storage.list_automations(&query.organization_id).await {
        Ok(automations) => {
            success_json(serde_json::to_value(&automations).unwrap_or_default()).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAutomationRequest {
    organization_id: String,
    name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    actions: Vec<ActionConfig>,
}

fn default_enabled() -> bool {
    true
}

async fn create_automation(
    State(state): State<AppState>,
    Json(body): Json<CreateAutomationRequest>,
) -> Response {
    if body.name.trim().is_empty() {
        return error_response(Error::Validation("name is required".to_string()));
    }

    match state.storage.get_organization(&body.organization_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(Error::NotFound("Organization not found".to_string())),
        Err(e) => return error_response(e),
    }

    // Reject unknown action types at authoring time, not execution time
    for action in &body.actions {
        if !state.actions.has(&action.action_type) {
            return error_response(Error::Validation(format!(
                "Unknown action type: {}",
                action.action_type
            )));
        }
    }

    let now = Utc::now();
    let automation = Automation {
        id: Uuid::new_v4().to_string(),
        organization_id: body.organization_id,
        name: body.name,
        enabled: body.enabled,
        actions: serde_json::to_value(&body.actions).unwrap_or_else(|_| json!([])),
        created_at: now,
        updated_at: now,
    };

    match state.storage.create_automation(&automation).await {
        Ok(()) => (
            StatusCode::CREATED,
            success_json(serde_json::to_value(&automation).unwrap_or_default()),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<OrganizationQuery>,
) -> Response {
    match state
        .storage
        .get_automation(&query.organization_id, &id)
        .await
    {
        Ok(Some(automation)) => {
            success_json(serde_json::to_value(&automation).unwrap_or_default()).into_response()
        }
        Ok(None) => error_response(Error::NotFound("Automation not found".to_string())),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteAutomationRequest {
    organization_id: String,
    #[serde(default)]
    trigger_payload: Value,
}

async fn execute_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ExecuteAutomationRequest>,
) -> Response {
    let automation = match state
        .storage
        .get_automation(&body.organization_id, &id)
        .await
    {
        Ok(Some(a)) => a,
        Ok(None) => return error_response(Error::NotFound("Automation not found".to_string())),
        Err(e) => return error_response(e),
    };

    let configs: Vec<ActionConfig> = match serde_json::from_value(automation.actions.clone()) {
        Ok(c) => c,
        Err(e) => {
            return error_response(Error::Internal(format!(
                "Stored automation '{}' has malformed actions: {}",
                automation.id, e
            )));
        }
    };

    let execution_id = Uuid::new_v4().to_string();
    let ctx = ExecutionContext::new(
        &body.organization_id,
        &automation.id,
        &execution_id,
        body.trigger_payload,
    );

    let results = state.actions.execute_all(&configs, &ctx).await;
    let all_succeeded = results.iter().all(|r| r.success);

    // Actions mutate organization-scoped rows; drop the well-known cached
    // resources for the tenant.
    state.cache.invalidate_organization(&body.organization_id).await;

    success_json(json!({
        "executionId": execution_id,
        "automationId": automation.id,
        "success": all_succeeded,
        "results": results,
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitTiersConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let cache = CacheService::new(Arc::new(MemoryBackend::new()));
        let limiter = RateLimitService::new(RateLimitTiersConfig::default())
            .with_storage(storage.clone());
        AppState::new(storage, cache, limiter)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = create_api_routes().with_state(test_state().await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["status"], "ok");
        assert_eq!(json["data"]["database"]["ok"], true);
    }

    #[tokio::test]
    async fn test_organization_create_and_get() {
        let app = create_api_routes().with_state(test_state().await);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/organizations",
                json!({"id": "org-1", "name": "Test Gym", "planTier": "pro"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/organizations/org-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["plan_tier"], "pro");

        // Duplicate id conflicts
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/organizations",
                json!({"id": "org-1", "name": "Other"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Unknown id is a 404
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/organizations/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_automation_rejects_unknown_action_type() {
        let state = test_state().await;
        let app = create_api_routes().with_state(state.clone());

        app.clone()
            .oneshot(post_json(
                "/api/organizations",
                json!({"id": "org-1", "name": "Test Gym"}),
            ))
            .await
            .unwrap();

        let response = app
            .oneshot(post_json(
                "/api/automations",
                json!({
                    "organizationId": "org-1",
                    "name": "bad",
                    "actions": [{"actionType": "launch_rocket", "parameters": {}}]
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Unknown action type"));
    }

    #[tokio::test]
    async fn test_automation_create_and_execute() {
        let state = test_state().await;
        let app = create_api_routes().with_state(state.clone());

        app.clone()
            .oneshot(post_json(
                "/api/organizations",
                json!({"id": "org-1", "name": "Test Gym"}),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/automations",
                json!({
                    "organizationId": "org-1",
                    "name": "welcome-call",
                    "actions": [{
                        "actionType": "create_task",
                        "parameters": {"title": "Call {{lead.name}}", "assignedTo": "user-42"}
                    }]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        let automation_id = created["data"]["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(post_json(
                &format!("/api/automations/{}/execute", automation_id),
                json!({
                    "organizationId": "org-1",
                    "triggerPayload": {"lead": {"name": "Ada"}}
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["data"]["success"], true);
        assert_eq!(json["data"]["results"][0]["output"]["title"], "Call Ada");

        // The task exists and the assignee got exactly one notification
        let notifications = state
            .storage
            .list_notifications_for_user("org-1", "user-42")
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_unknown_automation_is_404() {
        let state = test_state().await;
        let app = create_api_routes().with_state(state);

        let response = app
            .oneshot(post_json(
                "/api/automations/nope/execute",
                json!({"organizationId": "org-1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
