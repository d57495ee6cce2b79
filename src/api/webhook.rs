//! Signature-verified webhook ingress.
//!
//! Deliveries must carry a valid HMAC signature over the raw body before
//! their contents are trusted. Verified deliveries pass the replay guard and
//! flood limiter, then trigger every enabled automation for the tenant.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::AppState;
use crate::actions::{ActionConfig, ExecutionContext};
use crate::webhooks::{verify_request, HmacAlgorithm};

/// Header carrying the hex HMAC-SHA256 signature of the raw body.
const SIGNATURE_HEADER: &str = "x-webhook-signature";
/// Optional delivery id used for replay detection.
const WEBHOOK_ID_HEADER: &str = "x-webhook-id";

/// Create the webhook ingress routes.
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route(
        "/webhooks/{organization_id}/{source}",
        post(handle_webhook),
    )
}

async fn handle_webhook(
    State(state): State<AppState>,
    Path((organization_id, source)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let org = match state.storage.get_organization(&organization_id).await {
        Ok(Some(org)) => org,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"success": false, "error": "Organization not found"})),
            )
                .into_response();
        }
        Err(e) => {
            warn!(error = %e, "webhook organization lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": "A storage error occurred"})),
            )
                .into_response();
        }
    };

    // Verification failure must return non-2xx without processing the body.
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let verification = verify_request(
        &body,
        signature,
        org.webhook_secret.as_deref(),
        HmacAlgorithm::Sha256,
    );

    if !verification.verified {
        let reason = verification
            .error
            .unwrap_or_else(|| "Invalid signature".to_string());
        warn!(organization_id = %organization_id, source = %source, %reason, "webhook rejected");
        crate::metrics::record_webhook_verification("rejected");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "error": reason})),
        )
            .into_response();
    }
    crate::metrics::record_webhook_verification("verified");

    // Duplicate deliveries are acknowledged without reprocessing so the
    // provider stops retrying.
    if let Some(webhook_id) = headers.get(WEBHOOK_ID_HEADER).and_then(|v| v.to_str().ok()) {
        let replay_key = format!("{}:{}", organization_id, webhook_id);
        if !state.replay.check_and_remember(&replay_key) {
            info!(organization_id = %organization_id, webhook_id, "duplicate webhook delivery dropped");
            crate::metrics::record_webhook_verification("replayed");
            return Json(json!({"success": true, "data": {"duplicate": true}})).into_response();
        }
    }

    let flood_key = format!("{}:{}", organization_id, source);
    if !state.flood.allow(&flood_key) {
        warn!(organization_id = %organization_id, source = %source, "webhook flood limit hit");
        crate::metrics::record_webhook_verification("flooded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "Too many requests", "retryAfter": 60})),
        )
            .into_response();
    }

    let payload = verification.payload.unwrap_or(serde_json::Value::Null);

    let automations = match state
        .storage
        .list_enabled_automations(&organization_id)
        .await
    {
        Ok(automations) => automations,
        Err(e) => {
            warn!(error = %e, "failed to load automations for webhook");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": "A storage error occurred"})),
            )
                .into_response();
        }
    };

    let mut executions = Vec::with_capacity(automations.len());
    for automation in &automations {
        let configs: Vec<ActionConfig> = match serde_json::from_value(automation.actions.clone()) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    automation_id = %automation.id,
                    error = %e,
                    "skipping automation with malformed actions"
                );
                continue;
            }
        };

        // Fresh context per automation run
        let execution_id = Uuid::new_v4().to_string();
        let ctx = ExecutionContext::new(
            &organization_id,
            &automation.id,
            &execution_id,
            payload.clone(),
        );

        let results = state.actions.execute_all(&configs, &ctx).await;
        executions.push(json!({
            "automationId": automation.id,
            "executionId": execution_id,
            "success": results.iter().all(|r| r.success),
            "results": results,
        }));
    }

    if !executions.is_empty() {
        state.cache.invalidate_organization(&organization_id).await;
    }

    info!(
        organization_id = %organization_id,
        source = %source,
        automations = executions.len(),
        "webhook processed"
    );

    Json(json!({"success": true, "data": {"executions": executions}})).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheService, MemoryBackend};
    use crate::config::RateLimitTiersConfig;
    use crate::ratelimit::RateLimitService;
    use crate::storage::models::{Automation, Organization};
    use crate::storage::SqliteStorage;
    use crate::webhooks::signature::compute_signature;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use std::sync::Arc;
    use tower::ServiceExt;

    const SECRET: &str = "whsec_test";

    async fn test_state() -> AppState {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .create_organization(&Organization {
                id: "org-1".to_string(),
                name: "Test Gym".to_string(),
                plan_tier: "basic".to_string(),
                webhook_secret: Some(SECRET.to_string()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let now = Utc::now();
        storage
            .create_automation(&Automation {
                id: "auto-1".to_string(),
                organization_id: "org-1".to_string(),
                name: "welcome".to_string(),
                enabled: true,
                actions: serde_json::json!([{
                    "actionType": "create_task",
                    "parameters": {"title": "Call {{lead.name}}", "assignedTo": "user-42"}
                }]),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let cache = CacheService::new(Arc::new(MemoryBackend::new()));
        let limiter =
            RateLimitService::new(RateLimitTiersConfig::default()).with_storage(storage.clone());
        AppState::new(storage, cache, limiter)
    }

    fn app(state: AppState) -> Router {
        webhook_routes().with_state(state)
    }

    fn signed_request(body: &str, extra_headers: &[(&str, &str)]) -> Request<Body> {
        let signature = compute_signature(SECRET, body.as_bytes(), HmacAlgorithm::Sha256);
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhooks/org-1/lead-form")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature);
        for (name, value) in extra_headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_valid_delivery_runs_automations() {
        let state = test_state().await;
        let app = app(state.clone());

        let response = app
            .oneshot(signed_request(r#"{"lead": {"name": "Ada"}}"#, &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let executions = json["data"]["executions"].as_array().unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0]["success"], true);
        assert_eq!(executions[0]["results"][0]["output"]["title"], "Call Ada");

        let notifications = state
            .storage
            .list_notifications_for_user("org-1", "user-42")
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_signature_rejected_without_processing() {
        let state = test_state().await;
        let app = app(state.clone());

        let body = r#"{"lead": {"name": "Ada"}}"#;
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/org-1/lead-form")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, "00".repeat(32))
            .body(Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Nothing executed
        let notifications = state
            .storage
            .list_notifications_for_user("org-1", "user-42")
            .await
            .unwrap();
        assert!(notifications.is_empty());
    }

    #[tokio::test]
    async fn test_missing_signature_header_is_distinct() {
        let state = test_state().await;
        let app = app(state);

        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/org-1/lead-form")
            .body(Body::from("{}"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Missing signature header");
    }

    #[tokio::test]
    async fn test_unknown_organization_404() {
        let state = test_state().await;
        let app = app(state);

        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/org-nope/lead-form")
            .header(SIGNATURE_HEADER, "aa")
            .body(Body::from("{}"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_acknowledged_once() {
        let state = test_state().await;
        let app = app(state.clone());

        let body = r#"{"lead": {"name": "Ada"}}"#;
        let headers = [("x-webhook-id", "evt-1")];

        let response = app
            .clone()
            .oneshot(signed_request(body, &headers))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(signed_request(body, &headers)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["duplicate"], true);

        // Only the first delivery executed the automation
        let notifications = state
            .storage
            .list_notifications_for_user("org-1", "user-42")
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
    }

    #[tokio::test]
    async fn test_org_without_secret_rejects_deliveries() {
        let state = test_state().await;
        state
            .storage
            .create_organization(&Organization {
                id: "org-2".to_string(),
                name: "No Secret Gym".to_string(),
                plan_tier: "basic".to_string(),
                webhook_secret: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let app = app(state);

        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/org-2/lead-form")
            .header(SIGNATURE_HEADER, "aa")
            .body(Body::from("{}"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["error"], "Webhook secret not configured");
    }
}
