//! Prometheus metrics for gymflow.
//!
//! Exposed via the /api/metrics endpoint.
//!
//! ## Metrics
//!
//! ### Counters
//! - `gymflow_cache_requests_total` - Cache decorator lookups by result (hit|miss|bypass)
//! - `gymflow_rate_limit_decisions_total` - Limiter decisions by tier and outcome
//! - `gymflow_actions_executed_total` - Action executions by action_type and status
//! - `gymflow_webhook_verifications_total` - Webhook signature checks by outcome
//!
//! ### Histograms
//! - `gymflow_action_duration_seconds` - Action execution duration by action_type

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics exporter.
///
/// This should be called once at application startup.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("Failed to install Prometheus recorder")
        })
        .clone()
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

// =============================================================================
// Cache Metrics
// =============================================================================

/// Record a cache decorator lookup. `result` is "hit", "miss", or "bypass".
pub fn record_cache_request(result: &str) {
    counter!(
        "gymflow_cache_requests_total",
        "result" => result.to_string()
    )
    .increment(1);
}

// =============================================================================
// Rate Limit Metrics
// =============================================================================

/// Record a rate limiter decision.
pub fn record_rate_limit_decision(tier: &str, allowed: bool) {
    counter!(
        "gymflow_rate_limit_decisions_total",
        "tier" => tier.to_string(),
        "allowed" => allowed.to_string()
    )
    .increment(1);
}

// =============================================================================
// Action Metrics
// =============================================================================

/// Record an action execution.
pub fn record_action_execution(action_type: &str, status: &str) {
    counter!(
        "gymflow_actions_executed_total",
        "action_type" => action_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record action execution duration.
pub fn record_action_duration(duration: Duration, action_type: &str) {
    histogram!(
        "gymflow_action_duration_seconds",
        "action_type" => action_type.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Webhook Metrics
// =============================================================================

/// Record a webhook signature verification outcome.
/// `outcome` is "verified", "rejected", "replayed", or "flooded".
pub fn record_webhook_verification(outcome: &str) {
    counter!(
        "gymflow_webhook_verifications_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_without_init() {
        // Without initialization, render returns a placeholder.
        // Note: other tests may have initialized metrics already.
        let result = render_metrics();
        assert!(!result.is_empty());
    }
}
