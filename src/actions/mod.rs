//! Workflow action execution.
//!
//! Actions are the building blocks of automations. Each action performs one
//! side-effecting operation against tenant data (update a lead, create a
//! task, update an opportunity) and reports a structured result. Failures
//! never cross the action boundary as errors: the registry converts them
//! into a `NodeExecutionResult` the workflow runner can branch on.

mod create_task;
pub mod template;
mod update_lead;
mod update_opportunity;

pub use create_task::CreateTaskAction;
pub use update_lead::UpdateLeadAction;
pub use update_opportunity::UpdateOpportunityAction;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::storage::SqliteStorage;

/// Context for one workflow run, created fresh per trigger.
///
/// Immutable for the duration of an action's execution; never persisted by
/// this layer.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub organization_id: String,
    pub workflow_id: String,
    pub execution_id: String,
    pub trigger_payload: Value,
}

impl ExecutionContext {
    pub fn new(
        organization_id: &str,
        workflow_id: &str,
        execution_id: &str,
        trigger_payload: Value,
    ) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            workflow_id: workflow_id.to_string(),
            execution_id: execution_id.to_string(),
            trigger_payload,
        }
    }

    /// Template scope for parameter interpolation.
    ///
    /// Trigger payload fields sit at the root; `workflow_id`, `execution_id`,
    /// and `organization_id` are reserved entries. Payload keys win on
    /// collision.
    pub fn scope(&self) -> Value {
        let mut scope = serde_json::Map::new();
        scope.insert("workflow_id".to_string(), json!(self.workflow_id));
        scope.insert("execution_id".to_string(), json!(self.execution_id));
        scope.insert("organization_id".to_string(), json!(self.organization_id));

        if let Value::Object(payload) = &self.trigger_payload {
            for (k, v) in payload {
                scope.insert(k.clone(), v.clone());
            }
        } else if !self.trigger_payload.is_null() {
            scope.insert("payload".to_string(), self.trigger_payload.clone());
        }

        Value::Object(scope)
    }

    /// Actor string recorded in audit rows.
    pub fn actor(&self) -> String {
        format!("workflow:{}", self.workflow_id)
    }
}

/// A declarative action: type plus parameters.
///
/// Parameter keys use camelCase (authored by the workflow-builder UI); string
/// values may contain `{{path}}` placeholders resolved at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(rename = "actionType")]
    pub action_type: String,

    #[serde(default = "empty_object")]
    pub parameters: Value,
}

fn empty_object() -> Value {
    json!({})
}

/// Result of one action invocation. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionResult {
    pub success: bool,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeExecutionResult {
    /// Successful result with output data.
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    /// Failed result. The message is mirrored into the output map so runners
    /// that only look at output still see the failure.
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            output: json!({ "error": message }),
            error: Some(message),
        }
    }
}

/// Trait that all action types implement.
#[async_trait]
pub trait Action: Send + Sync {
    /// Action type name (e.g. "update_lead").
    fn action_type(&self) -> &str;

    /// Execute the action with already-interpolated parameters.
    ///
    /// Returns the output map on success. Errors are converted to a failed
    /// `NodeExecutionResult` by the registry; implementations use
    /// `Error::Validation` / `Error::NotFound` for caller-visible messages.
    async fn execute(&self, parameters: &Value, ctx: &ExecutionContext) -> Result<Value>;

    /// Human-readable description of this action type.
    fn description(&self) -> &str {
        "A workflow action"
    }
}

/// Registry of available action types.
#[derive(Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    /// Create a registry with the built-in actions wired to storage.
    pub fn new(storage: SqliteStorage) -> Self {
        let mut registry = Self {
            actions: HashMap::new(),
        };

        registry.register(Arc::new(UpdateLeadAction::new(storage.clone())));
        registry.register(Arc::new(CreateTaskAction::new(storage.clone())));
        registry.register(Arc::new(UpdateOpportunityAction::new(storage)));

        registry
    }

    /// Create an empty registry (for testing).
    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Register an action type.
    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.action_type().to_string(), action);
    }

    /// Check if an action type is registered.
    pub fn has(&self, action_type: &str) -> bool {
        self.actions.contains_key(action_type)
    }

    /// List registered action types.
    pub fn list(&self) -> Vec<&str> {
        self.actions.keys().map(|s| s.as_str()).collect()
    }

    /// Execute one action and report a structured result.
    ///
    /// String parameters are interpolated against the context scope before
    /// dispatch. All errors from the action body are caught and returned as
    /// a failed result; this function never returns `Err`.
    pub async fn execute(
        &self,
        config: &ActionConfig,
        ctx: &ExecutionContext,
    ) -> NodeExecutionResult {
        let Some(action) = self.actions.get(&config.action_type) else {
            let message = format!("Unknown action type: {}", config.action_type);
            warn!(action_type = %config.action_type, "unknown action type");
            crate::metrics::record_action_execution(&config.action_type, "unknown");
            return NodeExecutionResult::failed(message);
        };

        let scope = ctx.scope();
        let parameters = template::interpolate_value(&config.parameters, &scope);

        let start = Instant::now();
        let result = match action.execute(&parameters, ctx).await {
            Ok(output) => NodeExecutionResult::ok(output),
            Err(e) => NodeExecutionResult::failed(action_error_message(e)),
        };

        let status = if result.success { "success" } else { "failed" };
        crate::metrics::record_action_execution(&config.action_type, status);
        crate::metrics::record_action_duration(start.elapsed(), &config.action_type);

        info!(
            action_type = %config.action_type,
            execution_id = %ctx.execution_id,
            success = result.success,
            duration_ms = start.elapsed().as_millis() as u64,
            "action executed"
        );

        result
    }

    /// Execute a sequence of actions, collecting each result.
    ///
    /// A failed action does not stop the sequence; the runner inspects the
    /// per-action results.
    pub async fn execute_all(
        &self,
        configs: &[ActionConfig],
        ctx: &ExecutionContext,
    ) -> Vec<NodeExecutionResult> {
        let mut results = Vec::with_capacity(configs.len());
        for config in configs {
            results.push(self.execute(config, ctx).await);
        }
        results
    }
}

/// Extract the caller-visible message from an action error.
///
/// Validation and not-found errors keep their bare message (they are the
/// action's own wording); everything else is sanitized.
fn action_error_message(error: Error) -> String {
    match error {
        Error::Validation(msg) | Error::NotFound(msg) => msg,
        other => other.external_message(),
    }
}
