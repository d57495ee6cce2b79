//! Update-lead action.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{Action, ExecutionContext};
use crate::error::{Error, Result};
use crate::storage::models::{AuditLogEntry, Lead, LeadHistoryEntry, LeadUpdate};
use crate::storage::SqliteStorage;

/// Updates a lead's CRM fields, recording the diff for audit and undo.
pub struct UpdateLeadAction {
    storage: SqliteStorage,
}

impl UpdateLeadAction {
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct UpdateLeadParams {
    lead_id: Option<String>,
    lead_email: Option<String>,
    status: Option<String>,
    stage: Option<String>,
    assigned_to: Option<String>,
    tags: Option<Vec<String>>,
    custom_fields: Option<Map<String, Value>>,
    score: Option<i64>,
}

#[async_trait]
impl Action for UpdateLeadAction {
    fn action_type(&self) -> &str {
        "update_lead"
    }

    fn description(&self) -> &str {
        "Update a lead's status, stage, assignment, tags, custom fields, or score"
    }

    async fn execute(&self, parameters: &Value, ctx: &ExecutionContext) -> Result<Value> {
        let params: UpdateLeadParams = serde_json::from_value(parameters.clone())
            .map_err(|e| Error::Validation(format!("Invalid update_lead parameters: {}", e)))?;

        // Target by id, falling back to email. Id wins when both are given.
        let lead = match (
            params.lead_id.as_deref().filter(|s| !s.is_empty()),
            params.lead_email.as_deref().filter(|s| !s.is_empty()),
        ) {
            (Some(id), _) => self.storage.get_lead(&ctx.organization_id, id).await?,
            (None, Some(email)) => {
                self.storage
                    .get_lead_by_email(&ctx.organization_id, email)
                    .await?
            }
            (None, None) => {
                return Err(Error::Validation(
                    "Either leadId or leadEmail must be provided".to_string(),
                ));
            }
        };

        let lead = lead.ok_or_else(|| Error::NotFound("Lead not found".to_string()))?;

        let (update, updates, previous_values, changes) = build_update(&lead, &params);

        if !update.is_empty() {
            self.storage
                .update_lead(&ctx.organization_id, &lead.id, &update)
                .await?;
        }

        // Audit trail: one audit-log row plus one history row describing the
        // diff. The read-then-write above is not transactional, so the
        // recorded previous values reflect the row as read, not necessarily
        // the row as overwritten.
        let now = Utc::now();
        self.storage
            .append_audit_log(&AuditLogEntry {
                id: Uuid::new_v4().to_string(),
                organization_id: ctx.organization_id.clone(),
                actor: ctx.actor(),
                action: "update_lead".to_string(),
                entity_type: "lead".to_string(),
                entity_id: lead.id.clone(),
                details: json!({
                    "updates": updates,
                    "previousValues": previous_values,
                    "executionId": ctx.execution_id,
                }),
                created_at: now,
            })
            .await?;
        self.storage
            .append_lead_history(&LeadHistoryEntry {
                id: Uuid::new_v4().to_string(),
                organization_id: ctx.organization_id.clone(),
                lead_id: lead.id.clone(),
                changes: Value::Object(changes),
                execution_id: Some(ctx.execution_id.clone()),
                created_at: now,
            })
            .await?;

        Ok(json!({
            "leadId": lead.id,
            "updates": updates,
            "previousValues": previous_values,
        }))
    }
}

/// Compute the storage update, the applied-updates map, the previous values
/// of every changed field, and the per-field diff for the history row.
fn build_update(
    lead: &Lead,
    params: &UpdateLeadParams,
) -> (LeadUpdate, Map<String, Value>, Map<String, Value>, Map<String, Value>) {
    let mut update = LeadUpdate::default();
    let mut updates = Map::new();
    let mut previous = Map::new();
    let mut changes = Map::new();

    let mut record =
        |field: &str, old: Value, new: Value, changed: bool| {
            updates.insert(field.to_string(), new.clone());
            if changed {
                previous.insert(field.to_string(), old.clone());
                changes.insert(field.to_string(), json!({ "from": old, "to": new }));
            }
        };

    if let Some(status) = &params.status {
        let changed = *status != lead.status;
        record("status", json!(lead.status), json!(status), changed);
        update.status = Some(status.clone());
    }
    if let Some(stage) = &params.stage {
        let changed = Some(stage) != lead.stage.as_ref();
        record("stage", json!(lead.stage), json!(stage), changed);
        update.stage = Some(stage.clone());
    }
    if let Some(assigned_to) = &params.assigned_to {
        let changed = Some(assigned_to) != lead.assigned_to.as_ref();
        record(
            "assignedTo",
            json!(lead.assigned_to),
            json!(assigned_to),
            changed,
        );
        update.assigned_to = Some(assigned_to.clone());
    }
    if let Some(tags) = &params.tags {
        let changed = *tags != lead.tags;
        record("tags", json!(lead.tags), json!(tags), changed);
        update.tags = Some(tags.clone());
    }
    if let Some(incoming) = &params.custom_fields {
        // Shallow merge: incoming keys overwrite, existing keys not present
        // in the update are preserved.
        let mut merged = lead
            .custom_fields
            .as_object()
            .cloned()
            .unwrap_or_default();
        for (k, v) in incoming {
            merged.insert(k.clone(), v.clone());
        }
        let merged = Value::Object(merged);
        let changed = merged != lead.custom_fields;
        record(
            "customFields",
            lead.custom_fields.clone(),
            merged.clone(),
            changed,
        );
        update.custom_fields = Some(merged);
    }
    if let Some(score) = params.score {
        let changed = Some(score) != lead.score;
        record("score", json!(lead.score), json!(score), changed);
        update.score = Some(score);
    }

    (update, updates, previous, changes)
}
