//! Update-opportunity action.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{Action, ExecutionContext};
use crate::error::{Error, Result};
use crate::storage::models::{AuditLogEntry, OpportunityUpdate, StageTransition};
use crate::storage::SqliteStorage;

/// Updates a sales opportunity, recording stage transitions.
pub struct UpdateOpportunityAction {
    storage: SqliteStorage,
}

impl UpdateOpportunityAction {
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct UpdateOpportunityParams {
    opportunity_id: Option<String>,
    stage: Option<String>,
    value: Option<f64>,
    probability: Option<f64>,
    expected_close_date: Option<String>,
    notes: Option<String>,
}

#[async_trait]
impl Action for UpdateOpportunityAction {
    fn action_type(&self) -> &str {
        "update_opportunity"
    }

    fn description(&self) -> &str {
        "Update an opportunity's stage, value, probability, close date, or notes"
    }

    async fn execute(&self, parameters: &Value, ctx: &ExecutionContext) -> Result<Value> {
        let params: UpdateOpportunityParams = serde_json::from_value(parameters.clone())
            .map_err(|e| {
                Error::Validation(format!("Invalid update_opportunity parameters: {}", e))
            })?;

        let opportunity_id = params
            .opportunity_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Validation("opportunityId must be provided".to_string()))?;

        let opportunity = self
            .storage
            .get_opportunity(&ctx.organization_id, &opportunity_id)
            .await?
            .ok_or_else(|| Error::NotFound("Opportunity not found".to_string()))?;

        let previous_stage = opportunity.stage.clone();

        let mut update = OpportunityUpdate::default();
        let mut updates = Map::new();

        if let Some(stage) = &params.stage {
            updates.insert("stage".to_string(), json!(stage));
            update.stage = Some(stage.clone());
        }
        if let Some(value) = params.value {
            updates.insert("value".to_string(), json!(value));
            update.value = Some(value);
        }
        if let Some(probability) = params.probability {
            updates.insert("probability".to_string(), json!(probability));
            update.probability = Some(probability);
        }
        if let Some(date) = &params.expected_close_date {
            updates.insert("expectedCloseDate".to_string(), json!(date));
            update.expected_close_date = Some(date.clone());
        }
        if let Some(notes) = &params.notes {
            updates.insert("notes".to_string(), json!(notes));
            update.notes = Some(notes.clone());
        }

        if !update.is_empty() {
            self.storage
                .update_opportunity(&ctx.organization_id, &opportunity_id, &update)
                .await?;
        }

        let new_stage = params.stage.clone().unwrap_or_else(|| previous_stage.clone());
        let now = Utc::now();

        if new_stage != previous_stage {
            self.storage
                .append_stage_transition(&StageTransition {
                    id: Uuid::new_v4().to_string(),
                    organization_id: ctx.organization_id.clone(),
                    opportunity_id: opportunity_id.clone(),
                    from_stage: previous_stage.clone(),
                    to_stage: new_stage.clone(),
                    execution_id: Some(ctx.execution_id.clone()),
                    created_at: now,
                })
                .await?;
        }

        self.storage
            .append_audit_log(&AuditLogEntry {
                id: Uuid::new_v4().to_string(),
                organization_id: ctx.organization_id.clone(),
                actor: ctx.actor(),
                action: "update_opportunity".to_string(),
                entity_type: "opportunity".to_string(),
                entity_id: opportunity_id.clone(),
                details: json!({
                    "updates": updates,
                    "previousStage": previous_stage,
                    "newStage": new_stage,
                    "executionId": ctx.execution_id,
                }),
                created_at: now,
            })
            .await?;

        Ok(json!({
            "opportunityId": opportunity_id,
            "updates": updates,
            "previousStage": previous_stage,
            "newStage": new_stage,
        }))
    }
}
