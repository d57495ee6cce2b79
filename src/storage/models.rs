//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tenant organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    /// Subscription tier name ("basic", "pro", "enterprise")
    pub plan_tier: String,
    /// Shared secret for inbound webhook signature verification
    pub webhook_secret: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A sales lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: String,
    pub stage: Option<String>,
    pub assigned_to: Option<String>,
    pub tags: Vec<String>,
    /// Free-form per-tenant fields (JSON object)
    pub custom_fields: Value,
    pub score: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied to a lead. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct LeadUpdate {
    pub status: Option<String>,
    pub stage: Option<String>,
    pub assigned_to: Option<String>,
    pub tags: Option<Vec<String>>,
    /// Full replacement value; callers shallow-merge before persisting
    pub custom_fields: Option<Value>,
    pub score: Option<i64>,
}

impl LeadUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.stage.is_none()
            && self.assigned_to.is_none()
            && self.tags.is_none()
            && self.custom_fields.is_none()
            && self.score.is_none()
    }
}

/// A task created by an automation or a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub organization_id: String,
    pub title: String,
    pub description: Option<String>,
    pub assigned_to: String,
    pub due_date: Option<String>,
    pub priority: String,
    pub status: String,
    pub workflow_id: Option<String>,
    pub execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A sales opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub organization_id: String,
    pub lead_id: Option<String>,
    pub title: String,
    pub stage: String,
    pub value: Option<f64>,
    pub probability: Option<f64>,
    pub expected_close_date: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied to an opportunity.
#[derive(Debug, Clone, Default)]
pub struct OpportunityUpdate {
    pub stage: Option<String>,
    pub value: Option<f64>,
    pub probability: Option<f64>,
    pub expected_close_date: Option<String>,
    pub notes: Option<String>,
}

impl OpportunityUpdate {
    pub fn is_empty(&self) -> bool {
        self.stage.is_none()
            && self.value.is_none()
            && self.probability.is_none()
            && self.expected_close_date.is_none()
            && self.notes.is_none()
    }
}

/// An in-app notification addressed to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub body: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// An audit-log row recording a side-effecting operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub organization_id: String,
    /// What performed the change, e.g. "workflow:wf-1"
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    /// Structured detail (diff, parameters) as JSON
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

/// A lead history row describing one change as a diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadHistoryEntry {
    pub id: String,
    pub organization_id: String,
    pub lead_id: String,
    /// Map of changed field -> { "from": .., "to": .. }
    pub changes: Value,
    pub execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A recorded opportunity stage transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub id: String,
    pub organization_id: String,
    pub opportunity_id: String,
    pub from_stage: String,
    pub to_stage: String,
    pub execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A stored automation: a named, per-tenant list of actions run on trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub enabled: bool,
    /// JSON array of action configs
    pub actions: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Storage health summary reported by `gymflow db check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub foreign_keys_enabled: bool,
    pub integrity_check: String,
    pub organization_count: u64,
    pub lead_count: u64,
    pub automation_count: u64,
}
