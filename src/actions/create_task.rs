//! Create-task action.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::{Action, ExecutionContext};
use crate::error::{Error, Result};
use crate::storage::models::{Notification, Task};
use crate::storage::SqliteStorage;

/// Creates a pending task and notifies the assignee.
pub struct CreateTaskAction {
    storage: SqliteStorage,
}

impl CreateTaskAction {
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct CreateTaskParams {
    title: Option<String>,
    description: Option<String>,
    assigned_to: Option<String>,
    due_date: Option<String>,
    priority: Option<String>,
}

#[async_trait]
impl Action for CreateTaskAction {
    fn action_type(&self) -> &str {
        "create_task"
    }

    fn description(&self) -> &str {
        "Create a pending task and notify the assignee"
    }

    async fn execute(&self, parameters: &Value, ctx: &ExecutionContext) -> Result<Value> {
        let params: CreateTaskParams = serde_json::from_value(parameters.clone())
            .map_err(|e| Error::Validation(format!("Invalid create_task parameters: {}", e)))?;

        let title = params
            .title
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Validation("title is required".to_string()))?;
        let assigned_to = params
            .assigned_to
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::Validation("assignedTo is required".to_string()))?;

        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            organization_id: ctx.organization_id.clone(),
            title: title.clone(),
            description: params.description,
            assigned_to: assigned_to.clone(),
            due_date: params.due_date.clone(),
            priority: params.priority.unwrap_or_else(|| "medium".to_string()),
            status: "pending".to_string(),
            workflow_id: Some(ctx.workflow_id.clone()),
            execution_id: Some(ctx.execution_id.clone()),
            created_at: now,
            updated_at: now,
        };
        self.storage.create_task(&task).await?;

        self.storage
            .create_notification(&Notification {
                id: Uuid::new_v4().to_string(),
                organization_id: ctx.organization_id.clone(),
                user_id: assigned_to.clone(),
                kind: "task_assigned".to_string(),
                title: format!("New task: {}", title),
                body: task.description.clone(),
                read: false,
                created_at: now,
            })
            .await?;

        Ok(json!({
            "taskId": task.id,
            "title": task.title,
            "assignedTo": task.assigned_to,
            "dueDate": task.due_date,
            "createdAt": task.created_at.to_rfc3339(),
        }))
    }
}
