//! SQLite storage implementation.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use super::models::*;
use crate::error::Result;

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Parse a JSON text column, mapping failures into a `rusqlite::Error`.
fn parse_json_column(s: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        Self::init_schema_sync(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &mut Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Enable WAL mode for better concurrent reads during writes
            PRAGMA journal_mode = WAL;
            -- Wait up to 5 seconds when database is locked instead of failing immediately
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS organizations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                plan_tier TEXT NOT NULL DEFAULT 'basic',
                webhook_secret TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                name TEXT NOT NULL,
                email TEXT,
                phone TEXT,
                status TEXT NOT NULL DEFAULT 'new',
                stage TEXT,
                assigned_to TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                custom_fields TEXT NOT NULL DEFAULT '{}',
                score INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (organization_id) REFERENCES organizations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_leads_org ON leads(organization_id);
            CREATE INDEX IF NOT EXISTS idx_leads_org_email ON leads(organization_id, email);

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                assigned_to TEXT NOT NULL,
                due_date TEXT,
                priority TEXT NOT NULL DEFAULT 'medium',
                status TEXT NOT NULL DEFAULT 'pending',
                workflow_id TEXT,
                execution_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (organization_id) REFERENCES organizations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_org ON tasks(organization_id);

            CREATE TABLE IF NOT EXISTS opportunities (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                lead_id TEXT,
                title TEXT NOT NULL,
                stage TEXT NOT NULL,
                value REAL,
                probability REAL,
                expected_close_date TEXT,
                notes TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (organization_id) REFERENCES organizations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_opportunities_org ON opportunities(organization_id);

            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT,
                read INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (organization_id) REFERENCES organizations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(organization_id, user_id);

            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                FOREIGN KEY (organization_id) REFERENCES organizations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_audit_org_entity ON audit_log(organization_id, entity_id);

            CREATE TABLE IF NOT EXISTS lead_history (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                lead_id TEXT NOT NULL,
                changes TEXT NOT NULL,
                execution_id TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (organization_id) REFERENCES organizations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_lead_history_lead ON lead_history(organization_id, lead_id);

            CREATE TABLE IF NOT EXISTS stage_transitions (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                opportunity_id TEXT NOT NULL,
                from_stage TEXT NOT NULL,
                to_stage TEXT NOT NULL,
                execution_id TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (organization_id) REFERENCES organizations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_transitions_opp ON stage_transitions(organization_id, opportunity_id);

            CREATE TABLE IF NOT EXISTS automations (
                id TEXT PRIMARY KEY,
                organization_id TEXT NOT NULL,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                actions TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (organization_id) REFERENCES organizations(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_automations_org ON automations(organization_id);
            "#,
        )?;
        Ok(())
    }

    // =========================================================================
    // Organizations
    // =========================================================================

    pub async fn create_organization(&self, org: &Organization) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO organizations (id, name, plan_tier, webhook_secret, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                org.id,
                org.name,
                org.plan_tier,
                org.webhook_secret,
                org.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_organization(&self, id: &str) -> Result<Option<Organization>> {
        let conn = self.conn.lock().await;
        let org = conn
            .query_row(
                "SELECT id, name, plan_tier, webhook_secret, created_at
                 FROM organizations WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Organization {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        plan_tier: row.get(2)?,
                        webhook_secret: row.get(3)?,
                        created_at: parse_datetime_utc(&row.get::<_, String>(4)?)?,
                    })
                },
            )
            .optional()?;
        Ok(org)
    }

    // =========================================================================
    // Leads
    // =========================================================================

    fn lead_from_row(row: &Row<'_>) -> rusqlite::Result<Lead> {
        let tags: serde_json::Value = parse_json_column(&row.get::<_, String>(8)?)?;
        let tags = tags
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Lead {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            name: row.get(2)?,
            email: row.get(3)?,
            phone: row.get(4)?,
            status: row.get(5)?,
            stage: row.get(6)?,
            assigned_to: row.get(7)?,
            tags,
            custom_fields: parse_json_column(&row.get::<_, String>(9)?)?,
            score: row.get(10)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(11)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(12)?)?,
        })
    }

    const LEAD_COLUMNS: &'static str = "id, organization_id, name, email, phone, status, stage, \
                                        assigned_to, tags, custom_fields, score, created_at, updated_at";

    pub async fn create_lead(&self, lead: &Lead) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO leads (id, organization_id, name, email, phone, status, stage,
                                assigned_to, tags, custom_fields, score, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                lead.id,
                lead.organization_id,
                lead.name,
                lead.email,
                lead.phone,
                lead.status,
                lead.stage,
                lead.assigned_to,
                serde_json::to_string(&lead.tags)?,
                serde_json::to_string(&lead.custom_fields)?,
                lead.score,
                lead.created_at.to_rfc3339(),
                lead.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_lead(&self, organization_id: &str, id: &str) -> Result<Option<Lead>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM leads WHERE organization_id = ?1 AND id = ?2",
            Self::LEAD_COLUMNS
        );
        let lead = conn
            .query_row(&sql, params![organization_id, id], Self::lead_from_row)
            .optional()?;
        Ok(lead)
    }

    pub async fn get_lead_by_email(
        &self,
        organization_id: &str,
        email: &str,
    ) -> Result<Option<Lead>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM leads WHERE organization_id = ?1 AND email = ?2
             ORDER BY created_at DESC LIMIT 1",
            Self::LEAD_COLUMNS
        );
        let lead = conn
            .query_row(&sql, params![organization_id, email], Self::lead_from_row)
            .optional()?;
        Ok(lead)
    }

    /// Apply a partial update to a lead.
    ///
    /// Only the fields present in `update` are touched; `updated_at` is always
    /// refreshed. The read-then-write sequence around this call is not
    /// transactional: a concurrent writer between a caller's read and this
    /// update wins by last-writer-wins.
    pub async fn update_lead(
        &self,
        organization_id: &str,
        id: &str,
        update: &LeadUpdate,
    ) -> Result<bool> {
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql + Send>> = Vec::new();

        if let Some(status) = &update.status {
            sets.push(format!("status = ?{}", values.len() + 1));
            values.push(Box::new(status.clone()));
        }
        if let Some(stage) = &update.stage {
            sets.push(format!("stage = ?{}", values.len() + 1));
            values.push(Box::new(stage.clone()));
        }
        if let Some(assigned_to) = &update.assigned_to {
            sets.push(format!("assigned_to = ?{}", values.len() + 1));
            values.push(Box::new(assigned_to.clone()));
        }
        if let Some(tags) = &update.tags {
            sets.push(format!("tags = ?{}", values.len() + 1));
            values.push(Box::new(serde_json::to_string(tags)?));
        }
        if let Some(custom_fields) = &update.custom_fields {
            sets.push(format!("custom_fields = ?{}", values.len() + 1));
            values.push(Box::new(serde_json::to_string(custom_fields)?));
        }
        if let Some(score) = update.score {
            sets.push(format!("score = ?{}", values.len() + 1));
            values.push(Box::new(score));
        }

        if sets.is_empty() {
            return Ok(false);
        }

        sets.push(format!("updated_at = ?{}", values.len() + 1));
        values.push(Box::new(chrono::Utc::now().to_rfc3339()));

        let sql = format!(
            "UPDATE leads SET {} WHERE organization_id = ?{} AND id = ?{}",
            sets.join(", "),
            values.len() + 1,
            values.len() + 2,
        );
        values.push(Box::new(organization_id.to_string()));
        values.push(Box::new(id.to_string()));

        let conn = self.conn.lock().await;
        let changed = conn.execute(
            &sql,
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        Ok(changed > 0)
    }

    // =========================================================================
    // Tasks & notifications
    // =========================================================================

    pub async fn create_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tasks (id, organization_id, title, description, assigned_to, due_date,
                                priority, status, workflow_id, execution_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.id,
                task.organization_id,
                task.title,
                task.description,
                task.assigned_to,
                task.due_date,
                task.priority,
                task.status,
                task.workflow_id,
                task.execution_id,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_task(&self, organization_id: &str, id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        let task = conn
            .query_row(
                "SELECT id, organization_id, title, description, assigned_to, due_date,
                        priority, status, workflow_id, execution_id, created_at, updated_at
                 FROM tasks WHERE organization_id = ?1 AND id = ?2",
                params![organization_id, id],
                |row| {
                    Ok(Task {
                        id: row.get(0)?,
                        organization_id: row.get(1)?,
                        title: row.get(2)?,
                        description: row.get(3)?,
                        assigned_to: row.get(4)?,
                        due_date: row.get(5)?,
                        priority: row.get(6)?,
                        status: row.get(7)?,
                        workflow_id: row.get(8)?,
                        execution_id: row.get(9)?,
                        created_at: parse_datetime_utc(&row.get::<_, String>(10)?)?,
                        updated_at: parse_datetime_utc(&row.get::<_, String>(11)?)?,
                    })
                },
            )
            .optional()?;
        Ok(task)
    }

    pub async fn create_notification(&self, notification: &Notification) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO notifications (id, organization_id, user_id, kind, title, body, read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                notification.id,
                notification.organization_id,
                notification.user_id,
                notification.kind,
                notification.title,
                notification.body,
                notification.read as i64,
                notification.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_notifications_for_user(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Vec<Notification>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, user_id, kind, title, body, read, created_at
             FROM notifications WHERE organization_id = ?1 AND user_id = ?2
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![organization_id, user_id], |row| {
            Ok(Notification {
                id: row.get(0)?,
                organization_id: row.get(1)?,
                user_id: row.get(2)?,
                kind: row.get(3)?,
                title: row.get(4)?,
                body: row.get(5)?,
                read: row.get::<_, i64>(6)? != 0,
                created_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // =========================================================================
    // Audit log & lead history
    // =========================================================================

    pub async fn append_audit_log(&self, entry: &AuditLogEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO audit_log (id, organization_id, actor, action, entity_type, entity_id, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.id,
                entry.organization_id,
                entry.actor,
                entry.action,
                entry.entity_type,
                entry.entity_id,
                serde_json::to_string(&entry.details)?,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_audit_log_for_entity(
        &self,
        organization_id: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditLogEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, actor, action, entity_type, entity_id, details, created_at
             FROM audit_log WHERE organization_id = ?1 AND entity_id = ?2
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![organization_id, entity_id], |row| {
            Ok(AuditLogEntry {
                id: row.get(0)?,
                organization_id: row.get(1)?,
                actor: row.get(2)?,
                action: row.get(3)?,
                entity_type: row.get(4)?,
                entity_id: row.get(5)?,
                details: parse_json_column(&row.get::<_, String>(6)?)?,
                created_at: parse_datetime_utc(&row.get::<_, String>(7)?)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn append_lead_history(&self, entry: &LeadHistoryEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO lead_history (id, organization_id, lead_id, changes, execution_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.id,
                entry.organization_id,
                entry.lead_id,
                serde_json::to_string(&entry.changes)?,
                entry.execution_id,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_lead_history(
        &self,
        organization_id: &str,
        lead_id: &str,
    ) -> Result<Vec<LeadHistoryEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, lead_id, changes, execution_id, created_at
             FROM lead_history WHERE organization_id = ?1 AND lead_id = ?2
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![organization_id, lead_id], |row| {
            Ok(LeadHistoryEntry {
                id: row.get(0)?,
                organization_id: row.get(1)?,
                lead_id: row.get(2)?,
                changes: parse_json_column(&row.get::<_, String>(3)?)?,
                execution_id: row.get(4)?,
                created_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // =========================================================================
    // Opportunities
    // =========================================================================

    pub async fn create_opportunity(&self, opp: &Opportunity) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO opportunities (id, organization_id, lead_id, title, stage, value,
                                        probability, expected_close_date, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                opp.id,
                opp.organization_id,
                opp.lead_id,
                opp.title,
                opp.stage,
                opp.value,
                opp.probability,
                opp.expected_close_date,
                opp.notes,
                opp.created_at.to_rfc3339(),
                opp.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_opportunity(
        &self,
        organization_id: &str,
        id: &str,
    ) -> Result<Option<Opportunity>> {
        let conn = self.conn.lock().await;
        let opp = conn
            .query_row(
                "SELECT id, organization_id, lead_id, title, stage, value, probability,
                        expected_close_date, notes, created_at, updated_at
                 FROM opportunities WHERE organization_id = ?1 AND id = ?2",
                params![organization_id, id],
                |row| {
                    Ok(Opportunity {
                        id: row.get(0)?,
                        organization_id: row.get(1)?,
                        lead_id: row.get(2)?,
                        title: row.get(3)?,
                        stage: row.get(4)?,
                        value: row.get(5)?,
                        probability: row.get(6)?,
                        expected_close_date: row.get(7)?,
                        notes: row.get(8)?,
                        created_at: parse_datetime_utc(&row.get::<_, String>(9)?)?,
                        updated_at: parse_datetime_utc(&row.get::<_, String>(10)?)?,
                    })
                },
            )
            .optional()?;
        Ok(opp)
    }

    pub async fn update_opportunity(
        &self,
        organization_id: &str,
        id: &str,
        update: &OpportunityUpdate,
    ) -> Result<bool> {
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql + Send>> = Vec::new();

        if let Some(stage) = &update.stage {
            sets.push(format!("stage = ?{}", values.len() + 1));
            values.push(Box::new(stage.clone()));
        }
        if let Some(value) = update.value {
            sets.push(format!("value = ?{}", values.len() + 1));
            values.push(Box::new(value));
        }
        if let Some(probability) = update.probability {
            sets.push(format!("probability = ?{}", values.len() + 1));
            values.push(Box::new(probability));
        }
        if let Some(date) = &update.expected_close_date {
            sets.push(format!("expected_close_date = ?{}", values.len() + 1));
            values.push(Box::new(date.clone()));
        }
        if let Some(notes) = &update.notes {
            sets.push(format!("notes = ?{}", values.len() + 1));
            values.push(Box::new(notes.clone()));
        }

        if sets.is_empty() {
            return Ok(false);
        }

        sets.push(format!("updated_at = ?{}", values.len() + 1));
        values.push(Box::new(chrono::Utc::now().to_rfc3339()));

        let sql = format!(
            "UPDATE opportunities SET {} WHERE organization_id = ?{} AND id = ?{}",
            sets.join(", "),
            values.len() + 1,
            values.len() + 2,
        );
        values.push(Box::new(organization_id.to_string()));
        values.push(Box::new(id.to_string()));

        let conn = self.conn.lock().await;
        let changed = conn.execute(
            &sql,
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        Ok(changed > 0)
    }

    pub async fn append_stage_transition(&self, transition: &StageTransition) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO stage_transitions (id, organization_id, opportunity_id, from_stage, to_stage, execution_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                transition.id,
                transition.organization_id,
                transition.opportunity_id,
                transition.from_stage,
                transition.to_stage,
                transition.execution_id,
                transition.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn list_stage_transitions(
        &self,
        organization_id: &str,
        opportunity_id: &str,
    ) -> Result<Vec<StageTransition>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, opportunity_id, from_stage, to_stage, execution_id, created_at
             FROM stage_transitions WHERE organization_id = ?1 AND opportunity_id = ?2
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![organization_id, opportunity_id], |row| {
            Ok(StageTransition {
                id: row.get(0)?,
                organization_id: row.get(1)?,
                opportunity_id: row.get(2)?,
                from_stage: row.get(3)?,
                to_stage: row.get(4)?,
                execution_id: row.get(5)?,
                created_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // =========================================================================
    // Automations
    // =========================================================================

    pub async fn create_automation(&self, automation: &Automation) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO automations (id, organization_id, name, enabled, actions, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                automation.id,
                automation.organization_id,
                automation.name,
                automation.enabled as i64,
                serde_json::to_string(&automation.actions)?,
                automation.created_at.to_rfc3339(),
                automation.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn automation_from_row(row: &Row<'_>) -> rusqlite::Result<Automation> {
        Ok(Automation {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            name: row.get(2)?,
            enabled: row.get::<_, i64>(3)? != 0,
            actions: parse_json_column(&row.get::<_, String>(4)?)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
        })
    }

    pub async fn get_automation(
        &self,
        organization_id: &str,
        id: &str,
    ) -> Result<Option<Automation>> {
        let conn = self.conn.lock().await;
        let automation = conn
            .query_row(
                "SELECT id, organization_id, name, enabled, actions, created_at, updated_at
                 FROM automations WHERE organization_id = ?1 AND id = ?2",
                params![organization_id, id],
                Self::automation_from_row,
            )
            .optional()?;
        Ok(automation)
    }

    pub async fn list_automations(&self, organization_id: &str) -> Result<Vec<Automation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, name, enabled, actions, created_at, updated_at
             FROM automations WHERE organization_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![organization_id], Self::automation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub async fn list_enabled_automations(&self, organization_id: &str) -> Result<Vec<Automation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, name, enabled, actions, created_at, updated_at
             FROM automations WHERE organization_id = ?1 AND enabled = 1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![organization_id], Self::automation_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // =========================================================================
    // Health
    // =========================================================================

    pub async fn health_check(&self) -> Result<DatabaseHealth> {
        let conn = self.conn.lock().await;

        let foreign_keys_enabled: i64 =
            conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        let integrity_check: String =
            conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        let organization_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM organizations", [], |row| row.get(0))?;
        let lead_count: i64 = conn.query_row("SELECT COUNT(*) FROM leads", [], |row| row.get(0))?;
        let automation_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM automations", [], |row| row.get(0))?;

        Ok(DatabaseHealth {
            foreign_keys_enabled: foreign_keys_enabled != 0,
            integrity_check,
            organization_count: organization_count as u64,
            lead_count: lead_count as u64,
            automation_count: automation_count as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    async fn storage_with_org() -> SqliteStorage {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .create_organization(&Organization {
                id: "org-1".to_string(),
                name: "Test Gym".to_string(),
                plan_tier: "basic".to_string(),
                webhook_secret: Some("whsec_test".to_string()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        storage
    }

    fn make_lead(id: &str, email: Option<&str>) -> Lead {
        Lead {
            id: id.to_string(),
            organization_id: "org-1".to_string(),
            name: "Ada".to_string(),
            email: email.map(String::from),
            phone: None,
            status: "new".to_string(),
            stage: None,
            assigned_to: None,
            tags: vec!["trial".to_string()],
            custom_fields: json!({"source": "website"}),
            score: Some(10),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_organization_roundtrip() {
        let storage = storage_with_org().await;

        let org = storage.get_organization("org-1").await.unwrap().unwrap();
        assert_eq!(org.name, "Test Gym");
        assert_eq!(org.plan_tier, "basic");
        assert_eq!(org.webhook_secret.as_deref(), Some("whsec_test"));

        assert!(storage.get_organization("org-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lead_roundtrip_and_lookup_by_email() {
        let storage = storage_with_org().await;
        storage
            .create_lead(&make_lead("lead-1", Some("ada@example.com")))
            .await
            .unwrap();

        let lead = storage.get_lead("org-1", "lead-1").await.unwrap().unwrap();
        assert_eq!(lead.tags, vec!["trial"]);
        assert_eq!(lead.custom_fields["source"], "website");

        let by_email = storage
            .get_lead_by_email("org-1", "ada@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_email.id, "lead-1");

        // Lookups are tenant-scoped
        assert!(storage.get_lead("org-2", "lead-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_lead_partial() {
        let storage = storage_with_org().await;
        storage
            .create_lead(&make_lead("lead-1", None))
            .await
            .unwrap();

        let changed = storage
            .update_lead(
                "org-1",
                "lead-1",
                &LeadUpdate {
                    status: Some("qualified".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(changed);

        let lead = storage.get_lead("org-1", "lead-1").await.unwrap().unwrap();
        assert_eq!(lead.status, "qualified");
        // Untouched fields survive
        assert_eq!(lead.tags, vec!["trial"]);
        assert_eq!(lead.score, Some(10));
    }

    #[tokio::test]
    async fn test_update_lead_empty_update_is_noop() {
        let storage = storage_with_org().await;
        storage
            .create_lead(&make_lead("lead-1", None))
            .await
            .unwrap();

        let changed = storage
            .update_lead("org-1", "lead-1", &LeadUpdate::default())
            .await
            .unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn test_task_and_notification() {
        let storage = storage_with_org().await;
        let now = Utc::now();

        storage
            .create_task(&Task {
                id: "task-1".to_string(),
                organization_id: "org-1".to_string(),
                title: "Call Ada".to_string(),
                description: None,
                assigned_to: "user-42".to_string(),
                due_date: None,
                priority: "medium".to_string(),
                status: "pending".to_string(),
                workflow_id: Some("wf-1".to_string()),
                execution_id: Some("exec-1".to_string()),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let task = storage.get_task("org-1", "task-1").await.unwrap().unwrap();
        assert_eq!(task.status, "pending");
        assert_eq!(task.workflow_id.as_deref(), Some("wf-1"));

        storage
            .create_notification(&Notification {
                id: "notif-1".to_string(),
                organization_id: "org-1".to_string(),
                user_id: "user-42".to_string(),
                kind: "task_assigned".to_string(),
                title: "New task: Call Ada".to_string(),
                body: None,
                read: false,
                created_at: now,
            })
            .await
            .unwrap();

        let notifications = storage
            .list_notifications_for_user("org-1", "user-42")
            .await
            .unwrap();
        assert_eq!(notifications.len(), 1);
        assert!(!notifications[0].read);
    }

    #[tokio::test]
    async fn test_opportunity_stage_transition() {
        let storage = storage_with_org().await;
        let now = Utc::now();

        storage
            .create_opportunity(&Opportunity {
                id: "opp-1".to_string(),
                organization_id: "org-1".to_string(),
                lead_id: None,
                title: "Annual membership".to_string(),
                stage: "prospect".to_string(),
                value: Some(500.0),
                probability: Some(0.2),
                expected_close_date: None,
                notes: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        storage
            .update_opportunity(
                "org-1",
                "opp-1",
                &OpportunityUpdate {
                    stage: Some("negotiation".to_string()),
                    probability: Some(0.6),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let opp = storage
            .get_opportunity("org-1", "opp-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opp.stage, "negotiation");
        assert_eq!(opp.probability, Some(0.6));
        assert_eq!(opp.value, Some(500.0));

        storage
            .append_stage_transition(&StageTransition {
                id: "tr-1".to_string(),
                organization_id: "org-1".to_string(),
                opportunity_id: "opp-1".to_string(),
                from_stage: "prospect".to_string(),
                to_stage: "negotiation".to_string(),
                execution_id: Some("exec-1".to_string()),
                created_at: now,
            })
            .await
            .unwrap();

        let transitions = storage
            .list_stage_transitions("org-1", "opp-1")
            .await
            .unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from_stage, "prospect");
    }

    #[tokio::test]
    async fn test_automation_roundtrip() {
        let storage = storage_with_org().await;
        let now = Utc::now();

        storage
            .create_automation(&Automation {
                id: "auto-1".to_string(),
                organization_id: "org-1".to_string(),
                name: "welcome".to_string(),
                enabled: true,
                actions: json!([{"actionType": "create_task", "parameters": {"title": "Hi"}}]),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        storage
            .create_automation(&Automation {
                id: "auto-2".to_string(),
                organization_id: "org-1".to_string(),
                name: "disabled".to_string(),
                enabled: false,
                actions: json!([]),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        assert_eq!(storage.list_automations("org-1").await.unwrap().len(), 2);
        let enabled = storage.list_enabled_automations("org-1").await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "welcome");
    }

    #[tokio::test]
    async fn test_health_check() {
        let storage = storage_with_org().await;
        let health = storage.health_check().await.unwrap();
        assert!(health.foreign_keys_enabled);
        assert_eq!(health.integrity_check, "ok");
        assert_eq!(health.organization_count, 1);
    }
}
