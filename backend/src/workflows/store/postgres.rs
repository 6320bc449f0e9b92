//! Postgres-backed storers.
//!
//! Queries are built at runtime so the crate builds without a live database.
//! Edge creation runs in a transaction holding the owning rule's row lock,
//! which serializes concurrent edits to the same rule.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, FromRow, PgPool};
use uuid::Uuid;

use bizflow_shared::{
    ActionEdge, ActionLogEntry, ActionPermission, ActionTemplate, AutomationRule, Entity,
    EntityType, ExecutionStatus, NewActionEdge, NewActionTemplate, NewAutomationRule,
    NewRuleAction, RuleAction, TriggerType, UpdateAutomationRule, UpdateRuleAction,
    WorkflowExecution,
};

use super::{
    ActionPermissionStore, CatalogSnapshot, CatalogStore, ExecutionStore, RuleFilter, RuleStore,
    StoreError, StoreResult,
};
use crate::workflows::dag;

const RULE_COLUMNS: &str = "id, name, description, entity_id, entity_type_id, trigger_type_id, \
     trigger_conditions, canvas_layout, is_active, created_by, updated_by, created_at, updated_at";

const ACTION_COLUMNS: &str = "id, automation_rule_id, name, description, action_type, \
     action_config, is_active, template_id, created_at, updated_at";

const EDGE_COLUMNS: &str =
    "id, rule_id, source_action_id, target_action_id, edge_type, edge_order, created_at";

const EXECUTION_COLUMNS: &str = "id, task_id, automation_rule_id, event_id, trigger_event, \
     status, action_log, error_message, started_at, completed_at, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(FromRow)]
struct ExecutionRow {
    id: Uuid,
    task_id: Uuid,
    automation_rule_id: Uuid,
    event_id: Uuid,
    trigger_event: serde_json::Value,
    status: ExecutionStatus,
    action_log: Json<Vec<ActionLogEntry>>,
    error_message: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<ExecutionRow> for WorkflowExecution {
    fn from(row: ExecutionRow) -> Self {
        Self {
            id: row.id,
            task_id: row.task_id,
            automation_rule_id: row.automation_rule_id,
            event_id: row.event_id,
            trigger_event: row.trigger_event,
            status: row.status,
            action_log: row.action_log.0,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
        }
    }
}

fn not_found(what: &str) -> impl FnOnce() -> StoreError + '_ {
    move || StoreError::NotFound(what.to_string())
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn load_catalog(&self) -> StoreResult<CatalogSnapshot> {
        let trigger_types = sqlx::query_as::<_, TriggerType>(
            "SELECT id, name, description FROM workflow.trigger_types ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        let entity_types = sqlx::query_as::<_, EntityType>(
            "SELECT id, name, description FROM workflow.entity_types ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        let entities = sqlx::query_as::<_, Entity>(
            "SELECT id, name, entity_type_id, schema_name FROM workflow.entities ORDER BY schema_name, name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(CatalogSnapshot {
            trigger_types,
            entity_types,
            entities,
        })
    }
}

#[async_trait]
impl RuleStore for PgStore {
    async fn create_rule(&self, new: NewAutomationRule) -> StoreResult<AutomationRule> {
        let sql = format!(
            "INSERT INTO workflow.automation_rules \
             (id, name, description, entity_id, entity_type_id, trigger_type_id, \
              trigger_conditions, canvas_layout, is_active, created_by, updated_by) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10) \
             RETURNING {RULE_COLUMNS}"
        );
        let rule = sqlx::query_as::<_, AutomationRule>(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.name)
            .bind(&new.description)
            .bind(new.entity_id)
            .bind(new.entity_type_id)
            .bind(new.trigger_type_id)
            .bind(&new.trigger_conditions)
            .bind(&new.canvas_layout)
            .bind(new.is_active)
            .bind(new.created_by)
            .fetch_one(&self.pool)
            .await?;
        Ok(rule)
    }

    async fn get_rule(&self, id: Uuid) -> StoreResult<AutomationRule> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM workflow.automation_rules WHERE id = $1");
        sqlx::query_as::<_, AutomationRule>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(not_found("Rule"))
    }

    async fn list_rules(&self, filter: &RuleFilter) -> StoreResult<(Vec<AutomationRule>, i64)> {
        let predicate = "($1::boolean IS NULL OR is_active = $1) AND ($2::uuid IS NULL OR entity_id = $2)";

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM workflow.automation_rules WHERE {predicate}"
        ))
        .bind(filter.is_active)
        .bind(filter.entity_id)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM workflow.automation_rules WHERE {predicate} \
             ORDER BY created_at DESC LIMIT $3 OFFSET $4"
        );
        let rules = sqlx::query_as::<_, AutomationRule>(&sql)
            .bind(filter.is_active)
            .bind(filter.entity_id)
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;

        Ok((rules, total))
    }

    async fn update_rule(
        &self,
        id: Uuid,
        update: UpdateAutomationRule,
        updated_by: Uuid,
    ) -> StoreResult<AutomationRule> {
        let sql = format!(
            "UPDATE workflow.automation_rules SET \
                name = COALESCE($2, name), \
                description = COALESCE($3, description), \
                entity_id = COALESCE($4, entity_id), \
                entity_type_id = COALESCE($5, entity_type_id), \
                trigger_type_id = COALESCE($6, trigger_type_id), \
                trigger_conditions = COALESCE($7, trigger_conditions), \
                canvas_layout = COALESCE($8, canvas_layout), \
                is_active = COALESCE($9, is_active), \
                updated_by = $10, \
                updated_at = NOW() \
             WHERE id = $1 RETURNING {RULE_COLUMNS}"
        );
        sqlx::query_as::<_, AutomationRule>(&sql)
            .bind(id)
            .bind(update.name)
            .bind(update.description)
            .bind(update.entity_id)
            .bind(update.entity_type_id)
            .bind(update.trigger_type_id)
            .bind(update.trigger_conditions)
            .bind(update.canvas_layout)
            .bind(update.is_active)
            .bind(updated_by)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(not_found("Rule"))
    }

    async fn set_rule_active(
        &self,
        id: Uuid,
        active: bool,
        updated_by: Uuid,
    ) -> StoreResult<AutomationRule> {
        let sql = format!(
            "UPDATE workflow.automation_rules SET is_active = $2, updated_by = $3, updated_at = NOW() \
             WHERE id = $1 RETURNING {RULE_COLUMNS}"
        );
        sqlx::query_as::<_, AutomationRule>(&sql)
            .bind(id)
            .bind(active)
            .bind(updated_by)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(not_found("Rule"))
    }

    async fn active_rules_for(
        &self,
        entity_id: Uuid,
        trigger_type_id: Uuid,
    ) -> StoreResult<Vec<AutomationRule>> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM workflow.automation_rules \
             WHERE is_active AND entity_id = $1 AND trigger_type_id = $2 \
             ORDER BY created_at"
        );
        Ok(sqlx::query_as::<_, AutomationRule>(&sql)
            .bind(entity_id)
            .bind(trigger_type_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn create_action(&self, new: NewRuleAction) -> StoreResult<RuleAction> {
        let sql = format!(
            "INSERT INTO workflow.rule_actions \
             (id, automation_rule_id, name, description, action_type, action_config, is_active, template_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {ACTION_COLUMNS}"
        );
        let result = sqlx::query_as::<_, RuleAction>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.automation_rule_id)
            .bind(&new.name)
            .bind(&new.description)
            .bind(&new.action_type)
            .bind(&new.action_config)
            .bind(new.is_active)
            .bind(new.template_id)
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(action) => Ok(action),
            // rule_actions.automation_rule_id FK
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23503") => {
                Err(StoreError::NotFound("Rule".to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_action(&self, id: Uuid) -> StoreResult<RuleAction> {
        let sql = format!("SELECT {ACTION_COLUMNS} FROM workflow.rule_actions WHERE id = $1");
        sqlx::query_as::<_, RuleAction>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(not_found("Action"))
    }

    async fn list_actions(&self, rule_id: Uuid) -> StoreResult<Vec<RuleAction>> {
        let sql = format!(
            "SELECT {ACTION_COLUMNS} FROM workflow.rule_actions \
             WHERE automation_rule_id = $1 ORDER BY created_at"
        );
        Ok(sqlx::query_as::<_, RuleAction>(&sql)
            .bind(rule_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn update_action(&self, id: Uuid, update: UpdateRuleAction) -> StoreResult<RuleAction> {
        let sql = format!(
            "UPDATE workflow.rule_actions SET \
                name = COALESCE($2, name), \
                description = COALESCE($3, description), \
                action_config = COALESCE($4, action_config), \
                is_active = COALESCE($5, is_active), \
                updated_at = NOW() \
             WHERE id = $1 RETURNING {ACTION_COLUMNS}"
        );
        sqlx::query_as::<_, RuleAction>(&sql)
            .bind(id)
            .bind(update.name)
            .bind(update.description)
            .bind(update.action_config)
            .bind(update.is_active)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(not_found("Action"))
    }

    async fn delete_action(&self, id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let rule_id: Option<Uuid> =
            sqlx::query_scalar("SELECT automation_rule_id FROM workflow.rule_actions WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let rule_id = rule_id.ok_or_else(not_found("Action"))?;

        sqlx::query("SELECT id FROM workflow.automation_rules WHERE id = $1 FOR UPDATE")
            .bind(rule_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM workflow.action_edges WHERE source_action_id = $1 OR target_action_id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM workflow.rule_actions WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn create_edge(&self, new: NewActionEdge) -> StoreResult<ActionEdge> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT id FROM workflow.automation_rules WHERE id = $1 FOR UPDATE")
            .bind(new.rule_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(not_found("Rule"))?;

        let existing = sqlx::query_as::<_, ActionEdge>(&format!(
            "SELECT {EDGE_COLUMNS} FROM workflow.action_edges WHERE rule_id = $1"
        ))
        .bind(new.rule_id)
        .fetch_all(&mut *tx)
        .await?;

        let action_sql = format!("SELECT {ACTION_COLUMNS} FROM workflow.rule_actions WHERE id = $1");
        let source = match new.source_action_id {
            Some(id) => {
                sqlx::query_as::<_, RuleAction>(&action_sql)
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            None => None,
        };
        let target = sqlx::query_as::<_, RuleAction>(&action_sql)
            .bind(new.target_action_id)
            .fetch_optional(&mut *tx)
            .await?;

        dag::check_new_edge(&new, source.as_ref(), target.as_ref(), &existing)?;

        let edge = sqlx::query_as::<_, ActionEdge>(&format!(
            "INSERT INTO workflow.action_edges \
             (id, rule_id, source_action_id, target_action_id, edge_type, edge_order) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {EDGE_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(new.rule_id)
        .bind(new.source_action_id)
        .bind(new.target_action_id)
        .bind(new.edge_type)
        .bind(new.edge_order)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(edge)
    }

    async fn list_edges(&self, rule_id: Uuid) -> StoreResult<Vec<ActionEdge>> {
        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM workflow.automation_rules WHERE id = $1")
                .bind(rule_id)
                .fetch_optional(&self.pool)
                .await?;
        exists.ok_or_else(not_found("Rule"))?;

        Ok(sqlx::query_as::<_, ActionEdge>(&format!(
            "SELECT {EDGE_COLUMNS} FROM workflow.action_edges WHERE rule_id = $1 \
             ORDER BY edge_order, created_at"
        ))
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn delete_edge(&self, rule_id: Uuid, edge_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM workflow.action_edges WHERE id = $1 AND rule_id = $2")
            .bind(edge_id)
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("Edge".to_string()));
        }
        Ok(())
    }

    async fn delete_all_edges(&self, rule_id: Uuid) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT id FROM workflow.automation_rules WHERE id = $1 FOR UPDATE")
            .bind(rule_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(not_found("Rule"))?;
        let result = sqlx::query("DELETE FROM workflow.action_edges WHERE rule_id = $1")
            .bind(rule_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn create_template(&self, new: NewActionTemplate) -> StoreResult<ActionTemplate> {
        Ok(sqlx::query_as::<_, ActionTemplate>(
            "INSERT INTO workflow.action_templates \
             (id, name, description, action_type, default_config, created_by) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING id, name, description, action_type, default_config, created_by, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.action_type)
        .bind(&new.default_config)
        .bind(new.created_by)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_template(&self, id: Uuid) -> StoreResult<ActionTemplate> {
        sqlx::query_as::<_, ActionTemplate>(
            "SELECT id, name, description, action_type, default_config, created_by, created_at \
             FROM workflow.action_templates WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(not_found("Template"))
    }

    async fn list_templates(&self) -> StoreResult<Vec<ActionTemplate>> {
        Ok(sqlx::query_as::<_, ActionTemplate>(
            "SELECT id, name, description, action_type, default_config, created_by, created_at \
             FROM workflow.action_templates ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn begin(&self, draft: WorkflowExecution) -> StoreResult<WorkflowExecution> {
        let inserted = sqlx::query_as::<_, ExecutionRow>(&format!(
            "INSERT INTO workflow.executions \
             (id, task_id, automation_rule_id, event_id, trigger_event, status, action_log, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (task_id) DO NOTHING \
             RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(draft.id)
        .bind(draft.task_id)
        .bind(draft.automation_rule_id)
        .bind(draft.event_id)
        .bind(&draft.trigger_event)
        .bind(draft.status)
        .bind(Json(&draft.action_log))
        .bind(draft.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(row.into());
        }

        let existing = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow.executions WHERE task_id = $1"
        ))
        .bind(draft.task_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(existing.into())
    }

    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE workflow.executions SET status = 'running', started_at = $2, \
             completed_at = NULL, error_message = NULL \
             WHERE id = $1",
        )
        .bind(id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("Execution".to_string()));
        }
        Ok(())
    }

    async fn append_log(&self, id: Uuid, entry: ActionLogEntry) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE workflow.executions SET action_log = action_log || jsonb_build_array($2::jsonb) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(Json(&entry))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("Execution".to_string()));
        }
        Ok(())
    }

    async fn finish(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error_message: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<WorkflowExecution> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            "UPDATE workflow.executions SET status = $2, error_message = $3, completed_at = $4 \
             WHERE id = $1 RETURNING {EXECUTION_COLUMNS}"
        ))
        .bind(id)
        .bind(status)
        .bind(error_message)
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(not_found("Execution"))?;
        Ok(row.into())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<WorkflowExecution> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow.executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(not_found("Execution"))?;
        Ok(row.into())
    }

    async fn list_for_rule(
        &self,
        rule_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> StoreResult<(Vec<WorkflowExecution>, i64)> {
        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM workflow.executions WHERE automation_rule_id = $1")
                .bind(rule_id)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow.executions WHERE automation_rule_id = $1 \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        ))
        .bind(rule_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((rows.into_iter().map(Into::into).collect(), total))
    }
}

#[async_trait]
impl ActionPermissionStore for PgStore {
    async fn permissions_for_roles(&self, role_ids: &[Uuid]) -> StoreResult<Vec<ActionPermission>> {
        Ok(sqlx::query_as::<_, ActionPermission>(
            "SELECT id, role_id, action_type, is_allowed FROM workflow.action_permissions \
             WHERE role_id = ANY($1)",
        )
        .bind(role_ids)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn grant(&self, role_id: Uuid, action_type: &str) -> StoreResult<ActionPermission> {
        Ok(sqlx::query_as::<_, ActionPermission>(
            "INSERT INTO workflow.action_permissions (id, role_id, action_type, is_allowed) \
             VALUES ($1, $2, $3, TRUE) \
             ON CONFLICT (role_id, action_type) DO UPDATE SET is_allowed = TRUE \
             RETURNING id, role_id, action_type, is_allowed",
        )
        .bind(Uuid::new_v4())
        .bind(role_id)
        .bind(action_type)
        .fetch_one(&self.pool)
        .await?)
    }
}
