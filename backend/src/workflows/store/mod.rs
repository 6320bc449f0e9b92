//! Storer interfaces for the workflow graph, executions, and reference data.
//!
//! Each storer is narrow on purpose: the engine and cascade analyzer are
//! the only readers of the rule/action/edge graph.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use bizflow_shared::{
    ActionEdge, ActionLogEntry, ActionPermission, ActionTemplate, AutomationRule, Entity,
    EntityType, ExecutionStatus, NewActionEdge, NewActionTemplate, NewAutomationRule,
    NewRuleAction, RuleAction, TriggerType, UpdateAutomationRule, UpdateRuleAction,
    WorkflowExecution,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid graph shape: {0}")]
    InvalidShape(String),
    /// A referenced row exists but is owned by a different rule.
    #[error("{0}")]
    WrongRule(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("Resource".to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // foreign_key_violation / unique_violation
                Some("23503") | Some("23505") => Self::Conflict(db.message().to_string()),
                _ => Self::Database(err.to_string()),
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Database(format!("malformed stored json: {}", err))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub is_active: Option<bool>,
    pub entity_id: Option<Uuid>,
    pub offset: i64,
    pub limit: i64,
}

/// Everything the reference catalog is built from.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub trigger_types: Vec<TriggerType>,
    pub entity_types: Vec<EntityType>,
    pub entities: Vec<Entity>,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load_catalog(&self) -> StoreResult<CatalogSnapshot>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn create_rule(&self, new: NewAutomationRule) -> StoreResult<AutomationRule>;
    async fn get_rule(&self, id: Uuid) -> StoreResult<AutomationRule>;
    async fn list_rules(&self, filter: &RuleFilter) -> StoreResult<(Vec<AutomationRule>, i64)>;
    async fn update_rule(
        &self,
        id: Uuid,
        update: UpdateAutomationRule,
        updated_by: Uuid,
    ) -> StoreResult<AutomationRule>;
    /// Activation is a state flip; rules are never deleted.
    async fn set_rule_active(&self, id: Uuid, active: bool, updated_by: Uuid)
        -> StoreResult<AutomationRule>;
    /// Active rules bound to `entity_id` + `trigger_type_id`, oldest first.
    async fn active_rules_for(
        &self,
        entity_id: Uuid,
        trigger_type_id: Uuid,
    ) -> StoreResult<Vec<AutomationRule>>;

    async fn create_action(&self, new: NewRuleAction) -> StoreResult<RuleAction>;
    async fn get_action(&self, id: Uuid) -> StoreResult<RuleAction>;
    async fn list_actions(&self, rule_id: Uuid) -> StoreResult<Vec<RuleAction>>;
    async fn update_action(&self, id: Uuid, update: UpdateRuleAction) -> StoreResult<RuleAction>;
    /// Removes the action together with every edge touching it.
    async fn delete_action(&self, id: Uuid) -> StoreResult<()>;

    /// Inserts an edge after checking the DAG shape under the rule's write lock.
    async fn create_edge(&self, new: NewActionEdge) -> StoreResult<ActionEdge>;
    async fn list_edges(&self, rule_id: Uuid) -> StoreResult<Vec<ActionEdge>>;
    async fn delete_edge(&self, rule_id: Uuid, edge_id: Uuid) -> StoreResult<()>;
    async fn delete_all_edges(&self, rule_id: Uuid) -> StoreResult<u64>;

    async fn create_template(&self, new: NewActionTemplate) -> StoreResult<ActionTemplate>;
    async fn get_template(&self, id: Uuid) -> StoreResult<ActionTemplate>;
    async fn list_templates(&self) -> StoreResult<Vec<ActionTemplate>>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Inserts `draft` unless an execution for the same task id exists, in
    /// which case the stored one is returned untouched.
    async fn begin(&self, draft: WorkflowExecution) -> StoreResult<WorkflowExecution>;
    /// Moves an execution to `running`. A partial log from an interrupted
    /// attempt is kept so completed actions are not repeated.
    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> StoreResult<()>;
    async fn append_log(&self, id: Uuid, entry: ActionLogEntry) -> StoreResult<()>;
    async fn finish(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error_message: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<WorkflowExecution>;
    async fn get_execution(&self, id: Uuid) -> StoreResult<WorkflowExecution>;
    async fn list_for_rule(
        &self,
        rule_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> StoreResult<(Vec<WorkflowExecution>, i64)>;
}

#[async_trait]
pub trait ActionPermissionStore: Send + Sync {
    async fn permissions_for_roles(&self, role_ids: &[Uuid]) -> StoreResult<Vec<ActionPermission>>;
    async fn grant(&self, role_id: Uuid, action_type: &str) -> StoreResult<ActionPermission>;
}
