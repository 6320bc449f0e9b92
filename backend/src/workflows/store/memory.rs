//! In-process storers, used when no database is configured and by tests.
//!
//! A single lock guards the whole state so that edge checks and inserts are
//! serialized the same way the Postgres store serializes them per rule.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
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
use crate::pagination::window;
use crate::workflows::dag;

pub const ON_CREATE_TRIGGER_ID: Uuid = Uuid::from_u128(0x7a3b8c1e_0001_4000_8000_000000000001);
pub const ON_UPDATE_TRIGGER_ID: Uuid = Uuid::from_u128(0x7a3b8c1e_0001_4000_8000_000000000002);
pub const ON_DELETE_TRIGGER_ID: Uuid = Uuid::from_u128(0x7a3b8c1e_0001_4000_8000_000000000003);

/// Trigger types with the same ids the migration seeds.
pub fn seeded_trigger_types() -> Vec<TriggerType> {
    [
        (ON_CREATE_TRIGGER_ID, "on_create", "Record inserted"),
        (ON_UPDATE_TRIGGER_ID, "on_update", "Record updated"),
        (ON_DELETE_TRIGGER_ID, "on_delete", "Record deleted"),
    ]
    .into_iter()
    .map(|(id, name, description)| TriggerType {
        id,
        name: name.to_string(),
        description: Some(description.to_string()),
    })
    .collect()
}

#[derive(Default)]
struct MemoryState {
    catalog: CatalogSnapshot,
    rules: HashMap<Uuid, AutomationRule>,
    actions: HashMap<Uuid, RuleAction>,
    edges: Vec<ActionEdge>,
    templates: HashMap<Uuid, ActionTemplate>,
    executions: HashMap<Uuid, WorkflowExecution>,
    execution_by_task: HashMap<Uuid, Uuid>,
    permissions: Vec<ActionPermission>,
}

impl MemoryState {
    fn rule_mut(&mut self, id: Uuid) -> StoreResult<&mut AutomationRule> {
        self.rules
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound("Rule".to_string()))
    }

    fn execution_mut(&mut self, id: Uuid) -> StoreResult<&mut WorkflowExecution> {
        self.executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound("Execution".to_string()))
    }

    fn rule_edges(&self, rule_id: Uuid) -> Vec<ActionEdge> {
        self.edges
            .iter()
            .filter(|e| e.rule_id == rule_id)
            .cloned()
            .collect()
    }
}

pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let state = MemoryState {
            catalog: CatalogSnapshot {
                trigger_types: seeded_trigger_types(),
                ..Default::default()
            },
            ..Default::default()
        };
        Self { state: RwLock::new(state) }
    }

    pub async fn add_entity_type(&self, name: &str) -> EntityType {
        let entity_type = EntityType {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
        };
        self.state.write().await.catalog.entity_types.push(entity_type.clone());
        entity_type
    }

    pub async fn add_entity(&self, name: &str, schema_name: &str, entity_type_id: Uuid) -> Entity {
        let entity = Entity {
            id: Uuid::new_v4(),
            name: name.to_string(),
            entity_type_id,
            schema_name: schema_name.to_string(),
        };
        self.state.write().await.catalog.entities.push(entity.clone());
        entity
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn load_catalog(&self) -> StoreResult<CatalogSnapshot> {
        Ok(self.state.read().await.catalog.clone())
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn create_rule(&self, new: NewAutomationRule) -> StoreResult<AutomationRule> {
        let now = Utc::now();
        let rule = AutomationRule {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            entity_id: new.entity_id,
            entity_type_id: new.entity_type_id,
            trigger_type_id: new.trigger_type_id,
            trigger_conditions: new.trigger_conditions,
            canvas_layout: new.canvas_layout,
            is_active: new.is_active,
            created_by: new.created_by,
            updated_by: new.created_by,
            created_at: now,
            updated_at: now,
        };
        self.state.write().await.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn get_rule(&self, id: Uuid) -> StoreResult<AutomationRule> {
        self.state
            .read()
            .await
            .rules
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("Rule".to_string()))
    }

    async fn list_rules(&self, filter: &RuleFilter) -> StoreResult<(Vec<AutomationRule>, i64)> {
        let state = self.state.read().await;
        let mut rules: Vec<AutomationRule> = state
            .rules
            .values()
            .filter(|r| filter.is_active.map_or(true, |a| r.is_active == a))
            .filter(|r| filter.entity_id.map_or(true, |e| r.entity_id == e))
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(window(rules, filter.offset, filter.limit))
    }

    async fn update_rule(
        &self,
        id: Uuid,
        update: UpdateAutomationRule,
        updated_by: Uuid,
    ) -> StoreResult<AutomationRule> {
        let mut state = self.state.write().await;
        let rule = state.rule_mut(id)?;

        if let Some(name) = update.name {
            rule.name = name;
        }
        if let Some(description) = update.description {
            rule.description = Some(description);
        }
        if let Some(entity_id) = update.entity_id {
            rule.entity_id = entity_id;
        }
        if let Some(entity_type_id) = update.entity_type_id {
            rule.entity_type_id = entity_type_id;
        }
        if let Some(trigger_type_id) = update.trigger_type_id {
            rule.trigger_type_id = trigger_type_id;
        }
        if let Some(conditions) = update.trigger_conditions {
            rule.trigger_conditions = Some(conditions);
        }
        if let Some(layout) = update.canvas_layout {
            rule.canvas_layout = Some(layout);
        }
        if let Some(active) = update.is_active {
            rule.is_active = active;
        }
        rule.updated_by = updated_by;
        rule.updated_at = Utc::now();
        Ok(rule.clone())
    }

    async fn set_rule_active(
        &self,
        id: Uuid,
        active: bool,
        updated_by: Uuid,
    ) -> StoreResult<AutomationRule> {
        let mut state = self.state.write().await;
        let rule = state.rule_mut(id)?;
        rule.is_active = active;
        rule.updated_by = updated_by;
        rule.updated_at = Utc::now();
        Ok(rule.clone())
    }

    async fn active_rules_for(
        &self,
        entity_id: Uuid,
        trigger_type_id: Uuid,
    ) -> StoreResult<Vec<AutomationRule>> {
        let state = self.state.read().await;
        let mut rules: Vec<AutomationRule> = state
            .rules
            .values()
            .filter(|r| r.is_active && r.entity_id == entity_id && r.trigger_type_id == trigger_type_id)
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.created_at);
        Ok(rules)
    }

    async fn create_action(&self, new: NewRuleAction) -> StoreResult<RuleAction> {
        let mut state = self.state.write().await;
        if !state.rules.contains_key(&new.automation_rule_id) {
            return Err(StoreError::NotFound("Rule".to_string()));
        }
        let now = Utc::now();
        let action = RuleAction {
            id: Uuid::new_v4(),
            automation_rule_id: new.automation_rule_id,
            name: new.name,
            description: new.description,
            action_type: new.action_type,
            action_config: new.action_config,
            is_active: new.is_active,
            template_id: new.template_id,
            created_at: now,
            updated_at: now,
        };
        state.actions.insert(action.id, action.clone());
        Ok(action)
    }

    async fn get_action(&self, id: Uuid) -> StoreResult<RuleAction> {
        self.state
            .read()
            .await
            .actions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("Action".to_string()))
    }

    async fn list_actions(&self, rule_id: Uuid) -> StoreResult<Vec<RuleAction>> {
        let state = self.state.read().await;
        let mut actions: Vec<RuleAction> = state
            .actions
            .values()
            .filter(|a| a.automation_rule_id == rule_id)
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.created_at);
        Ok(actions)
    }

    async fn update_action(&self, id: Uuid, update: UpdateRuleAction) -> StoreResult<RuleAction> {
        let mut state = self.state.write().await;
        let action = state
            .actions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound("Action".to_string()))?;

        if let Some(name) = update.name {
            action.name = name;
        }
        if let Some(description) = update.description {
            action.description = Some(description);
        }
        if let Some(config) = update.action_config {
            action.action_config = config;
        }
        if let Some(active) = update.is_active {
            action.is_active = active;
        }
        action.updated_at = Utc::now();
        Ok(action.clone())
    }

    async fn delete_action(&self, id: Uuid) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.actions.remove(&id).is_none() {
            return Err(StoreError::NotFound("Action".to_string()));
        }
        state
            .edges
            .retain(|e| e.target_action_id != id && e.source_action_id != Some(id));
        Ok(())
    }

    async fn create_edge(&self, new: NewActionEdge) -> StoreResult<ActionEdge> {
        let mut state = self.state.write().await;
        if !state.rules.contains_key(&new.rule_id) {
            return Err(StoreError::NotFound("Rule".to_string()));
        }

        let existing = state.rule_edges(new.rule_id);
        let source = new.source_action_id.and_then(|id| state.actions.get(&id));
        let target = state.actions.get(&new.target_action_id);
        dag::check_new_edge(&new, source, target, &existing)?;

        let edge = ActionEdge {
            id: Uuid::new_v4(),
            rule_id: new.rule_id,
            source_action_id: new.source_action_id,
            target_action_id: new.target_action_id,
            edge_type: new.edge_type,
            edge_order: new.edge_order,
            created_at: Utc::now(),
        };
        state.edges.push(edge.clone());
        Ok(edge)
    }

    async fn list_edges(&self, rule_id: Uuid) -> StoreResult<Vec<ActionEdge>> {
        let state = self.state.read().await;
        if !state.rules.contains_key(&rule_id) {
            return Err(StoreError::NotFound("Rule".to_string()));
        }
        let mut edges = state.rule_edges(rule_id);
        edges.sort_by_key(|e| (e.edge_order, e.created_at));
        Ok(edges)
    }

    async fn delete_edge(&self, rule_id: Uuid, edge_id: Uuid) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let before = state.edges.len();
        state
            .edges
            .retain(|e| !(e.id == edge_id && e.rule_id == rule_id));
        if state.edges.len() == before {
            return Err(StoreError::NotFound("Edge".to_string()));
        }
        Ok(())
    }

    async fn delete_all_edges(&self, rule_id: Uuid) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        if !state.rules.contains_key(&rule_id) {
            return Err(StoreError::NotFound("Rule".to_string()));
        }
        let before = state.edges.len();
        state.edges.retain(|e| e.rule_id != rule_id);
        Ok((before - state.edges.len()) as u64)
    }

    async fn create_template(&self, new: NewActionTemplate) -> StoreResult<ActionTemplate> {
        let template = ActionTemplate {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            action_type: new.action_type,
            default_config: new.default_config,
            created_by: new.created_by,
            created_at: Utc::now(),
        };
        self.state
            .write()
            .await
            .templates
            .insert(template.id, template.clone());
        Ok(template)
    }

    async fn get_template(&self, id: Uuid) -> StoreResult<ActionTemplate> {
        self.state
            .read()
            .await
            .templates
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("Template".to_string()))
    }

    async fn list_templates(&self) -> StoreResult<Vec<ActionTemplate>> {
        let mut templates: Vec<ActionTemplate> =
            self.state.read().await.templates.values().cloned().collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn begin(&self, draft: WorkflowExecution) -> StoreResult<WorkflowExecution> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .execution_by_task
            .get(&draft.task_id)
            .and_then(|id| state.executions.get(id))
        {
            return Ok(existing.clone());
        }
        state.execution_by_task.insert(draft.task_id, draft.id);
        state.executions.insert(draft.id, draft.clone());
        Ok(draft)
    }

    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let execution = state.execution_mut(id)?;
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(started_at);
        execution.completed_at = None;
        execution.error_message = None;
        Ok(())
    }

    async fn append_log(&self, id: Uuid, entry: ActionLogEntry) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.execution_mut(id)?.action_log.push(entry);
        Ok(())
    }

    async fn finish(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        error_message: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<WorkflowExecution> {
        let mut state = self.state.write().await;
        let execution = state.execution_mut(id)?;
        execution.status = status;
        execution.error_message = error_message;
        execution.completed_at = Some(completed_at);
        Ok(execution.clone())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<WorkflowExecution> {
        self.state
            .read()
            .await
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("Execution".to_string()))
    }

    async fn list_for_rule(
        &self,
        rule_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> StoreResult<(Vec<WorkflowExecution>, i64)> {
        let state = self.state.read().await;
        let mut executions: Vec<WorkflowExecution> = state
            .executions
            .values()
            .filter(|e| e.automation_rule_id == rule_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(window(executions, offset, limit))
    }
}

#[async_trait]
impl ActionPermissionStore for MemoryStore {
    async fn permissions_for_roles(&self, role_ids: &[Uuid]) -> StoreResult<Vec<ActionPermission>> {
        Ok(self
            .state
            .read()
            .await
            .permissions
            .iter()
            .filter(|p| role_ids.contains(&p.role_id))
            .cloned()
            .collect())
    }

    async fn grant(&self, role_id: Uuid, action_type: &str) -> StoreResult<ActionPermission> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .permissions
            .iter_mut()
            .find(|p| p.role_id == role_id && p.action_type == action_type)
        {
            existing.is_allowed = true;
            return Ok(existing.clone());
        }
        let permission = ActionPermission {
            id: Uuid::new_v4(),
            role_id,
            action_type: action_type.to_string(),
            is_allowed: true,
        };
        state.permissions.push(permission.clone());
        Ok(permission)
    }
}
