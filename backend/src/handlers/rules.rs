use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, patch, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use bizflow_shared::{
    ActionLogEntry, AutomationRule, EntityChangeEvent, ExecutionStatus, FieldChange,
    NewAutomationRule, TriggerKind, UpdateAutomationRule, WorkflowExecution,
};

use crate::auth::{AuthUser, Table, TableAction};
use crate::error::{ApiResult, AppError};
use crate::pagination::{PaginatedResponse, PaginationParams};
use crate::validation::Validator;
use crate::workflows::cascade::CascadeImpact;
use crate::workflows::catalog::ReferenceCatalog;
use crate::workflows::conditions::TriggerConditions;
use crate::workflows::dag::GraphReport;
use crate::workflows::store::RuleFilter;
use crate::workflows::triggers::MatchOutcome;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RuleCreate {
    pub name: String,
    pub description: Option<String>,
    pub entity_id: Uuid,
    pub entity_type_id: Uuid,
    pub trigger_type_id: Uuid,
    pub trigger_conditions: Option<Value>,
    pub canvas_layout: Option<Value>,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
pub struct RuleListQuery {
    pub page: Option<i64>,
    pub rows: Option<i64>,
    pub is_active: Option<bool>,
    pub entity_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ActiveToggle {
    pub is_active: bool,
}

/// A rule together with the rules its writes would set off.
#[derive(Debug, Serialize)]
pub struct RuleWithCascade {
    pub rule: AutomationRule,
    pub cascade: Vec<CascadeImpact>,
}

/// Sample data for a dry run; binding fields default to the rule's own.
#[derive(Debug, Default, Deserialize)]
pub struct RuleTestRequest {
    #[serde(default)]
    pub payload: Value,
    pub trigger: Option<TriggerKind>,
    pub record_id: Option<Uuid>,
    #[serde(default)]
    pub field_changes: HashMap<String, FieldChange>,
}

#[derive(Debug, Serialize)]
pub struct RuleTestResponse {
    pub matched: bool,
    pub outcome: MatchOutcome,
    pub status: ExecutionStatus,
    pub action_log: Vec<ActionLogEntry>,
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(flatten)]
    pub report: GraphReport,
}

pub fn rule_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rules", get(list_rules).post(create_rule))
        .route("/rules/:id", get(get_rule).put(update_rule).delete(deactivate_rule))
        .route("/rules/:id/active", patch(set_active))
        .route("/rules/:id/cascade", get(rule_cascade))
        .route("/rules/:id/validate", post(validate_rule))
        .route("/rules/:id/test", post(test_rule))
        .route("/rules/:id/executions", get(list_executions))
        .route("/executions/:id", get(get_execution))
}

/// Checks the rule's binding against the catalog and its conditions document.
fn check_binding(
    catalog: &ReferenceCatalog,
    entity_id: Uuid,
    entity_type_id: Uuid,
    trigger_type_id: Uuid,
    conditions: Option<&Value>,
    validator: Validator,
) -> Validator {
    let entity = catalog.entity(entity_id);
    let validator = validator
        .error_if(entity.is_none(), "entity_id", "Unknown entity")
        .error_if(!catalog.has_entity_type(entity_type_id), "entity_type_id", "Unknown entity type")
        .error_if(
            entity.is_some_and(|e| e.entity_type_id != entity_type_id),
            "entity_type_id",
            "Entity type does not match the entity",
        )
        .error_if(!catalog.has_trigger_type(trigger_type_id), "trigger_type_id", "Unknown trigger type");

    match conditions {
        Some(raw) => validator.check(TriggerConditions::parse(raw).map(|_| ()), "trigger_conditions"),
        None => validator,
    }
}

async fn list_rules(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<RuleListQuery>,
) -> ApiResult<Json<PaginatedResponse<AutomationRule>>> {
    user.require(&state, Table::AutomationRules, TableAction::Read)?;

    let page = PaginationParams::new(query.page, query.rows);
    let filter = RuleFilter {
        is_active: query.is_active,
        entity_id: query.entity_id,
        offset: page.offset(),
        limit: page.limit(),
    };
    let (rules, total) = state.rules.list_rules(&filter).await?;
    Ok(Json(PaginatedResponse::new(rules, &page, total)))
}

async fn create_rule(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<RuleCreate>,
) -> ApiResult<(StatusCode, Json<AutomationRule>)> {
    user.require(&state, Table::AutomationRules, TableAction::Create)?;

    let validator = Validator::new()
        .name(&payload.name, "name")
        .json_object(payload.canvas_layout.as_ref(), "canvas_layout");
    check_binding(
        &state.catalog,
        payload.entity_id,
        payload.entity_type_id,
        payload.trigger_type_id,
        payload.trigger_conditions.as_ref(),
        validator,
    )
    .finish()?;

    let rule = state
        .rules
        .create_rule(NewAutomationRule {
            name: payload.name.trim().to_string(),
            description: payload.description,
            entity_id: payload.entity_id,
            entity_type_id: payload.entity_type_id,
            trigger_type_id: payload.trigger_type_id,
            trigger_conditions: payload.trigger_conditions,
            canvas_layout: payload.canvas_layout,
            is_active: payload.is_active,
            created_by: user.user_id,
        })
        .await?;

    tracing::info!(rule_id = %rule.id, user_id = %user.user_id, "Automation rule created");
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<AutomationRule>> {
    user.require(&state, Table::AutomationRules, TableAction::Read)?;
    Ok(Json(state.rules.get_rule(id).await?))
}

async fn update_rule(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAutomationRule>,
) -> ApiResult<Json<AutomationRule>> {
    user.require(&state, Table::AutomationRules, TableAction::Update)?;

    let current = state.rules.get_rule(id).await?;
    let validator = Validator::new()
        .optional_name(&payload.name, "name")
        .json_object(payload.canvas_layout.as_ref(), "canvas_layout");
    check_binding(
        &state.catalog,
        payload.entity_id.unwrap_or(current.entity_id),
        payload.entity_type_id.unwrap_or(current.entity_type_id),
        payload.trigger_type_id.unwrap_or(current.trigger_type_id),
        payload.trigger_conditions.as_ref(),
        validator,
    )
    .finish()?;

    let rule = state.rules.update_rule(id, payload, user.user_id).await?;
    tracing::info!(rule_id = %rule.id, user_id = %user.user_id, "Automation rule updated");
    Ok(Json(rule))
}

/// Rules are never removed; DELETE deactivates.
async fn deactivate_rule(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    user.require(&state, Table::AutomationRules, TableAction::Delete)?;
    state.rules.set_rule_active(id, false, user.user_id).await?;
    tracing::info!(rule_id = %id, user_id = %user.user_id, "Automation rule deactivated");
    Ok(StatusCode::NO_CONTENT)
}

async fn set_active(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ActiveToggle>,
) -> ApiResult<Json<RuleWithCascade>> {
    user.require(&state, Table::AutomationRules, TableAction::Update)?;

    let rule = state.rules.set_rule_active(id, payload.is_active, user.user_id).await?;
    let cascade = if rule.is_active {
        state.cascade.analyze(&rule).await?
    } else {
        Vec::new()
    };
    tracing::info!(
        rule_id = %rule.id,
        is_active = rule.is_active,
        cascades = cascade.len(),
        "Automation rule activation changed"
    );
    Ok(Json(RuleWithCascade { rule, cascade }))
}

async fn rule_cascade(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<CascadeImpact>>> {
    user.require(&state, Table::AutomationRules, TableAction::Read)?;
    let rule = state.rules.get_rule(id).await?;
    Ok(Json(state.cascade.analyze(&rule).await?))
}

async fn validate_rule(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ValidationReport>> {
    user.require(&state, Table::AutomationRules, TableAction::Read)?;
    state.rules.get_rule(id).await?;

    let report = state.engine.validate(id).await?;
    Ok(Json(ValidationReport {
        valid: report.is_valid(),
        report,
    }))
}

async fn test_rule(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    payload: Option<Json<RuleTestRequest>>,
) -> ApiResult<Json<RuleTestResponse>> {
    user.require(&state, Table::AutomationRules, TableAction::Read)?;

    let rule = state.rules.get_rule(id).await?;
    let sample = payload.map(|Json(p)| p).unwrap_or_default();
    let trigger = sample
        .trigger
        .or_else(|| state.catalog.trigger_kind(rule.trigger_type_id))
        .ok_or_else(|| AppError::invalid("rule is bound to an unknown trigger type"))?;

    let event = EntityChangeEvent {
        event_id: Uuid::new_v4(),
        entity_id: rule.entity_id,
        entity_type_id: rule.entity_type_id,
        trigger,
        record_id: sample.record_id,
        payload: sample.payload,
        field_changes: sample.field_changes,
        user_id: Some(user.user_id),
        occurred_at: chrono::Utc::now(),
    };

    let outcome = state.evaluator.explain(&rule, &event);
    let run = state.engine.simulate(&rule, &event).await?;
    tracing::debug!(rule_id = %rule.id, matched = outcome.is_match(), status = %run.status, "Rule simulated");

    Ok(Json(RuleTestResponse {
        matched: outcome.is_match(),
        outcome,
        status: run.status,
        action_log: run.action_log,
        error_message: run.error_message,
    }))
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Query(page): Query<PaginationParams>,
) -> ApiResult<Json<PaginatedResponse<WorkflowExecution>>> {
    user.require(&state, Table::Executions, TableAction::Read)?;
    state.rules.get_rule(id).await?;

    let (executions, total) = state
        .executions
        .list_for_rule(id, page.offset(), page.limit())
        .await?;
    Ok(Json(PaginatedResponse::new(executions, &page, total)))
}

async fn get_execution(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowExecution>> {
    user.require(&state, Table::Executions, TableAction::Read)?;
    Ok(Json(state.executions.get_execution(id).await?))
}
