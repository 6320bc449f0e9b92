use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use bizflow_shared::{
    ActionEdge, EdgeType, NewActionEdge, NewRuleAction, RuleAction, UpdateRuleAction,
};

use crate::auth::{AuthUser, Table, TableAction};
use crate::error::{ApiResult, AppError};
use crate::validation::Validator;
use crate::workflows::actions::merge_config;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ActionCreate {
    pub name: String,
    pub description: Option<String>,
    /// Optional when a template supplies it.
    pub action_type: Option<String>,
    pub action_config: Option<Value>,
    pub template_id: Option<Uuid>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct EdgeCreate {
    pub source_action_id: Option<Uuid>,
    pub target_action_id: Uuid,
    pub edge_type: EdgeType,
    #[serde(default)]
    pub edge_order: i32,
}

pub fn graph_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rules/:id/actions", get(list_actions).post(create_action))
        .route(
            "/rules/:id/actions/:action_id",
            put(update_action).delete(delete_action),
        )
        .route(
            "/rules/:id/edges",
            get(list_edges).post(create_edge).delete(delete_all_edges),
        )
        .route("/rules/:id/edges/:edge_id", delete(delete_edge))
}

/// Unknown types are a validation problem at authoring time; only dispatch
/// hides them behind the permission error.
fn check_action_config(state: &AppState, action_type: &str, config: &Value) -> ApiResult<()> {
    let handler = state.registry.resolve(action_type).map_err(|_| {
        AppError::validation_single("action_type", format!("Unknown action type '{}'", action_type))
    })?;
    Validator::new()
        .json_object(Some(config), "action_config")
        .check(handler.validate_config(config), "action_config")
        .finish()
}

/// The action, provided it belongs to `rule_id`.
async fn owned_action(state: &AppState, rule_id: Uuid, action_id: Uuid) -> ApiResult<RuleAction> {
    let action = state.rules.get_action(action_id).await?;
    if action.automation_rule_id != rule_id {
        return Err(AppError::Aborted(format!(
            "action {} belongs to a different rule",
            action_id
        )));
    }
    Ok(action)
}

async fn list_actions(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(rule_id): Path<Uuid>,
) -> ApiResult<Json<Vec<RuleAction>>> {
    user.require(&state, Table::RuleActions, TableAction::Read)?;
    state.rules.get_rule(rule_id).await?;
    Ok(Json(state.rules.list_actions(rule_id).await?))
}

async fn create_action(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(rule_id): Path<Uuid>,
    Json(payload): Json<ActionCreate>,
) -> ApiResult<(StatusCode, Json<RuleAction>)> {
    user.require(&state, Table::RuleActions, TableAction::Create)?;
    state.rules.get_rule(rule_id).await?;
    Validator::new().name(&payload.name, "name").finish()?;

    let config = payload.action_config.unwrap_or_else(|| json!({}));
    let (action_type, action_config) = match payload.template_id {
        Some(template_id) => {
            let template = state.rules.get_template(template_id).await?;
            if let Some(requested) = payload.action_type.as_deref() {
                if requested != template.action_type {
                    return Err(AppError::validation_single(
                        "action_type",
                        "Action type does not match the template",
                    ));
                }
            }
            let merged = merge_config(&template.default_config, &config);
            (template.action_type, merged)
        }
        None => {
            let action_type = payload
                .action_type
                .ok_or_else(|| AppError::validation_single("action_type", "action_type is required"))?;
            (action_type, config)
        }
    };
    check_action_config(&state, &action_type, &action_config)?;

    let action = state
        .rules
        .create_action(NewRuleAction {
            automation_rule_id: rule_id,
            name: payload.name.trim().to_string(),
            description: payload.description,
            action_type,
            action_config,
            is_active: payload.is_active,
            template_id: payload.template_id,
        })
        .await?;

    tracing::info!(
        rule_id = %rule_id,
        action_id = %action.id,
        action_type = %action.action_type,
        "Rule action created"
    );
    Ok((StatusCode::CREATED, Json(action)))
}

async fn update_action(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((rule_id, action_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateRuleAction>,
) -> ApiResult<Json<RuleAction>> {
    user.require(&state, Table::RuleActions, TableAction::Update)?;
    let current = owned_action(&state, rule_id, action_id).await?;

    Validator::new().optional_name(&payload.name, "name").finish()?;
    if let Some(config) = &payload.action_config {
        check_action_config(&state, &current.action_type, config)?;
    }

    let action = state.rules.update_action(action_id, payload).await?;
    tracing::info!(rule_id = %rule_id, action_id = %action_id, "Rule action updated");
    Ok(Json(action))
}

async fn delete_action(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((rule_id, action_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    user.require(&state, Table::RuleActions, TableAction::Delete)?;
    owned_action(&state, rule_id, action_id).await?;

    state.rules.delete_action(action_id).await?;
    tracing::info!(rule_id = %rule_id, action_id = %action_id, "Rule action deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn list_edges(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(rule_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ActionEdge>>> {
    user.require(&state, Table::ActionEdges, TableAction::Read)?;
    state.rules.get_rule(rule_id).await?;
    Ok(Json(state.rules.list_edges(rule_id).await?))
}

async fn create_edge(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(rule_id): Path<Uuid>,
    Json(payload): Json<EdgeCreate>,
) -> ApiResult<(StatusCode, Json<ActionEdge>)> {
    user.require(&state, Table::ActionEdges, TableAction::Create)?;
    state.rules.get_rule(rule_id).await?;

    let edge = state
        .rules
        .create_edge(NewActionEdge {
            rule_id,
            source_action_id: payload.source_action_id,
            target_action_id: payload.target_action_id,
            edge_type: payload.edge_type,
            edge_order: payload.edge_order,
        })
        .await?;

    tracing::info!(
        rule_id = %rule_id,
        edge_id = %edge.id,
        edge_type = %edge.edge_type,
        "Action edge created"
    );
    Ok((StatusCode::CREATED, Json(edge)))
}

async fn delete_edge(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path((rule_id, edge_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<StatusCode> {
    user.require(&state, Table::ActionEdges, TableAction::Delete)?;
    state.rules.delete_edge(rule_id, edge_id).await?;
    tracing::info!(rule_id = %rule_id, edge_id = %edge_id, "Action edge deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_all_edges(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(rule_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    user.require(&state, Table::ActionEdges, TableAction::Delete)?;
    state.rules.get_rule(rule_id).await?;

    let deleted = state.rules.delete_all_edges(rule_id).await?;
    tracing::info!(rule_id = %rule_id, deleted, "Action edges cleared");
    Ok(Json(json!({ "deleted": deleted })))
}
