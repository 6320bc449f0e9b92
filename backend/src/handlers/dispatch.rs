use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use bizflow_shared::{FieldChange, TriggerKind};

use crate::auth::{AuthUser, Table, TableAction};
use crate::error::{ApiResult, AppError, ACTION_DENIED};
use crate::workflows::actions::{render_config, ActionContext, ActionTypeInfo};
use crate::workflows::triggers::ChangeEvent;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub config: Value,
    /// Data exposed to `{{field}}` placeholders and to the handler.
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// An entity change reported by the surrounding backend. The entity is
/// named either by id or by its logical name.
#[derive(Debug, Deserialize)]
pub struct EventSubmit {
    pub entity_id: Option<Uuid>,
    pub entity: Option<String>,
    pub trigger: TriggerKind,
    pub record_id: Option<Uuid>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub field_changes: HashMap<String, FieldChange>,
}

#[derive(Debug, Serialize)]
pub struct EventAccepted {
    pub event_id: Uuid,
    pub task_ids: Vec<Uuid>,
}

pub fn dispatch_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/actions", get(list_permitted_actions))
        .route("/actions/:action_type/execute", post(execute_action))
        .route("/events", post(submit_event))
}

/// Action types the caller's roles are allowed to run.
async fn permitted_types(state: &AppState, user: &AuthUser) -> ApiResult<HashSet<String>> {
    if user.role_ids.is_empty() {
        return Ok(HashSet::new());
    }
    let rows = state.action_permissions.permissions_for_roles(&user.role_ids).await?;
    Ok(rows
        .into_iter()
        .filter(|p| p.is_allowed)
        .map(|p| p.action_type)
        .collect())
}

async fn list_permitted_actions(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> ApiResult<Json<Vec<ActionTypeInfo>>> {
    let permitted = permitted_types(&state, &user).await?;
    let types = state
        .registry
        .types()
        .into_iter()
        .filter(|info| permitted.contains(&info.action_type))
        .collect();
    Ok(Json(types))
}

async fn execute_action(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(action_type): Path<String>,
    payload: Option<Json<ExecuteRequest>>,
) -> ApiResult<Json<ExecuteResponse>> {
    // permission first, so unknown and unpermitted types are indistinguishable
    if !permitted_types(&state, &user).await?.contains(&action_type) {
        tracing::warn!(user_id = %user.user_id, %action_type, "Action execution denied");
        return Err(AppError::PermissionDenied(ACTION_DENIED.to_string()));
    }
    let handler = state.registry.resolve(&action_type)?;

    let request = payload.map(|Json(r)| r).unwrap_or_default();
    let event = ChangeEvent::manual(user.user_id, request.payload);
    let config = if request.config.is_null() {
        handler.default_config()
    } else {
        render_config(&request.config, &event)
    };
    handler.validate_config(&config)?;

    let upstream = HashMap::new();
    let ctx = ActionContext {
        event: &event,
        rule_id: None,
        action_id: None,
        execution_id: None,
        upstream: &upstream,
        user_id: Some(user.user_id),
    };

    let started = Instant::now();
    let timeout = state.config.simulation_timeout;
    let result = tokio::time::timeout(timeout, handler.execute(&ctx, &config)).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let response = match result {
        Ok(Ok(output)) => ExecuteResponse {
            success: true,
            output: Some(output),
            error: None,
            duration_ms,
        },
        Ok(Err(e)) => ExecuteResponse {
            success: false,
            output: None,
            error: Some(e.to_string()),
            duration_ms,
        },
        Err(_) => {
            return Err(AppError::Aborted(format!(
                "timed out after {}s",
                timeout.as_secs()
            )))
        }
    };

    tracing::info!(
        user_id = %user.user_id,
        %action_type,
        success = response.success,
        duration_ms,
        "Ad hoc action executed"
    );
    Ok(Json(response))
}

async fn submit_event(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<EventSubmit>,
) -> ApiResult<(StatusCode, Json<EventAccepted>)> {
    user.require(&state, Table::Executions, TableAction::Create)?;

    let entity = match (payload.entity_id, payload.entity.as_deref()) {
        (Some(id), _) => state.catalog.entity(id),
        (None, Some(name)) => state.catalog.entity_by_name(name),
        (None, None) => {
            return Err(AppError::validation_single("entity_id", "entity_id or entity is required"))
        }
    }
    .ok_or_else(|| AppError::validation_single("entity_id", "Unknown entity"))?;

    let mut event = ChangeEvent::new(entity, payload.trigger, payload.record_id, payload.payload);
    event.field_changes = payload.field_changes;
    event.user_id = Some(user.user_id);

    let task_ids = state.queue.enqueue_event(&event).await?;
    tracing::info!(
        event_id = %event.event_id,
        entity = %entity.name,
        trigger = %event.trigger,
        tasks = task_ids.len(),
        "Entity change event accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(EventAccepted {
            event_id: event.event_id,
            task_ids,
        }),
    ))
}
