use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use bizflow_shared::{ActionTemplate, Entity, EntityType, NewActionTemplate, TriggerType};

use crate::auth::{AuthUser, Table, TableAction};
use crate::error::ApiResult;
use crate::validation::Validator;
use crate::workflows::actions::merge_config;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct TemplateCreate {
    pub name: String,
    pub description: Option<String>,
    pub action_type: String,
    pub default_config: Option<Value>,
}

pub fn catalog_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/trigger-types", get(list_trigger_types))
        .route("/entity-types", get(list_entity_types))
        .route("/entities", get(list_entities))
        .route("/templates", get(list_templates).post(create_template))
}

// Reference data is readable by any authenticated user.

async fn list_trigger_types(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
) -> Json<Vec<TriggerType>> {
    Json(state.catalog.trigger_types().to_vec())
}

async fn list_entity_types(
    State(state): State<Arc<AppState>>,
    _user: AuthUser,
) -> Json<Vec<EntityType>> {
    Json(state.catalog.entity_types().to_vec())
}

async fn list_entities(State(state): State<Arc<AppState>>, _user: AuthUser) -> Json<Vec<Entity>> {
    Json(state.catalog.entities().to_vec())
}

async fn list_templates(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> ApiResult<Json<Vec<ActionTemplate>>> {
    user.require(&state, Table::ActionTemplates, TableAction::Read)?;
    Ok(Json(state.rules.list_templates().await?))
}

async fn create_template(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<TemplateCreate>,
) -> ApiResult<(StatusCode, Json<ActionTemplate>)> {
    user.require(&state, Table::ActionTemplates, TableAction::Create)?;

    let default_config = payload.default_config.unwrap_or_else(|| json!({}));
    let mut validator = Validator::new()
        .name(&payload.name, "name")
        .json_object(Some(&default_config), "default_config");
    match state.registry.resolve(&payload.action_type) {
        Ok(handler) => {
            // templates may be partial; only check them once merged with the handler defaults
            let merged = merge_config(&handler.default_config(), &default_config);
            validator = validator.check(handler.validate_config(&merged), "default_config");
        }
        Err(_) => {
            validator = validator.error(
                "action_type",
                &format!("Unknown action type '{}'", payload.action_type),
            );
        }
    }
    validator.finish()?;

    let template = state
        .rules
        .create_template(NewActionTemplate {
            name: payload.name.trim().to_string(),
            description: payload.description,
            action_type: payload.action_type,
            default_config,
            created_by: user.user_id,
        })
        .await?;

    tracing::info!(template_id = %template.id, action_type = %template.action_type, "Action template created");
    Ok((StatusCode::CREATED, Json(template)))
}
