use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;

use crate::error::ApiResult;
use crate::AppState;

pub mod alerts;
pub mod catalog;
pub mod dispatch;
pub mod graph;
pub mod rules;

/// Everything served under `/workflow`.
pub fn workflow_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(rules::rule_routes())
        .merge(graph::graph_routes())
        .merge(catalog::catalog_routes())
        .merge(dispatch::dispatch_routes())
        .nest("/alerts", alerts::alert_routes())
}

pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let database = match &state.db_pool {
        Some(pool) => Some(crate::database::health_check(pool).await),
        None => None,
    };
    let queue = state.queue.stats().await?;

    Ok(Json(json!({
        "status": if database.unwrap_or(true) { "healthy" } else { "degraded" },
        "database": database,
        "queue": queue,
        "connections": state.connections.connection_count(),
        "timestamp": chrono::Utc::now(),
    })))
}
