use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use bizflow_shared::{Alert, AlertSeverity, AlertStatus, BulkResult};

use crate::alerts::{AlertQuery, Viewer};
use crate::auth::{AuthUser, Table, TableAction};
use crate::error::{ApiResult, AppError};
use crate::pagination::{PaginatedResponse, PaginationParams};
use crate::websocket::websocket_handler;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct MineQuery {
    /// Comma-separated, defaults to `active`.
    pub status: Option<String>,
    /// Comma-separated; any severity when absent.
    pub severity: Option<String>,
    pub alert_type: Option<String>,
    pub page: Option<i64>,
    pub rows: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NotesBody {
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SelectedBody {
    pub ids: Vec<Uuid>,
    pub notes: Option<String>,
}

pub fn alert_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/mine", get(my_alerts))
        .route("/ws", get(websocket_handler))
        .route("/acknowledge-selected", post(acknowledge_selected))
        .route("/dismiss-selected", post(dismiss_selected))
        .route("/acknowledge-all", post(acknowledge_all))
        .route("/dismiss-all", post(dismiss_all))
        .route("/:id", get(get_alert))
        .route("/:id/acknowledge", post(acknowledge_one))
        .route("/:id/dismiss", post(dismiss_one))
}

fn parse_list<T: FromStr>(raw: Option<&str>, field: &str) -> ApiResult<Vec<T>>
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| T::from_str(s).map_err(|e| AppError::validation_single(field, e.to_string())))
        .collect()
}

async fn viewer_for(state: &AppState, user: &AuthUser) -> ApiResult<Viewer> {
    Ok(state.alerts.viewer(user.user_id, &user.role_ids).await?)
}

async fn my_alerts(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(query): Query<MineQuery>,
) -> ApiResult<Json<PaginatedResponse<Alert>>> {
    user.require(&state, Table::Alerts, TableAction::Read)?;

    let mut statuses: Vec<AlertStatus> = parse_list(query.status.as_deref(), "status")?;
    if statuses.is_empty() {
        statuses.push(AlertStatus::Active);
    }
    let severities: Vec<AlertSeverity> = parse_list(query.severity.as_deref(), "severity")?;

    let page = PaginationParams::new(query.page, query.rows);
    let viewer = viewer_for(&state, &user).await?;
    let alert_query = AlertQuery {
        statuses,
        severities,
        alert_type: query.alert_type.filter(|t| !t.is_empty()),
        now: chrono::Utc::now(),
        offset: page.offset(),
        limit: page.limit(),
    };

    let (alerts, total) = state.alerts.mine(&viewer, &alert_query).await?;
    Ok(Json(PaginatedResponse::new(alerts, &page, total)))
}

async fn get_alert(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Alert>> {
    user.require(&state, Table::Alerts, TableAction::Read)?;
    let viewer = viewer_for(&state, &user).await?;
    Ok(Json(state.alerts.get(&viewer, id).await?))
}

async fn acknowledge_one(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    body: Option<Json<NotesBody>>,
) -> ApiResult<Json<BulkResult>> {
    user.require(&state, Table::Alerts, TableAction::Update)?;
    let viewer = viewer_for(&state, &user).await?;
    let notes = body.and_then(|Json(b)| b.notes);
    Ok(Json(state.alerts.acknowledge_selected(&viewer, &[id], notes).await?))
}

async fn dismiss_one(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    body: Option<Json<NotesBody>>,
) -> ApiResult<Json<BulkResult>> {
    user.require(&state, Table::Alerts, TableAction::Update)?;
    let viewer = viewer_for(&state, &user).await?;
    let notes = body.and_then(|Json(b)| b.notes);
    Ok(Json(state.alerts.dismiss_selected(&viewer, &[id], notes).await?))
}

async fn acknowledge_selected(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(body): Json<SelectedBody>,
) -> ApiResult<Json<BulkResult>> {
    user.require(&state, Table::Alerts, TableAction::Update)?;
    let viewer = viewer_for(&state, &user).await?;
    let result = state
        .alerts
        .acknowledge_selected(&viewer, &body.ids, body.notes)
        .await?;
    tracing::info!(user_id = %user.user_id, count = result.count, skipped = result.skipped, "Alerts acknowledged");
    Ok(Json(result))
}

async fn dismiss_selected(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(body): Json<SelectedBody>,
) -> ApiResult<Json<BulkResult>> {
    user.require(&state, Table::Alerts, TableAction::Update)?;
    let viewer = viewer_for(&state, &user).await?;
    let result = state
        .alerts
        .dismiss_selected(&viewer, &body.ids, body.notes)
        .await?;
    tracing::info!(user_id = %user.user_id, count = result.count, skipped = result.skipped, "Alerts dismissed");
    Ok(Json(result))
}

async fn acknowledge_all(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    body: Option<Json<NotesBody>>,
) -> ApiResult<Json<BulkResult>> {
    user.require(&state, Table::Alerts, TableAction::Update)?;
    let viewer = viewer_for(&state, &user).await?;
    let notes = body.and_then(|Json(b)| b.notes);
    Ok(Json(state.alerts.acknowledge_all(&viewer, notes).await?))
}

async fn dismiss_all(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    body: Option<Json<NotesBody>>,
) -> ApiResult<Json<BulkResult>> {
    user.require(&state, Table::Alerts, TableAction::Update)?;
    let viewer = viewer_for(&state, &user).await?;
    let notes = body.and_then(|Json(b)| b.notes);
    Ok(Json(state.alerts.dismiss_all(&viewer, notes).await?))
}
