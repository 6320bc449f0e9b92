//! Alert persistence and role membership lookups.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use bizflow_shared::{Alert, AlertRecipient, AlertSeverity, AlertStatus, NewAlert, RecipientType};

use crate::pagination::window;
use crate::workflows::store::{StoreError, StoreResult};

/// The caller an alert query is evaluated for: a user plus the roles the
/// user currently holds.
#[derive(Debug, Clone)]
pub struct Viewer {
    pub user_id: Uuid,
    pub role_ids: Vec<Uuid>,
}

impl Viewer {
    pub fn matches(&self, recipient: &AlertRecipient) -> bool {
        match recipient.recipient_type {
            RecipientType::User => recipient.recipient_id == self.user_id,
            RecipientType::Role => self.role_ids.contains(&recipient.recipient_id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlertQuery {
    pub statuses: Vec<AlertStatus>,
    /// Empty means any severity.
    pub severities: Vec<AlertSeverity>,
    pub alert_type: Option<String>,
    /// Alerts that expired before this instant are hidden.
    pub now: DateTime<Utc>,
    pub offset: i64,
    pub limit: i64,
}

/// A status change and who made it.
#[derive(Debug, Clone)]
pub struct AlertChange {
    pub to: AlertStatus,
    pub actor: Uuid,
    pub at: DateTime<Utc>,
    pub notes: Option<String>,
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Inserts an alert with its recipients. When `source_key` is already
    /// taken the existing alert is returned and the flag is `false`.
    async fn insert(&self, new: NewAlert) -> StoreResult<(Alert, bool)>;
    async fn get(&self, id: Uuid) -> StoreResult<Alert>;
    async fn recipients(&self, alert_id: Uuid) -> StoreResult<Vec<AlertRecipient>>;
    async fn is_visible_to(&self, alert_id: Uuid, viewer: &Viewer) -> StoreResult<bool>;
    /// Alerts visible to `viewer`, highest severity first, then newest.
    async fn list_for(&self, viewer: &Viewer, query: &AlertQuery) -> StoreResult<(Vec<Alert>, i64)>;
    async fn ids_for(&self, viewer: &Viewer, statuses: &[AlertStatus]) -> StoreResult<Vec<Uuid>>;
    /// Applies `change` only when the alert is currently in one of `from`.
    async fn transition(&self, id: Uuid, from: &[AlertStatus], change: &AlertChange) -> StoreResult<bool>;
}

#[async_trait]
pub trait RoleDirectory: Send + Sync {
    async fn roles_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Uuid>>;
    async fn users_in_role(&self, role_id: Uuid) -> StoreResult<Vec<Uuid>>;
}

fn apply_change(alert: &mut Alert, change: &AlertChange) {
    alert.status = change.to;
    match change.to {
        AlertStatus::Acknowledged => {
            alert.acknowledged_by = Some(change.actor);
            alert.acknowledged_at = Some(change.at);
        }
        AlertStatus::Dismissed => {
            alert.dismissed_by = Some(change.actor);
            alert.dismissed_at = Some(change.at);
        }
        AlertStatus::Active => {}
    }
    if change.notes.is_some() {
        alert.notes = change.notes.clone();
    }
    alert.updated_at = change.at;
}

#[derive(Default)]
struct AlertState {
    alerts: HashMap<Uuid, Alert>,
    recipients: HashMap<Uuid, Vec<AlertRecipient>>,
    by_source_key: HashMap<String, Uuid>,
}

impl AlertState {
    fn visible(&self, alert_id: &Uuid, viewer: &Viewer) -> bool {
        self.recipients
            .get(alert_id)
            .is_some_and(|rs| rs.iter().any(|r| viewer.matches(r)))
    }
}

#[derive(Default)]
pub struct MemoryAlertStore {
    state: RwLock<AlertState>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn insert(&self, new: NewAlert) -> StoreResult<(Alert, bool)> {
        let mut state = self.state.write().await;
        if let Some(existing) = new
            .source_key
            .as_ref()
            .and_then(|key| state.by_source_key.get(key))
            .and_then(|id| state.alerts.get(id))
        {
            return Ok((existing.clone(), false));
        }

        let now = Utc::now();
        let alert = Alert {
            id: Uuid::new_v4(),
            alert_type: new.alert_type,
            severity: new.severity,
            title: new.title,
            message: new.message,
            context: new.context,
            source_entity_name: new.source_entity_name,
            source_entity_id: new.source_entity_id,
            source_rule_id: new.source_rule_id,
            source_key: new.source_key,
            status: AlertStatus::Active,
            expires_at: new.expires_at,
            acknowledged_by: None,
            acknowledged_at: None,
            dismissed_by: None,
            dismissed_at: None,
            notes: None,
            created_at: now,
            updated_at: now,
        };

        let mut seen = HashSet::new();
        let recipients: Vec<AlertRecipient> = new
            .recipients
            .iter()
            .filter(|r| seen.insert(**r))
            .map(|r| AlertRecipient {
                id: Uuid::new_v4(),
                alert_id: alert.id,
                recipient_type: r.recipient_type,
                recipient_id: r.id,
                created_at: now,
            })
            .collect();

        if let Some(key) = &alert.source_key {
            state.by_source_key.insert(key.clone(), alert.id);
        }
        state.recipients.insert(alert.id, recipients);
        state.alerts.insert(alert.id, alert.clone());
        Ok((alert, true))
    }

    async fn get(&self, id: Uuid) -> StoreResult<Alert> {
        self.state
            .read()
            .await
            .alerts
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("Alert".to_string()))
    }

    async fn recipients(&self, alert_id: Uuid) -> StoreResult<Vec<AlertRecipient>> {
        Ok(self
            .state
            .read()
            .await
            .recipients
            .get(&alert_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_visible_to(&self, alert_id: Uuid, viewer: &Viewer) -> StoreResult<bool> {
        Ok(self.state.read().await.visible(&alert_id, viewer))
    }

    async fn list_for(&self, viewer: &Viewer, query: &AlertQuery) -> StoreResult<(Vec<Alert>, i64)> {
        let state = self.state.read().await;
        let mut alerts: Vec<Alert> = state
            .alerts
            .values()
            .filter(|a| state.visible(&a.id, viewer))
            .filter(|a| query.statuses.contains(&a.status))
            .filter(|a| query.severities.is_empty() || query.severities.contains(&a.severity))
            .filter(|a| query.alert_type.as_ref().map_or(true, |t| &a.alert_type == t))
            .filter(|a| a.expires_at.map_or(true, |exp| exp > query.now))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        Ok(window(alerts, query.offset, query.limit))
    }

    async fn ids_for(&self, viewer: &Viewer, statuses: &[AlertStatus]) -> StoreResult<Vec<Uuid>> {
        let state = self.state.read().await;
        Ok(state
            .alerts
            .values()
            .filter(|a| statuses.contains(&a.status) && state.visible(&a.id, viewer))
            .map(|a| a.id)
            .collect())
    }

    async fn transition(&self, id: Uuid, from: &[AlertStatus], change: &AlertChange) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let alert = state
            .alerts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound("Alert".to_string()))?;
        if !from.contains(&alert.status) {
            return Ok(false);
        }
        apply_change(alert, change);
        Ok(true)
    }
}

/// Role membership held in memory; `assign` is how tests and local runs populate it.
#[derive(Default)]
pub struct MemoryRoleDirectory {
    memberships: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl MemoryRoleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn assign(&self, user_id: Uuid, role_id: Uuid) {
        self.memberships
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(role_id);
    }
}

#[async_trait]
impl RoleDirectory for MemoryRoleDirectory {
    async fn roles_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Uuid>> {
        Ok(self
            .memberships
            .read()
            .await
            .get(&user_id)
            .map(|roles| roles.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn users_in_role(&self, role_id: Uuid) -> StoreResult<Vec<Uuid>> {
        Ok(self
            .memberships
            .read()
            .await
            .iter()
            .filter(|(_, roles)| roles.contains(&role_id))
            .map(|(user, _)| *user)
            .collect())
    }
}
