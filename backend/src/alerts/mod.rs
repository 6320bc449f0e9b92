//! Alert delivery: recipient resolution, status transitions and real-time push.
//!
//! Recipients are stored as written (users and roles). Whether an alert is
//! "mine" is decided at query time against the caller's current roles, so a
//! role change takes effect without rewriting alerts.

mod postgres;
pub mod store;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use bizflow_shared::{Alert, AlertStatus, BulkResult, NewAlert, RecipientRef, RecipientType};

pub use store::{
    AlertChange, AlertQuery, AlertStore, MemoryAlertStore, MemoryRoleDirectory, RoleDirectory,
    Viewer,
};

use crate::websocket::{ConnectionRegistry, WsMessage};
use crate::workflows::store::{StoreError, StoreResult};

/// What a requested status change amounts to for an alert's current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPlan {
    Apply,
    /// Already in the target state; counted as done.
    AlreadyThere,
    Invalid,
}

pub fn plan_transition(current: AlertStatus, target: AlertStatus) -> TransitionPlan {
    use AlertStatus::*;
    match (current, target) {
        (c, t) if c == t => TransitionPlan::AlreadyThere,
        (Active, Acknowledged) | (Active, Dismissed) | (Acknowledged, Dismissed) => {
            TransitionPlan::Apply
        }
        _ => TransitionPlan::Invalid,
    }
}

fn sources_for(target: AlertStatus) -> &'static [AlertStatus] {
    match target {
        AlertStatus::Acknowledged => &[AlertStatus::Active],
        AlertStatus::Dismissed => &[AlertStatus::Active, AlertStatus::Acknowledged],
        AlertStatus::Active => &[],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Changed,
    Unchanged,
    Rejected,
}

pub struct AlertService {
    store: Arc<dyn AlertStore>,
    roles: Arc<dyn RoleDirectory>,
    connections: Arc<ConnectionRegistry>,
}

impl AlertService {
    pub fn new(
        store: Arc<dyn AlertStore>,
        roles: Arc<dyn RoleDirectory>,
        connections: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            store,
            roles,
            connections,
        }
    }

    /// Builds the viewer for `user_id` from the role directory, merged with
    /// any roles the caller's token already carries.
    pub async fn viewer(&self, user_id: Uuid, token_roles: &[Uuid]) -> StoreResult<Viewer> {
        let mut role_ids = self.roles.roles_for_user(user_id).await?;
        for role in token_roles {
            if !role_ids.contains(role) {
                role_ids.push(*role);
            }
        }
        Ok(Viewer { user_id, role_ids })
    }

    /// Expands user and role recipients to distinct user ids.
    pub async fn resolve_users(&self, recipients: &[RecipientRef]) -> StoreResult<Vec<Uuid>> {
        let mut seen = HashSet::new();
        let mut users = Vec::new();
        for recipient in recipients {
            let members = match recipient.recipient_type {
                RecipientType::User => vec![recipient.id],
                RecipientType::Role => self.roles.users_in_role(recipient.id).await?,
            };
            users.extend(members.into_iter().filter(|u| seen.insert(*u)));
        }
        Ok(users)
    }

    /// Stores the alert and pushes it to every open connection of its
    /// resolved recipients. A repeated `source_key` returns the stored alert
    /// without pushing again.
    pub async fn create(&self, new: NewAlert) -> StoreResult<Alert> {
        let recipients = new.recipients.clone();
        let (alert, created) = self.store.insert(new).await?;
        if !created {
            tracing::debug!(alert_id = %alert.id, "Alert already exists for source key");
            return Ok(alert);
        }

        let users = self.resolve_users(&recipients).await?;
        let message = WsMessage::new("alert", serde_json::to_value(&alert)?);
        let delivered = self.connections.send_to_users(&users, &message);
        tracing::info!(
            alert_id = %alert.id,
            severity = %alert.severity,
            recipients = users.len(),
            delivered,
            "Alert created"
        );
        Ok(alert)
    }

    /// Returns the alert when `viewer` is one of its resolved recipients.
    pub async fn get(&self, viewer: &Viewer, id: Uuid) -> StoreResult<Alert> {
        if !self.store.is_visible_to(id, viewer).await? {
            return Err(StoreError::NotFound("Alert".to_string()));
        }
        self.store.get(id).await
    }

    pub async fn mine(&self, viewer: &Viewer, query: &AlertQuery) -> StoreResult<(Vec<Alert>, i64)> {
        self.store.list_for(viewer, query).await
    }

    pub async fn acknowledge_selected(
        &self,
        viewer: &Viewer,
        ids: &[Uuid],
        notes: Option<String>,
    ) -> StoreResult<BulkResult> {
        self.transition_selected(viewer, ids, AlertStatus::Acknowledged, notes)
            .await
    }

    pub async fn dismiss_selected(
        &self,
        viewer: &Viewer,
        ids: &[Uuid],
        notes: Option<String>,
    ) -> StoreResult<BulkResult> {
        self.transition_selected(viewer, ids, AlertStatus::Dismissed, notes)
            .await
    }

    pub async fn acknowledge_all(&self, viewer: &Viewer, notes: Option<String>) -> StoreResult<BulkResult> {
        self.transition_all(viewer, AlertStatus::Acknowledged, notes).await
    }

    pub async fn dismiss_all(&self, viewer: &Viewer, notes: Option<String>) -> StoreResult<BulkResult> {
        self.transition_all(viewer, AlertStatus::Dismissed, notes).await
    }

    async fn transition_selected(
        &self,
        viewer: &Viewer,
        ids: &[Uuid],
        target: AlertStatus,
        notes: Option<String>,
    ) -> StoreResult<BulkResult> {
        let mut seen = HashSet::new();
        let mut result = BulkResult::default();
        let mut changed = Vec::new();

        for id in ids.iter().copied().filter(|id| seen.insert(*id)) {
            if !self.store.is_visible_to(id, viewer).await? {
                result.skipped += 1;
                continue;
            }
            self.tally(id, viewer.user_id, target, &notes, &mut result, &mut changed)
                .await?;
        }

        self.announce(viewer.user_id, target, &changed);
        Ok(result)
    }

    async fn transition_all(
        &self,
        viewer: &Viewer,
        target: AlertStatus,
        notes: Option<String>,
    ) -> StoreResult<BulkResult> {
        let ids = self.store.ids_for(viewer, sources_for(target)).await?;
        let mut result = BulkResult::default();
        let mut changed = Vec::new();

        for id in ids {
            self.tally(id, viewer.user_id, target, &notes, &mut result, &mut changed)
                .await?;
        }

        self.announce(viewer.user_id, target, &changed);
        Ok(result)
    }

    async fn tally(
        &self,
        id: Uuid,
        actor: Uuid,
        target: AlertStatus,
        notes: &Option<String>,
        result: &mut BulkResult,
        changed: &mut Vec<Uuid>,
    ) -> StoreResult<()> {
        match self.apply(id, actor, target, notes).await? {
            Outcome::Changed => {
                result.count += 1;
                changed.push(id);
            }
            Outcome::Unchanged => result.count += 1,
            Outcome::Rejected => result.skipped += 1,
        }
        Ok(())
    }

    async fn apply(
        &self,
        id: Uuid,
        actor: Uuid,
        target: AlertStatus,
        notes: &Option<String>,
    ) -> StoreResult<Outcome> {
        let alert = self.store.get(id).await?;
        match plan_transition(alert.status, target) {
            TransitionPlan::AlreadyThere => return Ok(Outcome::Unchanged),
            TransitionPlan::Invalid => return Ok(Outcome::Rejected),
            TransitionPlan::Apply => {}
        }

        let change = AlertChange {
            to: target,
            actor,
            at: Utc::now(),
            notes: notes.clone(),
        };
        if self.store.transition(id, sources_for(target), &change).await? {
            return Ok(Outcome::Changed);
        }

        // Lost a race with another writer; settle on whatever it left behind.
        let current = self.store.get(id).await?;
        Ok(match plan_transition(current.status, target) {
            TransitionPlan::AlreadyThere => Outcome::Unchanged,
            _ => Outcome::Rejected,
        })
    }

    fn announce(&self, user_id: Uuid, status: AlertStatus, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }
        let message = WsMessage::new(
            "alert_updated",
            serde_json::json!({ "ids": ids, "status": status }),
        );
        self.connections.send_to_users(&[user_id], &message);
    }
}
