use async_trait::async_trait;
use uuid::Uuid;

use bizflow_shared::{Alert, AlertRecipient, AlertStatus, NewAlert};

use super::store::{AlertChange, AlertQuery, AlertStore, RoleDirectory, Viewer};
use crate::workflows::store::{PgStore, StoreError, StoreResult};

const ALERT_COLUMNS: &str = "a.id, a.alert_type, a.severity, a.title, a.message, a.context, \
     a.source_entity_name, a.source_entity_id, a.source_rule_id, a.source_key, a.status, \
     a.expires_at, a.acknowledged_by, a.acknowledged_at, a.dismissed_by, a.dismissed_at, \
     a.notes, a.created_at, a.updated_at";

// $1 = user id, $2 = role ids
const VISIBLE_TO: &str = "EXISTS (SELECT 1 FROM workflow.alert_recipients r \
     WHERE r.alert_id = a.id AND ((r.recipient_type = 'user' AND r.recipient_id = $1) \
     OR (r.recipient_type = 'role' AND r.recipient_id = ANY($2))))";

fn status_tags(statuses: &[AlertStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait]
impl AlertStore for PgStore {
    async fn insert(&self, new: NewAlert) -> StoreResult<(Alert, bool)> {
        let mut tx = self.pool().begin().await?;

        let inserted = sqlx::query_as::<_, Alert>(&format!(
            "INSERT INTO workflow.alerts AS a \
             (id, alert_type, severity, title, message, context, source_entity_name, \
              source_entity_id, source_rule_id, source_key, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (source_key) DO NOTHING \
             RETURNING {ALERT_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(&new.alert_type)
        .bind(new.severity)
        .bind(&new.title)
        .bind(&new.message)
        .bind(&new.context)
        .bind(&new.source_entity_name)
        .bind(new.source_entity_id)
        .bind(new.source_rule_id)
        .bind(&new.source_key)
        .bind(new.expires_at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(alert) = inserted else {
            tx.rollback().await?;
            let existing = sqlx::query_as::<_, Alert>(&format!(
                "SELECT {ALERT_COLUMNS} FROM workflow.alerts a WHERE a.source_key = $1"
            ))
            .bind(&new.source_key)
            .fetch_one(self.pool())
            .await?;
            return Ok((existing, false));
        };

        for recipient in &new.recipients {
            sqlx::query(
                "INSERT INTO workflow.alert_recipients (id, alert_id, recipient_type, recipient_id) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (alert_id, recipient_type, recipient_id) DO NOTHING",
            )
            .bind(Uuid::new_v4())
            .bind(alert.id)
            .bind(recipient.recipient_type)
            .bind(recipient.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok((alert, true))
    }

    async fn get(&self, id: Uuid) -> StoreResult<Alert> {
        sqlx::query_as::<_, Alert>(&format!(
            "SELECT {ALERT_COLUMNS} FROM workflow.alerts a WHERE a.id = $1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| StoreError::NotFound("Alert".to_string()))
    }

    async fn recipients(&self, alert_id: Uuid) -> StoreResult<Vec<AlertRecipient>> {
        Ok(sqlx::query_as::<_, AlertRecipient>(
            "SELECT id, alert_id, recipient_type, recipient_id, created_at \
             FROM workflow.alert_recipients WHERE alert_id = $1",
        )
        .bind(alert_id)
        .fetch_all(self.pool())
        .await?)
    }

    async fn is_visible_to(&self, alert_id: Uuid, viewer: &Viewer) -> StoreResult<bool> {
        Ok(sqlx::query_scalar::<_, bool>(&format!(
            "SELECT EXISTS (SELECT 1 FROM workflow.alerts a WHERE a.id = $3 AND {VISIBLE_TO})"
        ))
        .bind(viewer.user_id)
        .bind(&viewer.role_ids)
        .bind(alert_id)
        .fetch_one(self.pool())
        .await?)
    }

    async fn list_for(&self, viewer: &Viewer, query: &AlertQuery) -> StoreResult<(Vec<Alert>, i64)> {
        let severities: Vec<String> = query.severities.iter().map(|s| s.as_str().to_string()).collect();
        let filter = format!(
            "{VISIBLE_TO} AND a.status::text = ANY($3) \
             AND (cardinality($4::text[]) = 0 OR a.severity::text = ANY($4)) \
             AND ($5::text IS NULL OR a.alert_type = $5) \
             AND (a.expires_at IS NULL OR a.expires_at > $6)"
        );

        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM workflow.alerts a WHERE {filter}"
        ))
        .bind(viewer.user_id)
        .bind(&viewer.role_ids)
        .bind(status_tags(&query.statuses))
        .bind(&severities)
        .bind(&query.alert_type)
        .bind(query.now)
        .fetch_one(self.pool())
        .await?;

        let alerts = sqlx::query_as::<_, Alert>(&format!(
            "SELECT {ALERT_COLUMNS} FROM workflow.alerts a WHERE {filter} \
             ORDER BY a.severity DESC, a.created_at DESC LIMIT $7 OFFSET $8"
        ))
        .bind(viewer.user_id)
        .bind(&viewer.role_ids)
        .bind(status_tags(&query.statuses))
        .bind(&severities)
        .bind(&query.alert_type)
        .bind(query.now)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(self.pool())
        .await?;

        Ok((alerts, total))
    }

    async fn ids_for(&self, viewer: &Viewer, statuses: &[AlertStatus]) -> StoreResult<Vec<Uuid>> {
        Ok(sqlx::query_scalar::<_, Uuid>(&format!(
            "SELECT a.id FROM workflow.alerts a WHERE {VISIBLE_TO} AND a.status::text = ANY($3)"
        ))
        .bind(viewer.user_id)
        .bind(&viewer.role_ids)
        .bind(status_tags(statuses))
        .fetch_all(self.pool())
        .await?)
    }

    async fn transition(&self, id: Uuid, from: &[AlertStatus], change: &AlertChange) -> StoreResult<bool> {
        let (ack_by, ack_at) = match change.to {
            AlertStatus::Acknowledged => (Some(change.actor), Some(change.at)),
            _ => (None, None),
        };
        let (dismiss_by, dismiss_at) = match change.to {
            AlertStatus::Dismissed => (Some(change.actor), Some(change.at)),
            _ => (None, None),
        };

        let result = sqlx::query(
            "UPDATE workflow.alerts SET status = $2, \
             acknowledged_by = COALESCE($3, acknowledged_by), \
             acknowledged_at = COALESCE($4, acknowledged_at), \
             dismissed_by = COALESCE($5, dismissed_by), \
             dismissed_at = COALESCE($6, dismissed_at), \
             notes = COALESCE($7, notes), updated_at = $8 \
             WHERE id = $1 AND status::text = ANY($9)",
        )
        .bind(id)
        .bind(change.to)
        .bind(ack_by)
        .bind(ack_at)
        .bind(dismiss_by)
        .bind(dismiss_at)
        .bind(&change.notes)
        .bind(change.at)
        .bind(status_tags(from))
        .execute(self.pool())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM workflow.alerts WHERE id = $1)")
                .bind(id)
                .fetch_one(self.pool())
                .await?;
        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound("Alert".to_string()))
        }
    }
}

#[async_trait]
impl RoleDirectory for PgStore {
    async fn roles_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Uuid>> {
        Ok(
            sqlx::query_scalar::<_, Uuid>("SELECT role_id FROM workflow.user_roles WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(self.pool())
                .await?,
        )
    }

    async fn users_in_role(&self, role_id: Uuid) -> StoreResult<Vec<Uuid>> {
        Ok(
            sqlx::query_scalar::<_, Uuid>("SELECT user_id FROM workflow.user_roles WHERE role_id = $1")
                .bind(role_id)
                .fetch_all(self.pool())
                .await?,
        )
    }
}
