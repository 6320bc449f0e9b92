//! Writes to business entities on behalf of workflow actions.
//!
//! Entities are addressed by catalog entry, so schema and table names come
//! from reference data, never from action configuration. Field names do
//! come from configuration and are checked before use.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{PgConnection, PgPool};
use tokio::sync::RwLock;
use uuid::Uuid;

use bizflow_shared::Entity;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("'{0}' is not a valid column name")]
    InvalidField(String),
    #[error("record {record_id} not found in {entity}")]
    RecordNotFound { entity: String, record_id: Uuid },
    #[error("field '{field}' would drop below zero")]
    Insufficient { field: String },
    #[error("field '{0}' is not numeric")]
    NotNumeric(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for WriteError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

#[async_trait]
pub trait EntityWriter: Send + Sync {
    async fn set_field(
        &self,
        entity: &Entity,
        record_id: Uuid,
        field: &str,
        value: &Value,
    ) -> Result<(), WriteError>;

    /// Adds `delta` to a numeric field and returns the new value. With
    /// `non_negative`, a change that would go below zero is refused.
    async fn adjust_field(
        &self,
        entity: &Entity,
        record_id: Uuid,
        field: &str,
        delta: f64,
        non_negative: bool,
    ) -> Result<f64, WriteError>;

    /// `adjust_field` applied at most once per `key`. A repeated key leaves
    /// the record alone and returns the value the first call produced.
    async fn adjust_field_once(
        &self,
        key: &str,
        entity: &Entity,
        record_id: Uuid,
        field: &str,
        delta: f64,
        non_negative: bool,
    ) -> Result<f64, WriteError>;
}

pub fn check_identifier(name: &str) -> Result<(), WriteError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63;
    if valid {
        Ok(())
    } else {
        Err(WriteError::InvalidField(name.to_string()))
    }
}

fn qualified_table(entity: &Entity) -> Result<String, WriteError> {
    check_identifier(&entity.schema_name)?;
    check_identifier(&entity.name)?;
    Ok(format!("\"{}\".\"{}\"", entity.schema_name, entity.name))
}

pub struct PgEntityWriter {
    pool: PgPool,
}

impl PgEntityWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityWriter for PgEntityWriter {
    async fn set_field(
        &self,
        entity: &Entity,
        record_id: Uuid,
        field: &str,
        value: &Value,
    ) -> Result<(), WriteError> {
        check_identifier(field)?;
        let table = qualified_table(entity)?;

        // jsonb_populate_record converts the JSON value to the column's own type.
        let sql = format!(
            "UPDATE {table} SET \"{field}\" = (jsonb_populate_record(NULL::{table}, $2)).\"{field}\" \
             WHERE id = $1"
        );
        let mut row = Map::new();
        row.insert(field.to_string(), value.clone());

        let result = sqlx::query(&sql)
            .bind(record_id)
            .bind(Value::Object(row))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(WriteError::RecordNotFound {
                entity: entity.name.clone(),
                record_id,
            });
        }
        Ok(())
    }

    async fn adjust_field(
        &self,
        entity: &Entity,
        record_id: Uuid,
        field: &str,
        delta: f64,
        non_negative: bool,
    ) -> Result<f64, WriteError> {
        let mut conn = self.pool.acquire().await?;
        adjust_on(&mut *conn, entity, record_id, field, delta, non_negative).await
    }

    async fn adjust_field_once(
        &self,
        key: &str,
        entity: &Entity,
        record_id: Uuid,
        field: &str,
        delta: f64,
        non_negative: bool,
    ) -> Result<f64, WriteError> {
        let mut tx = self.pool.begin().await?;
        let claimed: Option<String> = sqlx::query_scalar(
            "INSERT INTO workflow.applied_writes (key) VALUES ($1) \
             ON CONFLICT (key) DO NOTHING RETURNING key",
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        if claimed.is_none() {
            // Rolled back on drop; nothing was written.
            let previous: Option<f64> =
                sqlx::query_scalar("SELECT result FROM workflow.applied_writes WHERE key = $1")
                    .bind(key)
                    .fetch_one(&mut *tx)
                    .await?;
            tracing::debug!(%key, "Write already applied, returning recorded result");
            return previous.ok_or_else(|| WriteError::Database(format!("write '{key}' has no result")));
        }

        let next = adjust_on(&mut *tx, entity, record_id, field, delta, non_negative).await?;
        sqlx::query("UPDATE workflow.applied_writes SET result = $2 WHERE key = $1")
            .bind(key)
            .bind(next)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(next)
    }
}

async fn adjust_on(
    conn: &mut PgConnection,
    entity: &Entity,
    record_id: Uuid,
    field: &str,
    delta: f64,
    non_negative: bool,
) -> Result<f64, WriteError> {
    check_identifier(field)?;
    let table = qualified_table(entity)?;

    let guard = if non_negative {
        format!(" AND \"{field}\" + $2 >= 0")
    } else {
        String::new()
    };
    let sql = format!(
        "UPDATE {table} SET \"{field}\" = \"{field}\" + $2 WHERE id = $1{guard} \
         RETURNING \"{field}\"::float8"
    );

    let updated: Option<f64> = sqlx::query_scalar(&sql)
        .bind(record_id)
        .bind(delta)
        .fetch_optional(&mut *conn)
        .await?;

    match updated {
        Some(v) => Ok(v),
        None => {
            let exists: bool = sqlx::query_scalar(&format!(
                "SELECT EXISTS (SELECT 1 FROM {table} WHERE id = $1)"
            ))
            .bind(record_id)
            .fetch_one(&mut *conn)
            .await?;
            if exists {
                Err(WriteError::Insufficient { field: field.to_string() })
            } else {
                Err(WriteError::RecordNotFound {
                    entity: entity.name.clone(),
                    record_id,
                })
            }
        }
    }
}

/// Keeps records in process memory; used without a database and in tests.
#[derive(Default)]
pub struct MemoryEntityWriter {
    state: RwLock<WriterState>,
}

#[derive(Default)]
struct WriterState {
    records: HashMap<(String, Uuid), Map<String, Value>>,
    applied: HashMap<String, f64>,
}

impl WriterState {
    fn record_mut(&mut self, entity: &Entity, record_id: Uuid) -> Result<&mut Map<String, Value>, WriteError> {
        self.records
            .get_mut(&(entity.name.clone(), record_id))
            .ok_or_else(|| WriteError::RecordNotFound {
                entity: entity.name.clone(),
                record_id,
            })
    }

    fn adjust(
        &mut self,
        entity: &Entity,
        record_id: Uuid,
        field: &str,
        delta: f64,
        non_negative: bool,
    ) -> Result<f64, WriteError> {
        check_identifier(field)?;
        let record = self.record_mut(entity, record_id)?;
        let current = match record.get(field) {
            None | Some(Value::Null) => 0.0,
            Some(v) => v
                .as_f64()
                .ok_or_else(|| WriteError::NotNumeric(field.to_string()))?,
        };
        let next = current + delta;
        if non_negative && next < 0.0 {
            return Err(WriteError::Insufficient { field: field.to_string() });
        }
        record.insert(field.to_string(), Value::from(next));
        Ok(next)
    }
}

impl MemoryEntityWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_record(&self, entity: &Entity, record_id: Uuid, fields: Value) {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.state
            .write()
            .await
            .records
            .insert((entity.name.clone(), record_id), fields);
    }

    pub async fn record(&self, entity: &Entity, record_id: Uuid) -> Option<Map<String, Value>> {
        self.state
            .read()
            .await
            .records
            .get(&(entity.name.clone(), record_id))
            .cloned()
    }
}

#[async_trait]
impl EntityWriter for MemoryEntityWriter {
    async fn set_field(
        &self,
        entity: &Entity,
        record_id: Uuid,
        field: &str,
        value: &Value,
    ) -> Result<(), WriteError> {
        check_identifier(field)?;
        let mut state = self.state.write().await;
        state
            .record_mut(entity, record_id)?
            .insert(field.to_string(), value.clone());
        Ok(())
    }

    async fn adjust_field(
        &self,
        entity: &Entity,
        record_id: Uuid,
        field: &str,
        delta: f64,
        non_negative: bool,
    ) -> Result<f64, WriteError> {
        self.state
            .write()
            .await
            .adjust(entity, record_id, field, delta, non_negative)
    }

    async fn adjust_field_once(
        &self,
        key: &str,
        entity: &Entity,
        record_id: Uuid,
        field: &str,
        delta: f64,
        non_negative: bool,
    ) -> Result<f64, WriteError> {
        let mut state = self.state.write().await;
        if let Some(previous) = state.applied.get(key) {
            return Ok(*previous);
        }
        let next = state.adjust(entity, record_id, field, delta, non_negative)?;
        state.applied.insert(key.to_string(), next);
        Ok(next)
    }
}
