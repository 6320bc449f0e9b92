// Built-in action handlers registered at startup

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use bizflow_shared::{AlertSeverity, NewAlert, RecipientRef, TriggerKind};

use super::actions::{parse_config, ActionContext, ActionError, ActionHandler, ActionRegistry, EntityWrite};
use super::catalog::ReferenceCatalog;
use crate::alerts::AlertService;
use crate::services::email::{EmailSender, OutgoingEmail};
use crate::services::entity_writer::{EntityWriter, WriteError};

/// Collaborators the built-in handlers are constructed with.
pub struct BuiltinDeps {
    pub alerts: Arc<AlertService>,
    pub catalog: Arc<ReferenceCatalog>,
    pub entity_writer: Arc<dyn EntityWriter>,
    pub email: Arc<dyn EmailSender>,
    pub http: reqwest::Client,
}

pub fn register_builtin(registry: &mut ActionRegistry, deps: BuiltinDeps) {
    registry
        .register(
            "create_alert",
            Arc::new(CreateAlert {
                alerts: deps.alerts,
                catalog: deps.catalog.clone(),
            }),
        )
        .register(
            "update_field",
            Arc::new(UpdateField {
                catalog: deps.catalog.clone(),
                writer: deps.entity_writer.clone(),
            }),
        )
        .register(
            "allocate_inventory",
            Arc::new(AllocateInventory {
                catalog: deps.catalog,
                writer: deps.entity_writer,
            }),
        )
        .register("send_email", Arc::new(SendEmail { sender: deps.email }))
        .register("call_webhook", Arc::new(CallWebhook { client: deps.http }))
        .register("log_message", Arc::new(LogMessage));
}

fn record_id(ctx: &ActionContext<'_>, explicit: Option<Uuid>) -> Result<Uuid, ActionError> {
    explicit
        .or(ctx.event.record_id)
        .ok_or_else(|| ActionError::Failed("event has no record id to write to".to_string()))
}

impl From<WriteError> for ActionError {
    fn from(err: WriteError) -> Self {
        match err {
            WriteError::InvalidField(_) | WriteError::NotNumeric(_) => {
                ActionError::InvalidConfig(err.to_string())
            }
            WriteError::Database(_) => ActionError::Unavailable(err.to_string()),
            _ => ActionError::Failed(err.to_string()),
        }
    }
}

// ----------------------------------------------------------------------------
// create_alert
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateAlertConfig {
    alert_type: String,
    severity: AlertSeverity,
    title: String,
    message: String,
    #[serde(default)]
    context: Option<Value>,
    #[serde(default)]
    expires_in_minutes: Option<i64>,
    #[serde(default)]
    recipients: Vec<RecipientRef>,
}

pub struct CreateAlert {
    alerts: Arc<AlertService>,
    catalog: Arc<ReferenceCatalog>,
}

#[async_trait]
impl ActionHandler for CreateAlert {
    fn description(&self) -> &'static str {
        "Raise an alert for users or roles"
    }

    fn default_config(&self) -> Value {
        json!({
            "alert_type": "workflow",
            "severity": "medium",
            "title": "",
            "message": "",
            "recipients": []
        })
    }

    fn validate_config(&self, config: &Value) -> Result<(), ActionError> {
        let cfg: CreateAlertConfig = parse_config(config)?;
        if cfg.title.trim().is_empty() {
            return Err(ActionError::InvalidConfig("title is required".to_string()));
        }
        if matches!(cfg.expires_in_minutes, Some(m) if m <= 0) {
            return Err(ActionError::InvalidConfig(
                "expires_in_minutes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ActionContext<'_>, config: &Value) -> Result<Value, ActionError> {
        let cfg: CreateAlertConfig = parse_config(config)?;
        let source_key = match (ctx.execution_id, ctx.action_id) {
            (Some(execution), Some(action)) => Some(format!("{execution}:{action}")),
            _ => None,
        };
        let source_entity_name = self.catalog.entity(ctx.event.entity_id).map(|e| e.name.clone());

        let alert = self
            .alerts
            .create(NewAlert {
                alert_type: cfg.alert_type,
                severity: cfg.severity,
                title: cfg.title,
                message: cfg.message,
                context: cfg.context.or_else(|| Some(ctx.event.payload.clone())),
                source_entity_name,
                source_entity_id: ctx.event.record_id,
                source_rule_id: ctx.rule_id,
                source_key,
                expires_at: cfg
                    .expires_in_minutes
                    .map(|m| Utc::now() + chrono::Duration::minutes(m)),
                recipients: cfg.recipients,
            })
            .await
            .map_err(|e| ActionError::Unavailable(e.to_string()))?;

        Ok(json!({ "alert_id": alert.id, "status": alert.status }))
    }
}

// ----------------------------------------------------------------------------
// update_field
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UpdateFieldConfig {
    target_entity: String,
    target_field: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    record_id: Option<Uuid>,
}

pub struct UpdateField {
    catalog: Arc<ReferenceCatalog>,
    writer: Arc<dyn EntityWriter>,
}

#[async_trait]
impl ActionHandler for UpdateField {
    fn description(&self) -> &'static str {
        "Set a field on the changed record or another record"
    }

    fn default_config(&self) -> Value {
        json!({ "target_entity": "", "target_field": "", "value": null })
    }

    fn validate_config(&self, config: &Value) -> Result<(), ActionError> {
        let cfg: UpdateFieldConfig = parse_config(config)?;
        if self.catalog.entity_by_name(&cfg.target_entity).is_none() {
            return Err(ActionError::InvalidConfig(format!(
                "unknown entity '{}'",
                cfg.target_entity
            )));
        }
        crate::services::entity_writer::check_identifier(&cfg.target_field)?;
        Ok(())
    }

    fn writes_entity(&self, config: &Value) -> Option<EntityWrite> {
        let cfg: UpdateFieldConfig = parse_config(config).ok()?;
        Some(EntityWrite {
            entity_name: cfg.target_entity,
            trigger: TriggerKind::OnUpdate,
        })
    }

    async fn execute(&self, ctx: &ActionContext<'_>, config: &Value) -> Result<Value, ActionError> {
        let cfg: UpdateFieldConfig = parse_config(config)?;
        let entity = self.catalog.entity_by_name(&cfg.target_entity).ok_or_else(|| {
            ActionError::InvalidConfig(format!("unknown entity '{}'", cfg.target_entity))
        })?;
        let record_id = record_id(ctx, cfg.record_id)?;

        self.writer
            .set_field(entity, record_id, &cfg.target_field, &cfg.value)
            .await?;

        tracing::debug!(
            entity = %entity.name,
            %record_id,
            field = %cfg.target_field,
            "Field updated by workflow"
        );
        Ok(json!({
            "entity": entity.name,
            "record_id": record_id,
            "field": cfg.target_field,
            "value": cfg.value
        }))
    }
}

// ----------------------------------------------------------------------------
// allocate_inventory
// ----------------------------------------------------------------------------

fn default_inventory_entity() -> String {
    "inventory_items".to_string()
}

fn default_quantity_field() -> String {
    "quantity".to_string()
}

#[derive(Debug, Deserialize)]
struct AllocateInventoryConfig {
    #[serde(default = "default_inventory_entity")]
    inventory_entity: String,
    #[serde(default = "default_quantity_field")]
    quantity_field: String,
    quantity: f64,
    #[serde(default)]
    item_id: Option<Uuid>,
    #[serde(default)]
    location_id: Option<Uuid>,
}

pub struct AllocateInventory {
    catalog: Arc<ReferenceCatalog>,
    writer: Arc<dyn EntityWriter>,
}

#[async_trait]
impl ActionHandler for AllocateInventory {
    fn description(&self) -> &'static str {
        "Reserve stock by decrementing an inventory quantity"
    }

    fn default_config(&self) -> Value {
        json!({
            "inventory_entity": default_inventory_entity(),
            "quantity_field": default_quantity_field(),
            "quantity": 1
        })
    }

    fn validate_config(&self, config: &Value) -> Result<(), ActionError> {
        let cfg: AllocateInventoryConfig = parse_config(config)?;
        if !(cfg.quantity > 0.0) {
            return Err(ActionError::InvalidConfig("quantity must be positive".to_string()));
        }
        crate::services::entity_writer::check_identifier(&cfg.quantity_field)?;
        Ok(())
    }

    fn writes_entity(&self, config: &Value) -> Option<EntityWrite> {
        let cfg: AllocateInventoryConfig = parse_config(config).ok()?;
        Some(EntityWrite {
            entity_name: cfg.inventory_entity,
            trigger: TriggerKind::OnUpdate,
        })
    }

    async fn execute(&self, ctx: &ActionContext<'_>, config: &Value) -> Result<Value, ActionError> {
        let cfg: AllocateInventoryConfig = parse_config(config)?;
        let entity = self.catalog.entity_by_name(&cfg.inventory_entity).ok_or_else(|| {
            ActionError::InvalidConfig(format!("unknown entity '{}'", cfg.inventory_entity))
        })?;
        let item_id = record_id(ctx, cfg.item_id)?;

        // A redelivered execution must not take the same stock twice.
        let remaining = match (ctx.execution_id, ctx.action_id) {
            (Some(execution_id), Some(action_id)) => {
                let key = format!("{execution_id}:{action_id}");
                self.writer
                    .adjust_field_once(&key, entity, item_id, &cfg.quantity_field, -cfg.quantity, true)
                    .await?
            }
            _ => {
                self.writer
                    .adjust_field(entity, item_id, &cfg.quantity_field, -cfg.quantity, true)
                    .await?
            }
        };

        tracing::info!(%item_id, allocated = cfg.quantity, remaining, "Inventory allocated");
        Ok(json!({
            "item_id": item_id,
            "location_id": cfg.location_id,
            "allocated": cfg.quantity,
            "remaining": remaining
        }))
    }
}

// ----------------------------------------------------------------------------
// send_email
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl Recipients {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(addr) => addr
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect(),
            Self::Many(addrs) => addrs,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendEmailConfig {
    to: Recipients,
    subject: String,
    body: String,
}

pub struct SendEmail {
    sender: Arc<dyn EmailSender>,
}

#[async_trait]
impl ActionHandler for SendEmail {
    fn description(&self) -> &'static str {
        "Send an email"
    }

    fn default_config(&self) -> Value {
        json!({ "to": "", "subject": "", "body": "" })
    }

    fn validate_config(&self, config: &Value) -> Result<(), ActionError> {
        let cfg: SendEmailConfig = parse_config(config)?;
        if cfg.to.into_vec().is_empty() {
            return Err(ActionError::InvalidConfig("at least one recipient is required".to_string()));
        }
        Ok(())
    }

    async fn execute(&self, _ctx: &ActionContext<'_>, config: &Value) -> Result<Value, ActionError> {
        let cfg: SendEmailConfig = parse_config(config)?;
        let to = cfg.to.into_vec();
        let email = OutgoingEmail {
            to: to.clone(),
            subject: cfg.subject.clone(),
            html_body: cfg.body,
            text_body: None,
        };
        self.sender
            .send(&email)
            .await
            .map_err(|e| ActionError::Failed(e.to_string()))?;

        Ok(json!({ "sent_to": to, "subject": cfg.subject }))
    }
}

// ----------------------------------------------------------------------------
// call_webhook
// ----------------------------------------------------------------------------

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Deserialize)]
struct WebhookConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

pub struct CallWebhook {
    client: reqwest::Client,
}

fn parse_method(method: &str) -> Result<reqwest::Method, ActionError> {
    match method.to_uppercase().as_str() {
        "GET" => Ok(reqwest::Method::GET),
        "POST" => Ok(reqwest::Method::POST),
        "PUT" => Ok(reqwest::Method::PUT),
        "PATCH" => Ok(reqwest::Method::PATCH),
        "DELETE" => Ok(reqwest::Method::DELETE),
        other => Err(ActionError::InvalidConfig(format!("unsupported HTTP method '{other}'"))),
    }
}

fn parse_target(raw: &str) -> Result<url::Url, ActionError> {
    let url = url::Url::parse(raw)
        .map_err(|e| ActionError::InvalidConfig(format!("invalid url '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ActionError::InvalidConfig(format!("unsupported url scheme '{other}'"))),
    }
}

#[async_trait]
impl ActionHandler for CallWebhook {
    fn description(&self) -> &'static str {
        "Call an HTTP endpoint"
    }

    fn default_config(&self) -> Value {
        json!({ "url": "", "method": "POST", "headers": {}, "body": null })
    }

    fn validate_config(&self, config: &Value) -> Result<(), ActionError> {
        let cfg: WebhookConfig = parse_config(config)?;
        parse_method(&cfg.method)?;
        parse_target(&cfg.url)?;
        Ok(())
    }

    async fn execute(&self, ctx: &ActionContext<'_>, config: &Value) -> Result<Value, ActionError> {
        let cfg: WebhookConfig = parse_config(config)?;
        let method = parse_method(&cfg.method)?;
        let target = parse_target(&cfg.url)?;

        let mut request = self
            .client
            .request(method, target)
            .timeout(Duration::from_secs(cfg.timeout_secs.unwrap_or(30)));
        for (key, value) in &cfg.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(execution_id) = ctx.execution_id {
            request = request.header("X-Workflow-Execution", execution_id.to_string());
        }
        if let Some(body) = &cfg.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ActionError::Failed(format!("request to {} failed: {}", cfg.url, e)))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(ActionError::Failed(format!(
                "{} responded with {}",
                cfg.url,
                status.as_u16()
            )));
        }
        Ok(json!({ "status_code": status.as_u16(), "response_body": body }))
    }
}

// ----------------------------------------------------------------------------
// log_message
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LogMessageConfig {
    message: String,
    #[serde(default)]
    level: Option<String>,
}

pub struct LogMessage;

#[async_trait]
impl ActionHandler for LogMessage {
    fn description(&self) -> &'static str {
        "Write a message to the service log"
    }

    fn default_config(&self) -> Value {
        json!({ "message": "", "level": "info" })
    }

    fn validate_config(&self, config: &Value) -> Result<(), ActionError> {
        let cfg: LogMessageConfig = parse_config(config)?;
        match cfg.level.as_deref() {
            None | Some("debug" | "info" | "warn" | "error") => Ok(()),
            Some(other) => Err(ActionError::InvalidConfig(format!("unknown log level '{other}'"))),
        }
    }

    async fn execute(&self, ctx: &ActionContext<'_>, config: &Value) -> Result<Value, ActionError> {
        let cfg: LogMessageConfig = parse_config(config)?;
        let event_id = ctx.event.event_id;
        match cfg.level.as_deref().unwrap_or("info") {
            "debug" => tracing::debug!(%event_id, "{}", cfg.message),
            "warn" => tracing::warn!(%event_id, "{}", cfg.message),
            "error" => tracing::error!(%event_id, "{}", cfg.message),
            _ => tracing::info!(%event_id, "{}", cfg.message),
        }
        Ok(json!({ "logged": cfg.message }))
    }
}
