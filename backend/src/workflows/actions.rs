// Workflow Actions - the handler interface and the registry that resolves action types

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use bizflow_shared::{EntityChangeEvent, TriggerKind};

use super::conditions::lookup;

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("invalid action configuration: {0}")]
    InvalidConfig(String),
    #[error("action type '{0}' is not registered")]
    NotRegistered(String),
    #[error("{0}")]
    Failed(String),
    #[error("dependency unavailable: {0}")]
    Unavailable(String),
}

/// What a running action knows about its surroundings.
#[derive(Debug, Clone)]
pub struct ActionContext<'a> {
    pub event: &'a EntityChangeEvent,
    pub rule_id: Option<Uuid>,
    pub action_id: Option<Uuid>,
    pub execution_id: Option<Uuid>,
    /// Outputs of actions that completed before this one was started.
    pub upstream: &'a HashMap<Uuid, Value>,
    /// The user on whose behalf an ad hoc action runs.
    pub user_id: Option<Uuid>,
}

/// An entity an action writes to, declared for cascade analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityWrite {
    pub entity_name: String,
    pub trigger: TriggerKind,
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn description(&self) -> &'static str;

    /// Starting configuration offered to authors.
    fn default_config(&self) -> Value;

    /// Rejects configurations the handler could never run.
    fn validate_config(&self, config: &Value) -> Result<(), ActionError>;

    /// Entity this action modifies, if any, for the given configuration.
    fn writes_entity(&self, _config: &Value) -> Option<EntityWrite> {
        None
    }

    async fn execute(&self, ctx: &ActionContext<'_>, config: &Value) -> Result<Value, ActionError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionTypeInfo {
    pub action_type: String,
    pub description: String,
    pub default_config: Value,
}

/// Mapping from action-type tag to handler. Built at startup, read-only afterwards.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: BTreeMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `action_type`, replacing any previous handler.
    pub fn register(&mut self, action_type: impl Into<String>, handler: Arc<dyn ActionHandler>) -> &mut Self {
        let action_type = action_type.into();
        if self.handlers.insert(action_type.clone(), handler).is_some() {
            tracing::warn!(%action_type, "Replaced previously registered action handler");
        }
        self
    }

    pub fn resolve(&self, action_type: &str) -> Result<Arc<dyn ActionHandler>, ActionError> {
        self.handlers
            .get(action_type)
            .cloned()
            .ok_or_else(|| ActionError::NotRegistered(action_type.to_string()))
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    pub fn types(&self) -> Vec<ActionTypeInfo> {
        self.handlers
            .iter()
            .map(|(action_type, handler)| ActionTypeInfo {
                action_type: action_type.clone(),
                description: handler.description().to_string(),
                default_config: handler.default_config(),
            })
            .collect()
    }
}

/// Deserializes a handler's typed configuration.
pub fn parse_config<T: DeserializeOwned>(config: &Value) -> Result<T, ActionError> {
    serde_json::from_value(config.clone()).map_err(|e| ActionError::InvalidConfig(e.to_string()))
}

/// Overlays `config` on a template's defaults, one level deep.
pub fn merge_config(defaults: &Value, config: &Value) -> Value {
    match (defaults, config) {
        (Value::Object(base), Value::Object(overrides)) => {
            let mut merged = base.clone();
            for (k, v) in overrides {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Null) => defaults.clone(),
        _ => config.clone(),
    }
}

/// Replaces `{{field}}` placeholders in every string of `config` with values
/// from the event. Unknown placeholders are left as written.
pub fn render_config(config: &Value, event: &EntityChangeEvent) -> Value {
    match config {
        Value::String(s) => Value::String(render_template(s, event)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_config(v, event)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_config(v, event)).collect()),
        _ => config.clone(),
    }
}

fn placeholder() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^}\s]+)\s*\}\}").ok())
        .as_ref()
}

pub fn render_template(template: &str, event: &EntityChangeEvent) -> String {
    let Some(re) = placeholder() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &regex::Captures<'_>| {
        let path = &caps[1];
        let value = lookup(&event.payload, path).cloned().or_else(|| match path {
            "record_id" => event.record_id.map(|id| Value::String(id.to_string())),
            "user_id" => event.user_id.map(|id| Value::String(id.to_string())),
            "event_id" => Some(Value::String(event.event_id.to_string())),
            "trigger" => Some(Value::String(event.trigger.to_string())),
            _ => None,
        });
        match value {
            Some(Value::String(s)) => s,
            Some(Value::Null) => String::new(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        }
    })
    .into_owned()
}
