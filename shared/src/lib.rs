use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Error returned when a string tag does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

// Generates as_str / Display / FromStr for the snake_case tag enums below.
macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $tag:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $tag,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($tag => Ok(Self::$variant),)+
                    other => Err(UnknownVariant { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

// ----------------------------------------------------------------------------
// Reference catalog
// ----------------------------------------------------------------------------

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerType {
    pub id: Uuid,
    pub name: String, // on_create, on_update, on_delete
    pub description: Option<String>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityType {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub name: String, // logical table name, e.g. "products"
    pub entity_type_id: Uuid,
    pub schema_name: String,
}

/// The change kinds a rule can listen to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    OnCreate,
    OnUpdate,
    OnDelete,
}

string_enum!(TriggerKind, "trigger kind", {
    OnCreate => "on_create",
    OnUpdate => "on_update",
    OnDelete => "on_delete",
});

// ----------------------------------------------------------------------------
// Rules, actions, edges
// ----------------------------------------------------------------------------

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub entity_id: Uuid,
    pub entity_type_id: Uuid,
    pub trigger_type_id: Uuid,
    pub trigger_conditions: Option<serde_json::Value>,
    pub canvas_layout: Option<serde_json::Value>,
    pub is_active: bool,
    pub created_by: Uuid,
    pub updated_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAutomationRule {
    pub name: String,
    pub description: Option<String>,
    pub entity_id: Uuid,
    pub entity_type_id: Uuid,
    pub trigger_type_id: Uuid,
    pub trigger_conditions: Option<serde_json::Value>,
    pub canvas_layout: Option<serde_json::Value>,
    pub is_active: bool,
    pub created_by: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateAutomationRule {
    pub name: Option<String>,
    pub description: Option<String>,
    pub entity_id: Option<Uuid>,
    pub entity_type_id: Option<Uuid>,
    pub trigger_type_id: Option<Uuid>,
    pub trigger_conditions: Option<serde_json::Value>,
    pub canvas_layout: Option<serde_json::Value>,
    pub is_active: Option<bool>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub action_type: String,
    pub default_config: serde_json::Value,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewActionTemplate {
    pub name: String,
    pub description: Option<String>,
    pub action_type: String,
    pub default_config: serde_json::Value,
    pub created_by: Uuid,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    pub id: Uuid,
    pub automation_rule_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub action_type: String,
    pub action_config: serde_json::Value,
    pub is_active: bool,
    pub template_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRuleAction {
    pub automation_rule_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub action_type: String,
    pub action_config: serde_json::Value,
    pub is_active: bool,
    pub template_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRuleAction {
    pub name: Option<String>,
    pub description: Option<String>,
    pub action_config: Option<serde_json::Value>,
    pub is_active: Option<bool>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "edge_type", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Start,
    Sequence,
    Branch,
}

string_enum!(EdgeType, "edge type", {
    Start => "start",
    Sequence => "sequence",
    Branch => "branch",
});

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEdge {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub source_action_id: Option<Uuid>,
    pub target_action_id: Uuid,
    pub edge_type: EdgeType,
    pub edge_order: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewActionEdge {
    pub rule_id: Uuid,
    pub source_action_id: Option<Uuid>,
    pub target_action_id: Uuid,
    pub edge_type: EdgeType,
    #[serde(default)]
    pub edge_order: i32,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionPermission {
    pub id: Uuid,
    pub role_id: Uuid,
    pub action_type: String,
    pub is_allowed: bool,
}

// ----------------------------------------------------------------------------
// Change events and executions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

/// A change to a tracked entity, as reported by the surrounding backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChangeEvent {
    #[serde(default = "Uuid::new_v4")]
    pub event_id: Uuid,
    pub entity_id: Uuid,
    pub entity_type_id: Uuid,
    pub trigger: TriggerKind,
    /// Primary key of the changed record, when the change has one.
    pub record_id: Option<Uuid>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub field_changes: HashMap<String, FieldChange>,
    pub user_id: Option<Uuid>,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "execution_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

string_enum!(ExecutionStatus, "execution status", {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionRunStatus {
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub action_id: Uuid,
    pub action_name: String,
    pub action_type: String,
    pub status: ActionRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    /// Queue task that produced this execution; redeliveries share it.
    pub task_id: Uuid,
    pub automation_rule_id: Uuid,
    pub event_id: Uuid,
    pub trigger_event: serde_json::Value,
    pub status: ExecutionStatus,
    pub action_log: Vec<ActionLogEntry>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ----------------------------------------------------------------------------
// Alerts
// ----------------------------------------------------------------------------

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "alert_severity", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

string_enum!(AlertSeverity, "alert severity", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "alert_status", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Dismissed,
}

string_enum!(AlertStatus, "alert status", {
    Active => "active",
    Acknowledged => "acknowledged",
    Dismissed => "dismissed",
});

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(type_name = "recipient_type", rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientType {
    User,
    Role,
}

string_enum!(RecipientType, "recipient type", {
    User => "user",
    Role => "role",
});

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub context: Option<serde_json::Value>,
    pub source_entity_name: Option<String>,
    pub source_entity_id: Option<Uuid>,
    pub source_rule_id: Option<Uuid>,
    /// Idempotence key supplied by the producer; one alert per key.
    pub source_key: Option<String>,
    pub status: AlertStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<Uuid>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub dismissed_by: Option<Uuid>,
    pub dismissed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecipient {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub recipient_type: RecipientType,
    pub recipient_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecipientRef {
    #[serde(rename = "type")]
    pub recipient_type: RecipientType,
    pub id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAlert {
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub context: Option<serde_json::Value>,
    pub source_entity_name: Option<String>,
    pub source_entity_id: Option<Uuid>,
    pub source_rule_id: Option<Uuid>,
    pub source_key: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub recipients: Vec<RecipientRef>,
}

/// Outcome of a bulk acknowledge/dismiss call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResult {
    pub count: u64,
    pub skipped: u64,
}
