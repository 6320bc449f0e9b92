// Trigger conditions - predicates over a change event's payload and field changes

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use bizflow_shared::FieldChange;

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("malformed trigger conditions: {0}")]
    Malformed(String),
    #[error("invalid regex for field '{field}': {message}")]
    InvalidRegex { field: String, message: String },
    #[error("operator '{operator}' on field '{field}' requires a value")]
    MissingValue { field: String, operator: String },
}

/// Condition operators
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    // Equality
    Equals,
    NotEquals,

    // String operations
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,

    // Ordering (numbers, or RFC 3339 timestamps)
    #[serde(alias = "greater_than")]
    Gt,
    #[serde(alias = "greater_than_or_equals")]
    Gte,
    #[serde(alias = "less_than")]
    Lt,
    #[serde(alias = "less_than_or_equals")]
    Lte,

    // Membership
    In,
    NotIn,

    // Null checks
    IsNull,
    IsNotNull,

    // Field changes carried by the event
    Changed,
    ChangedFrom,
    ChangedTo,
}

impl ConditionOperator {
    fn needs_value(&self) -> bool {
        !matches!(self, Self::IsNull | Self::IsNotNull | Self::Changed)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    #[default]
    #[serde(alias = "AND")]
    And,
    #[serde(alias = "OR")]
    Or,
}

/// A single field predicate. `field` supports dot notation for nested values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldCondition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

/// Group of conditions with AND/OR logic, possibly nested.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConditions {
    #[serde(default)]
    pub logic: Logic,
    #[serde(default)]
    pub conditions: Vec<FieldCondition>,
    #[serde(default)]
    pub groups: Vec<TriggerConditions>,
}

/// What a condition is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct ConditionInput<'a> {
    pub payload: &'a Value,
    pub changes: &'a HashMap<String, FieldChange>,
}

impl TriggerConditions {
    /// Parses and checks a stored conditions document. `null` means "always".
    pub fn parse(raw: &Value) -> Result<Self, ConditionError> {
        if raw.is_null() {
            return Ok(Self::default());
        }
        let parsed: Self = serde_json::from_value(raw.clone())
            .map_err(|e| ConditionError::Malformed(e.to_string()))?;
        parsed.check()?;
        Ok(parsed)
    }

    fn check(&self) -> Result<(), ConditionError> {
        for condition in &self.conditions {
            if condition.operator.needs_value() && condition.value.is_null() {
                return Err(ConditionError::MissingValue {
                    field: condition.field.clone(),
                    operator: format!("{:?}", condition.operator),
                });
            }
            if condition.operator == ConditionOperator::Regex {
                let pattern = condition.value.as_str().unwrap_or_default();
                Regex::new(pattern).map_err(|e| ConditionError::InvalidRegex {
                    field: condition.field.clone(),
                    message: e.to_string(),
                })?;
            }
        }
        self.groups.iter().try_for_each(Self::check)
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.groups.is_empty()
    }

    pub fn evaluate(&self, input: ConditionInput<'_>) -> bool {
        if self.is_empty() {
            return true;
        }

        let mut results = self
            .conditions
            .iter()
            .map(|c| c.evaluate(input))
            .chain(self.groups.iter().map(|g| g.evaluate(input)));

        match self.logic {
            Logic::And => results.all(|r| r),
            Logic::Or => results.any(|r| r),
        }
    }
}

impl FieldCondition {
    pub fn new(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    pub fn evaluate(&self, input: ConditionInput<'_>) -> bool {
        let field_value = lookup(input.payload, &self.field).filter(|v| !v.is_null());
        let expected = &self.value;

        match self.operator {
            ConditionOperator::Equals => field_value.map(|v| same_value(v, expected)).unwrap_or(false),
            ConditionOperator::NotEquals => field_value.map(|v| !same_value(v, expected)).unwrap_or(true),
            ConditionOperator::Contains => {
                string_pair(field_value, expected).map(|(s, p)| s.contains(&p)).unwrap_or(false)
            }
            ConditionOperator::NotContains => {
                string_pair(field_value, expected).map(|(s, p)| !s.contains(&p)).unwrap_or(true)
            }
            ConditionOperator::StartsWith => {
                string_pair(field_value, expected).map(|(s, p)| s.starts_with(&p)).unwrap_or(false)
            }
            ConditionOperator::EndsWith => {
                string_pair(field_value, expected).map(|(s, p)| s.ends_with(&p)).unwrap_or(false)
            }
            ConditionOperator::Regex => {
                match (field_value.and_then(Value::as_str), expected.as_str()) {
                    (Some(s), Some(pattern)) => {
                        Regex::new(pattern).map(|re| re.is_match(s)).unwrap_or(false)
                    }
                    _ => false,
                }
            }
            ConditionOperator::Gt => compare(field_value, expected).map(|o| o.is_gt()).unwrap_or(false),
            ConditionOperator::Gte => compare(field_value, expected).map(|o| o.is_ge()).unwrap_or(false),
            ConditionOperator::Lt => compare(field_value, expected).map(|o| o.is_lt()).unwrap_or(false),
            ConditionOperator::Lte => compare(field_value, expected).map(|o| o.is_le()).unwrap_or(false),
            ConditionOperator::In => match (field_value, expected.as_array()) {
                (Some(v), Some(list)) => list.iter().any(|item| same_value(v, item)),
                _ => false,
            },
            ConditionOperator::NotIn => match (field_value, expected.as_array()) {
                (Some(v), Some(list)) => !list.iter().any(|item| same_value(v, item)),
                _ => true,
            },
            ConditionOperator::IsNull => field_value.is_none(),
            ConditionOperator::IsNotNull => field_value.is_some(),
            ConditionOperator::Changed => input
                .changes
                .get(&self.field)
                .map(|c| !same_value(&c.old, &c.new))
                .unwrap_or(false),
            ConditionOperator::ChangedFrom => input
                .changes
                .get(&self.field)
                .map(|c| !same_value(&c.old, &c.new) && same_value(&c.old, expected))
                .unwrap_or(false),
            ConditionOperator::ChangedTo => input
                .changes
                .get(&self.field)
                .map(|c| !same_value(&c.old, &c.new) && same_value(&c.new, expected))
                .unwrap_or(false),
        }
    }
}

/// Resolves a dot-separated path (`customer.address.city`) inside `value`.
/// Numeric segments index into arrays.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn string_pair(field: Option<&Value>, expected: &Value) -> Option<(String, String)> {
    let s = field?.as_str()?;
    let p = expected.as_str()?;
    Some((s.to_lowercase(), p.to_lowercase()))
}

/// JSON equality, except that numbers compare by value (`5` equals `5.0`).
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(field: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let field = field?;
    if let (Some(a), Some(b)) = (as_number(field), as_number(expected)) {
        return a.partial_cmp(&b);
    }
    let a = field.as_str()?.parse::<DateTime<Utc>>().ok()?;
    let b = expected.as_str()?.parse::<DateTime<Utc>>().ok()?;
    Some(a.cmp(&b))
}

// Numeric strings ("12.5") are accepted since many entity columns arrive as text.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
