// Workflow Triggers - matching entity change events to active rules

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use bizflow_shared::{AutomationRule, Entity, EntityChangeEvent, FieldChange, TriggerKind};

use super::catalog::ReferenceCatalog;
use super::conditions::{ConditionInput, TriggerConditions};
use super::store::{RuleStore, StoreResult};

/// Why a rule did or did not match an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    Matched,
    Inactive,
    DifferentBinding,
    ConditionsFalse,
    /// Stored conditions could not be parsed; the rule never fires.
    ConditionsInvalid(String),
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched)
    }
}

/// Selects the rules an event should run.
pub struct TriggerEvaluator {
    catalog: Arc<ReferenceCatalog>,
    rules: Arc<dyn RuleStore>,
}

impl TriggerEvaluator {
    pub fn new(catalog: Arc<ReferenceCatalog>, rules: Arc<dyn RuleStore>) -> Self {
        Self { catalog, rules }
    }

    /// Active rules bound to the event's entity and trigger whose conditions hold.
    /// Does not enqueue or execute anything.
    pub async fn matching_rules(&self, event: &EntityChangeEvent) -> StoreResult<Vec<AutomationRule>> {
        let Some(trigger_type_id) = self.catalog.trigger_type_id(event.trigger) else {
            tracing::warn!(trigger = %event.trigger, "No trigger type registered for event");
            return Ok(Vec::new());
        };

        let candidates = self
            .rules
            .active_rules_for(event.entity_id, trigger_type_id)
            .await?;

        let matched: Vec<AutomationRule> = candidates
            .into_iter()
            .filter(|rule| {
                let outcome = evaluate_rule(rule, trigger_type_id, event);
                if let MatchOutcome::ConditionsInvalid(reason) = &outcome {
                    tracing::warn!(rule_id = %rule.id, %reason, "Skipping rule with invalid conditions");
                }
                outcome.is_match()
            })
            .collect();

        tracing::debug!(
            event_id = %event.event_id,
            entity_id = %event.entity_id,
            matched = matched.len(),
            "Evaluated trigger event"
        );
        Ok(matched)
    }

    /// Explains how a single rule relates to an event; used by rule tests.
    pub fn explain(&self, rule: &AutomationRule, event: &EntityChangeEvent) -> MatchOutcome {
        match self.catalog.trigger_type_id(event.trigger) {
            Some(trigger_type_id) => evaluate_rule(rule, trigger_type_id, event),
            None => MatchOutcome::DifferentBinding,
        }
    }
}

/// Pure match check: binding, activation, then conditions.
pub fn evaluate_rule(
    rule: &AutomationRule,
    trigger_type_id: Uuid,
    event: &EntityChangeEvent,
) -> MatchOutcome {
    if rule.entity_id != event.entity_id
        || rule.entity_type_id != event.entity_type_id
        || rule.trigger_type_id != trigger_type_id
    {
        return MatchOutcome::DifferentBinding;
    }
    if !rule.is_active {
        return MatchOutcome::Inactive;
    }

    let raw = rule.trigger_conditions.clone().unwrap_or(Value::Null);
    let conditions = match TriggerConditions::parse(&raw) {
        Ok(c) => c,
        Err(e) => return MatchOutcome::ConditionsInvalid(e.to_string()),
    };

    let input = ConditionInput {
        payload: &event.payload,
        changes: &event.field_changes,
    };
    if conditions.evaluate(input) {
        MatchOutcome::Matched
    } else {
        MatchOutcome::ConditionsFalse
    }
}

/// Convenience constructors for change events
pub struct ChangeEvent;

impl ChangeEvent {
    pub fn new(entity: &Entity, trigger: TriggerKind, record_id: Option<Uuid>, payload: Value) -> EntityChangeEvent {
        EntityChangeEvent {
            event_id: Uuid::new_v4(),
            entity_id: entity.id,
            entity_type_id: entity.entity_type_id,
            trigger,
            record_id,
            payload,
            field_changes: HashMap::new(),
            user_id: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn created(entity: &Entity, record_id: Uuid, payload: Value) -> EntityChangeEvent {
        Self::new(entity, TriggerKind::OnCreate, Some(record_id), payload)
    }

    /// An update event; `changes` lists `(field, old, new)`.
    pub fn updated(
        entity: &Entity,
        record_id: Uuid,
        payload: Value,
        changes: &[(&str, Value, Value)],
    ) -> EntityChangeEvent {
        let mut event = Self::new(entity, TriggerKind::OnUpdate, Some(record_id), payload);
        event.field_changes = changes
            .iter()
            .map(|(field, old, new)| {
                (field.to_string(), FieldChange { old: old.clone(), new: new.clone() })
            })
            .collect();
        event
    }

    pub fn deleted(entity: &Entity, record_id: Uuid, payload: Value) -> EntityChangeEvent {
        Self::new(entity, TriggerKind::OnDelete, Some(record_id), payload)
    }

    /// Placeholder event for actions run outside any trigger.
    pub fn manual(user_id: Uuid, payload: Value) -> EntityChangeEvent {
        EntityChangeEvent {
            event_id: Uuid::new_v4(),
            entity_id: Uuid::nil(),
            entity_type_id: Uuid::nil(),
            trigger: TriggerKind::OnUpdate,
            record_id: None,
            payload,
            field_changes: HashMap::new(),
            user_id: Some(user_id),
            occurred_at: Utc::now(),
        }
    }
}
