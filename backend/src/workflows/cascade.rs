// Workflow Cascades - which other rules a rule's writes would set off

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use bizflow_shared::{AutomationRule, TriggerKind};

use super::actions::ActionRegistry;
use super::catalog::ReferenceCatalog;
use super::store::{RuleStore, StoreResult};

/// One rule that would fire because of one of the analysed rule's actions.
#[derive(Debug, Clone, Serialize)]
pub struct CascadeImpact {
    pub rule: AutomationRule,
    pub via_action_id: Uuid,
    pub via_action_name: String,
    pub target_entity: String,
    pub trigger: TriggerKind,
}

pub struct CascadeAnalyzer {
    rules: Arc<dyn RuleStore>,
    registry: Arc<ActionRegistry>,
    catalog: Arc<ReferenceCatalog>,
    include_self: bool,
}

impl CascadeAnalyzer {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        registry: Arc<ActionRegistry>,
        catalog: Arc<ReferenceCatalog>,
        include_self: bool,
    ) -> Self {
        Self {
            rules,
            registry,
            catalog,
            include_self,
        }
    }

    /// One hop only: active rules bound to an entity/trigger that one of
    /// `rule`'s active actions writes. A rule is listed once, under the first
    /// action that reaches it.
    pub async fn analyze(&self, rule: &AutomationRule) -> StoreResult<Vec<CascadeImpact>> {
        let actions = self.rules.list_actions(rule.id).await?;
        let mut seen = HashSet::new();
        let mut impacts = Vec::new();

        for action in actions.iter().filter(|a| a.is_active) {
            let Ok(handler) = self.registry.resolve(&action.action_type) else {
                continue;
            };
            let Some(write) = handler.writes_entity(&action.action_config) else {
                continue;
            };
            let Some(entity) = self.catalog.entity_by_name(&write.entity_name) else {
                tracing::debug!(
                    action_id = %action.id,
                    entity = %write.entity_name,
                    "Action writes an entity outside the catalog"
                );
                continue;
            };
            let Some(trigger_type_id) = self.catalog.trigger_type_id(write.trigger) else {
                continue;
            };

            for candidate in self.rules.active_rules_for(entity.id, trigger_type_id).await? {
                if candidate.id == rule.id && !self.include_self {
                    continue;
                }
                if !seen.insert(candidate.id) {
                    continue;
                }
                impacts.push(CascadeImpact {
                    rule: candidate,
                    via_action_id: action.id,
                    via_action_name: action.name.clone(),
                    target_entity: write.entity_name.clone(),
                    trigger: write.trigger,
                });
            }
        }

        if !impacts.is_empty() {
            tracing::info!(rule_id = %rule.id, affected = impacts.len(), "Rule cascades into other rules");
        }
        Ok(impacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::actions::{ActionContext, ActionError, ActionHandler, EntityWrite};
    use crate::workflows::store::memory::ON_UPDATE_TRIGGER_ID;
    use crate::workflows::store::{CatalogStore, MemoryStore};
    use async_trait::async_trait;
    use bizflow_shared::{Entity, NewAutomationRule, NewRuleAction};
    use serde_json::{json, Value};

    struct Writes;

    #[async_trait]
    impl ActionHandler for Writes {
        fn description(&self) -> &'static str {
            "Writes the configured entity"
        }

        fn default_config(&self) -> Value {
            json!({})
        }

        fn validate_config(&self, _config: &Value) -> Result<(), ActionError> {
            Ok(())
        }

        fn writes_entity(&self, config: &Value) -> Option<EntityWrite> {
            Some(EntityWrite {
                entity_name: config["target_entity"].as_str()?.to_string(),
                trigger: TriggerKind::OnUpdate,
            })
        }

        async fn execute(&self, _ctx: &ActionContext<'_>, _config: &Value) -> Result<Value, ActionError> {
            Ok(Value::Null)
        }
    }

    async fn rule(store: &MemoryStore, entity: &Entity, active: bool, writes: Option<&str>) -> AutomationRule {
        let rule = store
            .create_rule(NewAutomationRule {
                name: "r".to_string(),
                description: None,
                entity_id: entity.id,
                entity_type_id: entity.entity_type_id,
                trigger_type_id: ON_UPDATE_TRIGGER_ID,
                trigger_conditions: None,
                canvas_layout: None,
                is_active: active,
                created_by: Uuid::new_v4(),
            })
            .await
            .unwrap();
        if let Some(target) = writes {
            store
                .create_action(NewRuleAction {
                    automation_rule_id: rule.id,
                    name: "write".to_string(),
                    description: None,
                    action_type: "writes".to_string(),
                    action_config: json!({ "target_entity": target }),
                    is_active: true,
                    template_id: None,
                })
                .await
                .unwrap();
        }
        rule
    }

    async fn analyzer(store: Arc<MemoryStore>, include_self: bool) -> CascadeAnalyzer {
        let mut registry = ActionRegistry::new();
        registry.register("writes", Arc::new(Writes));
        let catalog = ReferenceCatalog::from_snapshot(store.load_catalog().await.unwrap());
        CascadeAnalyzer::new(store, Arc::new(registry), Arc::new(catalog), include_self)
    }

    #[tokio::test]
    async fn test_self_inclusion_is_configurable() {
        let store = Arc::new(MemoryStore::new());
        let kind = store.add_entity_type("catalog").await;
        let products = store.add_entity("products", "catalog", kind.id).await;
        let r = rule(&store, &products, true, Some("products")).await;

        let excluded = analyzer(store.clone(), false).await.analyze(&r).await.unwrap();
        assert!(excluded.is_empty());

        let included = analyzer(store, true).await.analyze(&r).await.unwrap();
        assert_eq!(included.len(), 1);
        assert_eq!(included[0].rule.id, r.id);
    }

    #[tokio::test]
    async fn test_unknown_target_entity_has_no_impact() {
        let store = Arc::new(MemoryStore::new());
        let kind = store.add_entity_type("catalog").await;
        let products = store.add_entity("products", "catalog", kind.id).await;
        let r = rule(&store, &products, true, Some("warehouses")).await;
        rule(&store, &products, true, None).await;

        let impacts = analyzer(store, false).await.analyze(&r).await.unwrap();
        assert!(impacts.is_empty());
    }
}
