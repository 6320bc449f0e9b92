//! Read-only lookup tables for trigger types, entity types and entities.
//!
//! Loaded once at startup; rules and events refer to these by id.

use std::collections::HashMap;

use uuid::Uuid;

use bizflow_shared::{Entity, EntityType, TriggerKind, TriggerType};

use super::store::{CatalogSnapshot, CatalogStore, StoreResult};

#[derive(Debug, Clone, Default)]
pub struct ReferenceCatalog {
    trigger_types: Vec<TriggerType>,
    entity_types: Vec<EntityType>,
    entities: Vec<Entity>,
    trigger_by_name: HashMap<String, Uuid>,
    entity_by_name: HashMap<String, usize>,
}

impl ReferenceCatalog {
    pub async fn load(store: &dyn CatalogStore) -> StoreResult<Self> {
        let snapshot = store.load_catalog().await?;
        tracing::info!(
            trigger_types = snapshot.trigger_types.len(),
            entity_types = snapshot.entity_types.len(),
            entities = snapshot.entities.len(),
            "Reference catalog loaded"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn from_snapshot(snapshot: CatalogSnapshot) -> Self {
        let trigger_by_name = snapshot
            .trigger_types
            .iter()
            .map(|t| (t.name.clone(), t.id))
            .collect();
        let entity_by_name = snapshot
            .entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();

        Self {
            trigger_types: snapshot.trigger_types,
            entity_types: snapshot.entity_types,
            entities: snapshot.entities,
            trigger_by_name,
            entity_by_name,
        }
    }

    pub fn trigger_types(&self) -> &[TriggerType] {
        &self.trigger_types
    }

    pub fn entity_types(&self) -> &[EntityType] {
        &self.entity_types
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn trigger_type_id(&self, kind: TriggerKind) -> Option<Uuid> {
        self.trigger_by_name.get(kind.as_str()).copied()
    }

    pub fn has_trigger_type(&self, id: Uuid) -> bool {
        self.trigger_type(id).is_some()
    }

    pub fn trigger_type(&self, id: Uuid) -> Option<&TriggerType> {
        self.trigger_types.iter().find(|t| t.id == id)
    }

    pub fn trigger_type_by_name(&self, name: &str) -> Option<&TriggerType> {
        let id = self.trigger_by_name.get(name)?;
        self.trigger_type(*id)
    }

    /// The trigger kind a stored trigger type stands for.
    pub fn trigger_kind(&self, id: Uuid) -> Option<TriggerKind> {
        self.trigger_type(id).and_then(|t| t.name.parse().ok())
    }

    pub fn entity(&self, id: Uuid) -> Option<&Entity> {
        self.entities.iter().find(|e| e.id == id)
    }

    pub fn entity_by_name(&self, name: &str) -> Option<&Entity> {
        self.entity_by_name.get(name).map(|i| &self.entities[*i])
    }

    pub fn entity_type(&self, id: Uuid) -> Option<&EntityType> {
        self.entity_types.iter().find(|t| t.id == id)
    }

    pub fn has_entity_type(&self, id: Uuid) -> bool {
        self.entity_type(id).is_some()
    }
}
