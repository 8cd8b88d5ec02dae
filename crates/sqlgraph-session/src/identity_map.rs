//! Identity Map pattern: at most one managed instance per `(type, id)`.
//!
//! The map provides:
//!
//! - **Uniqueness**: the same id always resolves to the same [`EntityRef`]
//! - **Cache**: loads of already-managed ids never reach the driver
//! - **Bounds**: a hard ceiling on managed entities catches runaway graphs
//!
//! New entities are managed without an id and indexed once the flush assigns one.

use crate::entity::EntityRef;
use sqlgraph_core::{Error, IdValue, Result};
use std::collections::{HashMap, HashSet};

/// Key for the identity map: entity type plus primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    entity: &'static str,
    id: IdValue,
}

impl ObjectKey {
    pub fn new(entity: &'static str, id: IdValue) -> Self {
        Self { entity, id }
    }

    /// Key for a managed entity, if it has an id yet.
    pub fn of(entity: &EntityRef) -> Option<Self> {
        entity.id().map(|id| Self::new(entity.entity_type(), id))
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn id(&self) -> &IdValue {
        &self.id
    }
}

pub(crate) struct IdentityMap {
    limit: usize,
    /// Every managed entity, in registration order.
    all: Vec<EntityRef>,
    by_key: HashMap<ObjectKey, EntityRef>,
    by_type: HashMap<&'static str, Vec<EntityRef>>,
}

impl IdentityMap {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            all: Vec::new(),
            by_key: HashMap::new(),
            by_type: HashMap::new(),
        }
    }

    /// Start managing `entity`.
    pub fn register(&mut self, entity: &EntityRef) -> Result<()> {
        if self.all.len() >= self.limit {
            tracing::warn!(limit = self.limit, "Managed entity limit reached");
            return Err(Error::TooManyEntities { limit: self.limit });
        }
        if let Some(key) = ObjectKey::of(entity) {
            if self.by_key.contains_key(&key) {
                return Err(duplicate(entity));
            }
            self.by_key.insert(key, entity.clone());
        }
        self.all.push(entity.clone());
        self.by_type
            .entry(entity.entity_type())
            .or_default()
            .push(entity.clone());
        Ok(())
    }

    /// Index an entity under the id it was just assigned.
    pub fn index_id(&mut self, entity: &EntityRef) -> Result<()> {
        let Some(key) = ObjectKey::of(entity) else {
            return Ok(());
        };
        match self.by_key.get(&key) {
            Some(existing) if existing != entity => Err(duplicate(entity)),
            Some(_) => Ok(()),
            None => {
                self.by_key.insert(key, entity.clone());
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<EntityRef> {
        self.by_key.get(key).cloned()
    }

    pub fn all(&self) -> &[EntityRef] {
        &self.all
    }

    pub fn of_type(&self, entity: &str) -> &[EntityRef] {
        self.by_type.get(entity).map_or(&[], Vec::as_slice)
    }

    pub fn count(&self, entity: &str) -> usize {
        self.of_type(entity).len()
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    /// Stop managing `evicted`; returns the affected types.
    pub fn evict(&mut self, evicted: &HashSet<EntityRef>) -> Vec<&'static str> {
        if evicted.is_empty() {
            return Vec::new();
        }
        self.all.retain(|e| !evicted.contains(e));
        self.by_key.retain(|_, e| !evicted.contains(e));
        let mut touched = Vec::new();
        for (entity, list) in &mut self.by_type {
            let before = list.len();
            list.retain(|e| !evicted.contains(e));
            if list.len() != before {
                touched.push(*entity);
            }
        }
        touched.sort_unstable();
        touched
    }
}

fn duplicate(entity: &EntityRef) -> Error {
    Error::DuplicateEntity {
        tagged_id: entity.tagged_id().unwrap_or_else(|| entity.to_string()),
    }
}
