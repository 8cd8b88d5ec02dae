//! Equality index over managed entities, for types past a size threshold.
//!
//! Below the threshold, in-memory matching scans the type's entities. Once a
//! type has more managed entities than the threshold, every column-backed
//! field of that type is indexed `value -> entities`, and the write path keeps
//! it current. References are keyed by the target's id when it has one and by
//! instance otherwise, so lookups for a reference probe both keys.

use crate::entity::{EntityRef, Slot};
use crate::metadata::{EntityMetadata, FieldId, FieldKind};
use sqlgraph_core::Value;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum IndexKey {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Other(String),
    /// An unsaved reference target.
    Instance(usize),
}

impl IndexKey {
    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Int(_) | Value::BigInt(_) => {
                IndexKey::Int(value.as_i64().unwrap_or_default())
            }
            Value::Text(s) => IndexKey::Text(s.clone()),
            other => IndexKey::Other(format!("{}:{}", other.type_name(), other)),
        }
    }

    /// Keys a reference target may be stored under; `tagged` for polymorphic
    /// fields, which store `tag:id` text.
    pub fn of_target(target: &EntityRef, tagged: bool) -> Vec<Self> {
        let mut keys = vec![IndexKey::Instance(Rc::as_ptr(&target.0) as usize)];
        if let Some(id) = target.id() {
            keys.push(if tagged {
                IndexKey::Text(id.tagged(target.meta().tag))
            } else {
                IndexKey::of_value(&id.to_value())
            });
        }
        keys
    }

    /// The key a slot is inserted under.
    fn of_slot(slot: &Slot, tagged: bool) -> Self {
        match slot {
            Slot::Value(v) => IndexKey::of_value(v),
            Slot::Entity(e) => {
                let mut keys = IndexKey::of_target(e, tagged);
                keys.pop().unwrap_or(IndexKey::Null)
            }
        }
    }

    /// Every key a slot might currently be stored under.
    fn candidates(slot: &Slot, tagged: bool) -> Vec<Self> {
        match slot {
            Slot::Value(v) => vec![IndexKey::of_value(v)],
            Slot::Entity(e) => IndexKey::of_target(e, tagged),
        }
    }
}

type Buckets = HashMap<IndexKey, BTreeSet<EntityRef>>;

#[derive(Default)]
struct TypeIndex {
    fields: HashMap<FieldId, Buckets>,
}

pub(crate) struct FieldIndex {
    threshold: usize,
    types: HashMap<&'static str, TypeIndex>,
}

fn indexed_fields(meta: &EntityMetadata) -> impl Iterator<Item = (FieldId, bool)> + '_ {
    meta.fields.iter().filter_map(|f| match f.kind {
        FieldKind::Primitive { .. } | FieldKind::Enum { .. } | FieldKind::ManyToOne { .. } => {
            Some((f.id, false))
        }
        FieldKind::Polymorphic { .. } => Some((f.id, true)),
        _ => None,
    })
}

impl FieldIndex {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            types: HashMap::new(),
        }
    }

    pub fn is_indexed(&self, entity: &str) -> bool {
        self.types.contains_key(entity)
    }

    /// Build or tear down the index for `meta` after its managed count changed.
    pub fn on_count_changed(&mut self, meta: &EntityMetadata, entities: &[EntityRef]) {
        let indexed = self.types.contains_key(meta.name);
        if entities.len() > self.threshold && !indexed {
            tracing::debug!(
                entity = meta.name,
                count = entities.len(),
                "Building field index"
            );
            let mut index = TypeIndex::default();
            for (field, tagged) in indexed_fields(meta) {
                let buckets = index.fields.entry(field).or_default();
                for entity in entities {
                    buckets
                        .entry(IndexKey::of_slot(&entity.slot(field), tagged))
                        .or_default()
                        .insert(entity.clone());
                }
            }
            self.types.insert(meta.name, index);
        } else if entities.len() < self.threshold && indexed {
            tracing::debug!(entity = meta.name, "Dropping field index");
            self.types.remove(meta.name);
        }
    }

    /// Add a newly registered entity to an already-built index.
    pub fn insert(&mut self, entity: &EntityRef) {
        let Some(index) = self.types.get_mut(entity.entity_type()) else {
            return;
        };
        for (field, tagged) in indexed_fields(entity.meta()) {
            index
                .fields
                .entry(field)
                .or_default()
                .entry(IndexKey::of_slot(&entity.slot(field), tagged))
                .or_default()
                .insert(entity.clone());
        }
    }

    pub fn update(&mut self, entity: &EntityRef, field: FieldId, old: &Slot, new: &Slot) {
        let Some(index) = self.types.get_mut(entity.entity_type()) else {
            return;
        };
        let Some(buckets) = index.fields.get_mut(&field) else {
            return;
        };
        let tagged = matches!(
            entity.meta().field(field).kind,
            FieldKind::Polymorphic { .. }
        );
        for key in IndexKey::candidates(old, tagged) {
            if let Some(set) = buckets.get_mut(&key) {
                set.remove(entity);
            }
        }
        buckets
            .entry(IndexKey::of_slot(new, tagged))
            .or_default()
            .insert(entity.clone());
    }

    /// Entities of `entity_type` whose `field` is stored under any of `keys`;
    /// `None` when the type is not indexed.
    pub fn lookup(
        &self,
        entity_type: &str,
        field: FieldId,
        keys: &[IndexKey],
    ) -> Option<BTreeSet<EntityRef>> {
        let buckets = self.types.get(entity_type)?.fields.get(&field)?;
        let mut out = BTreeSet::new();
        for key in keys {
            if let Some(set) = buckets.get(key) {
                out.extend(set.iter().cloned());
            }
        }
        Some(out)
    }
}
