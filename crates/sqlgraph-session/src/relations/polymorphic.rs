use super::{Relation, inverse_add, inverse_remove};
use crate::entity::{EntityRef, Permit, Slot, write_slot};
use crate::metadata::{FieldId, FieldKind, PolyComponent};
use futures::future::LocalBoxFuture;
use sqlgraph_core::{Cx, Error, IdValue, NotFoundError, Outcome, Result, Value, try_outcome, try_result};

/// A reference to one of several entity types, one nullable column per type.
///
/// The slot holds the tagged id (`a:1`) until the target is resolved.
pub struct Polymorphic {
    entity: EntityRef,
    field: FieldId,
    permit: Permit,
}

impl Polymorphic {
    pub(crate) fn new(entity: EntityRef, field: FieldId, permit: Permit) -> Self {
        Self {
            entity,
            field,
            permit,
        }
    }

    fn components(&self) -> Result<Vec<PolyComponent>> {
        let def = self.entity.meta().try_field(self.field)?;
        match &def.kind {
            FieldKind::Polymorphic { components, .. } => Ok(components.clone()),
            _ => Err(Error::Custom(format!(
                "{}.{} is not polymorphic",
                self.entity.entity_type(),
                def.name
            ))),
        }
    }

    fn component_for(&self, entity_type: &str) -> Result<PolyComponent> {
        self.components()?
            .into_iter()
            .find(|c| c.other == entity_type)
            .ok_or_else(|| {
                Error::Custom(format!(
                    "{}.{} cannot reference {}",
                    self.entity.entity_type(),
                    self.name(),
                    entity_type
                ))
            })
    }

    /// The stored tagged id, loaded or not.
    pub fn id(&self) -> Option<String> {
        match self.entity.slot(self.field) {
            Slot::Entity(target) => target.tagged_id(),
            Slot::Value(Value::Text(tagged)) => Some(tagged),
            Slot::Value(_) => None,
        }
    }

    pub fn is_set(&self) -> bool {
        !self.entity.slot(self.field).is_null()
    }

    fn current(&self) -> Option<EntityRef> {
        match self.entity.slot(self.field) {
            Slot::Entity(target) => Some(target),
            Slot::Value(Value::Text(tagged)) => {
                let target = self.entity.manager().ok()?.find_existing(&tagged)?;
                self.entity.resolve_slot(self.field, &target);
                Some(target)
            }
            Slot::Value(_) => None,
        }
    }

    pub fn get(&self) -> Result<Option<EntityRef>> {
        Ok(self.get_with_deleted()?.filter(|t| !t.is_deleted()))
    }

    pub fn get_with_deleted(&self) -> Result<Option<EntityRef>> {
        if !self.is_set() {
            return Ok(None);
        }
        self.current().map(Some).ok_or_else(|| self.not_loaded())
    }

    pub async fn load(&self, cx: &Cx) -> Outcome<Option<EntityRef>, Error> {
        if !self.is_set() {
            return Outcome::Ok(None);
        }
        if let Some(target) = self.current() {
            return Outcome::Ok(Some(target).filter(|t| !t.is_deleted()));
        }
        let Some(tagged) = self.id() else {
            return Outcome::Ok(None);
        };
        let em = try_result!(self.entity.manager());
        let meta = tagged
            .split_once(':')
            .and_then(|(tag, _)| em.registry().by_tag(tag))
            .cloned();
        let Some(meta) = meta else {
            return Outcome::Err(Error::Custom(format!(
                "{}.{} holds unknown reference '{}'",
                self.entity.entity_type(),
                self.name(),
                tagged
            )));
        };
        let Some(id) = IdValue::parse_tagged(&tagged, meta.tag) else {
            return Outcome::Ok(None);
        };
        match try_outcome!(em.load_if_exists(cx, &meta, id).await) {
            Some(target) => {
                self.entity.resolve_slot(self.field, &target);
                Outcome::Ok(Some(target).filter(|t| !t.is_deleted()))
            }
            None => Outcome::Err(Error::NotFound(NotFoundError {
                entity: meta.name,
                ids: vec![tagged],
            })),
        }
    }

    /// Point at `target`, which must be one of the declared component types.
    pub fn set(&self, target: Option<&EntityRef>) -> Result<()> {
        let new_component = match target {
            Some(target) => Some(self.component_for(target.entity_type())?),
            None => None,
        };
        let previous = self.current();
        let slot = target.map_or(Slot::NULL, |t| Slot::Entity(t.clone()));
        if !write_slot(&self.entity, self.field, slot, self.permit)? {
            return Ok(());
        }
        if let Some(previous) = previous {
            let component = self.component_for(previous.entity_type())?;
            inverse_remove(&previous, component.other_field, &self.entity);
        }
        if let (Some(target), Some(component)) = (target, new_component) {
            inverse_add(target, component.other_field, &self.entity);
        }
        Ok(())
    }
}

/// Column values for a polymorphic slot: the id under the matching
/// component's column, `NULL` under the others.
pub(crate) fn component_values(
    em: &crate::manager::EntityManager,
    components: &[PolyComponent],
    slot: &Slot,
) -> Vec<(&'static str, Value)> {
    let (target_type, id) = match slot {
        Slot::Entity(target) => (Some(target.entity_type()), target.id()),
        Slot::Value(Value::Text(tagged)) => tagged
            .split_once(':')
            .and_then(|(tag, _)| em.registry().by_tag(tag))
            .map_or((None, None), |meta| {
                (Some(meta.name), IdValue::parse_tagged(tagged, meta.tag))
            }),
        Slot::Value(_) => (None, None),
    };
    components
        .iter()
        .map(|c| {
            let value = match (&id, target_type) {
                (Some(id), Some(t)) if t == c.other => id.to_value(),
                _ => Value::Null,
            };
            (c.column, value)
        })
        .collect()
}

impl Relation for Polymorphic {
    fn owner(&self) -> &EntityRef {
        &self.entity
    }

    fn field(&self) -> FieldId {
        self.field
    }

    fn is_loaded(&self) -> bool {
        !self.is_set() || self.current().is_some()
    }

    fn load_targets<'a>(&'a self, cx: &'a Cx) -> LocalBoxFuture<'a, Outcome<Vec<EntityRef>, Error>> {
        Box::pin(async move { self.load(cx).await.map(|t| t.into_iter().collect()) })
    }

    fn loaded_targets(&self) -> Vec<EntityRef> {
        self.current().into_iter().collect()
    }

    fn cleanup_on_entity_deleted(&self) -> Result<()> {
        Ok(())
    }
}
