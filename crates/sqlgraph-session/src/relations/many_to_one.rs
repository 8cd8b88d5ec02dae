use super::{Relation, inverse_add, inverse_remove};
use crate::entity::{EntityRef, Permit, Slot, write_slot};
use crate::metadata::{FieldId, FieldKind};
use futures::future::LocalBoxFuture;
use sqlgraph_core::{Cx, Error, IdValue, NotFoundError, Outcome, Result, try_outcome, try_result};

/// A foreign key on the owner's table.
pub struct ManyToOne {
    entity: EntityRef,
    field: FieldId,
    permit: Permit,
}

impl ManyToOne {
    pub(crate) fn new(entity: EntityRef, field: FieldId, permit: Permit) -> Self {
        Self {
            entity,
            field,
            permit,
        }
    }

    /// `(target type, inverse field on target)`.
    fn target_def(&self) -> Result<(&'static str, &'static str)> {
        let def = self.entity.meta().try_field(self.field)?;
        match &def.kind {
            FieldKind::ManyToOne {
                other, other_field, ..
            } => Ok((*other, *other_field)),
            _ => Err(Error::Custom(format!(
                "{}.{} is not a many-to-one",
                self.entity.entity_type(),
                def.name
            ))),
        }
    }

    /// The stored target id, loaded or not.
    pub fn id(&self) -> Option<IdValue> {
        IdValue::from_value(&self.entity.slot(self.field).reference_value())
    }

    pub fn is_set(&self) -> bool {
        !self.entity.slot(self.field).is_null()
    }

    /// The target instance if it is managed; resolves the slot on the way.
    fn current(&self) -> Option<EntityRef> {
        match self.entity.slot(self.field) {
            Slot::Entity(target) => Some(target),
            Slot::Value(value) => {
                let (other, _) = self.target_def().ok()?;
                let id = IdValue::from_value(&value)?;
                let target = self.entity.manager().ok()?.find_existing_id(other, &id)?;
                self.entity.resolve_slot(self.field, &target);
                Some(target)
            }
        }
    }

    /// The target, `None` when unset or pending deletion.
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
        let (other, _) = try_result!(self.target_def());
        let Some(id) = self.id() else {
            return Outcome::Ok(None);
        };
        let em = try_result!(self.entity.manager());
        let meta = try_result!(em.meta(other));
        match try_outcome!(em.load_if_exists(cx, &meta, id.clone()).await) {
            Some(target) => {
                self.entity.resolve_slot(self.field, &target);
                Outcome::Ok(Some(target).filter(|t| !t.is_deleted()))
            }
            None => Outcome::Err(Error::NotFound(NotFoundError {
                entity: meta.name,
                ids: vec![id.tagged(meta.tag)],
            })),
        }
    }

    /// Point at `target` (or clear). Loaded inverse collections follow.
    pub fn set(&self, target: Option<&EntityRef>) -> Result<()> {
        let (other, other_field) = self.target_def()?;
        if let Some(target) = target {
            if target.entity_type() != other {
                return Err(Error::Custom(format!(
                    "{}.{} expects {}, got {}",
                    self.entity.entity_type(),
                    self.name(),
                    other,
                    target.entity_type()
                )));
            }
        }
        let previous = self.current();
        let slot = target.map_or(Slot::NULL, |t| Slot::Entity(t.clone()));
        if !write_slot(&self.entity, self.field, slot, self.permit)? {
            return Ok(());
        }
        if let Some(previous) = previous {
            inverse_remove(&previous, other_field, &self.entity);
        }
        if let Some(target) = target {
            inverse_add(target, other_field, &self.entity);
        }
        Ok(())
    }

    /// Point at a target by id without loading it.
    pub fn set_id(&self, id: Option<IdValue>) -> Result<()> {
        let (other, other_field) = self.target_def()?;
        let em = self.entity.manager()?;
        if let Some(target) = id.as_ref().and_then(|id| em.find_existing_id(other, id)) {
            return self.set(Some(&target));
        }
        let previous = self.current();
        let slot = Slot::Value(id.map_or(sqlgraph_core::Value::Null, |id| id.to_value()));
        if write_slot(&self.entity, self.field, slot, self.permit)? {
            if let Some(previous) = previous {
                inverse_remove(&previous, other_field, &self.entity);
            }
        }
        Ok(())
    }
}

impl Relation for ManyToOne {
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

    /// Loaded inverse lists keep pending-deleted children and filter on read,
    /// so there is nothing to unhook.
    fn cleanup_on_entity_deleted(&self) -> Result<()> {
        Ok(())
    }
}
