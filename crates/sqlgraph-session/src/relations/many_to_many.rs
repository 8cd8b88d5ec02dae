use super::Relation;
use crate::entity::{EntityRef, Permit, RelationState, check_writable};
use crate::join_rows::JoinSide;
use crate::manager::EntityManager;
use crate::metadata::{FieldId, FieldKind};
use futures::future::LocalBoxFuture;
use sqlgraph_core::{Cx, Error, Outcome, Result, try_outcome, try_result};

/// Membership stored in a join table.
///
/// Both sides read the entity manager's join rows, so adding from one side
/// is visible from the other without a reload, and changes made before
/// either side is loaded still flush.
pub struct ManyToMany {
    entity: EntityRef,
    field: FieldId,
    permit: Permit,
}

struct Def {
    side: JoinSide,
    other: &'static str,
    other_field: &'static str,
}

impl ManyToMany {
    pub(crate) fn new(entity: EntityRef, field: FieldId, permit: Permit) -> Self {
        Self {
            entity,
            field,
            permit,
        }
    }

    fn def(&self) -> Result<Def> {
        let def = self.entity.meta().try_field(self.field)?;
        match &def.kind {
            FieldKind::ManyToMany {
                other,
                other_field,
                join_table,
                column,
                other_column,
            } => Ok(Def {
                side: JoinSide::new(*join_table, *column, *other_column),
                other: *other,
                other_field: *other_field,
            }),
            _ => Err(Error::Custom(format!(
                "{}.{} is not a many-to-many",
                self.entity.entity_type(),
                def.name
            ))),
        }
    }

    fn members(&self, em: &EntityManager, side: &JoinSide) -> Vec<EntityRef> {
        em.inner.join_rows.borrow().targets(side, &self.entity)
    }

    /// Live members. Fails until loaded.
    pub fn get(&self) -> Result<Vec<EntityRef>> {
        if !self.is_loaded() {
            return Err(self.not_loaded());
        }
        let em = self.entity.manager()?;
        let def = self.def()?;
        Ok(self
            .members(&em, &def.side)
            .into_iter()
            .filter(|e| !e.is_deleted())
            .collect())
    }

    pub async fn load(&self, cx: &Cx) -> Outcome<Vec<EntityRef>, Error> {
        if !self.is_loaded() {
            let em = try_result!(self.entity.manager());
            let def = try_result!(self.def());
            if let Some(id) = self.entity.id() {
                let loader = em.join_loader(&def.side);
                let ids = try_outcome!(loader.load(cx, id).await).unwrap_or_default();
                let meta = try_result!(em.meta(def.other));
                let loads = ids
                    .into_iter()
                    .map(|id| em.load_if_exists(cx, &meta, id));
                let found = futures::future::join_all(loads).await;
                let mut rows = em.inner.join_rows.borrow_mut();
                for outcome in found {
                    if let Some(other) = try_outcome!(outcome) {
                        rows.register_persisted(&def.side, &self.entity, &other);
                    }
                }
            }
            self.entity
                .set_relation_state(self.field, RelationState::ManyToMany(true));
        }
        Outcome::Ok(try_result!(self.get()))
    }

    pub fn add(&self, other: &EntityRef) -> Result<()> {
        self.change(other, true)
    }

    pub fn remove(&self, other: &EntityRef) -> Result<()> {
        self.change(other, false)
    }

    /// Replace the members. Fails until loaded.
    pub fn set(&self, others: &[EntityRef]) -> Result<()> {
        for current in self.get()? {
            if !others.contains(&current) {
                self.remove(&current)?;
            }
        }
        for other in others {
            self.add(other)?;
        }
        Ok(())
    }

    fn change(&self, other: &EntityRef, add: bool) -> Result<()> {
        let em = self.entity.manager()?;
        let def = self.def()?;
        if other.entity_type() != def.other {
            return Err(Error::Custom(format!(
                "{}.{} holds {}, got {}",
                self.entity.entity_type(),
                self.name(),
                def.other,
                other.entity_type()
            )));
        }
        check_writable(&self.entity, &em, self.permit)?;
        let changed = {
            let mut rows = em.inner.join_rows.borrow_mut();
            if add {
                rows.add(&def.side, &self.entity, other)
            } else {
                rows.remove(&def.side, &self.entity, other)
            }
        };
        if changed {
            tracing::trace!(
                entity = %self.entity,
                relation = self.name(),
                other = %other,
                added = add,
                "Join row changed"
            );
            em.field_changed(&self.entity, self.field);
            if let Some(inverse) = other.meta().field_id(def.other_field) {
                em.field_changed(other, inverse);
            }
        }
        Ok(())
    }

    /// Whether `other` is a member, asking the database only when neither
    /// side's rows are known.
    pub async fn includes(&self, cx: &Cx, other: &EntityRef) -> Outcome<bool, Error> {
        let em = try_result!(self.entity.manager());
        let def = try_result!(self.def());
        if let Some(row) = em.inner.join_rows.borrow().find(&def.side, &self.entity, other) {
            return Outcome::Ok(!row.deleted && !other.is_deleted());
        }
        let inverse_loaded = other
            .meta()
            .field_id(def.other_field)
            .is_some_and(|f| matches!(other.relation_state(f), Some(RelationState::ManyToMany(true))));
        if self.is_loaded() || inverse_loaded {
            return Outcome::Ok(false);
        }
        let (Some(owner_id), Some(other_id)) = (self.entity.id(), other.id()) else {
            return Outcome::Ok(false);
        };
        let pair = if def.side.owner_is_left {
            (owner_id, other_id)
        } else {
            (other_id, owner_id)
        };
        let found = try_outcome!(em.join_probe_loader(&def.side).load(cx, pair).await);
        Outcome::Ok(found.unwrap_or(false) && !other.is_deleted())
    }
}

impl Relation for ManyToMany {
    fn owner(&self) -> &EntityRef {
        &self.entity
    }

    fn field(&self) -> FieldId {
        self.field
    }

    fn is_loaded(&self) -> bool {
        matches!(
            self.entity.relation_state(self.field),
            Some(RelationState::ManyToMany(true))
        )
    }

    fn load_targets<'a>(&'a self, cx: &'a Cx) -> LocalBoxFuture<'a, Outcome<Vec<EntityRef>, Error>> {
        Box::pin(self.load(cx))
    }

    fn loaded_targets(&self) -> Vec<EntityRef> {
        let (Ok(em), Ok(def)) = (self.entity.manager(), self.def()) else {
            return Vec::new();
        };
        self.members(&em, &def.side)
    }

    /// Every known join row of the owner is deleted; the far side is not.
    fn cleanup_on_entity_deleted(&self) -> Result<()> {
        let em = self.entity.manager()?;
        let def = self.def()?;
        for other in self.members(&em, &def.side) {
            let removed = em
                .inner
                .join_rows
                .borrow_mut()
                .remove(&def.side, &self.entity, &other);
            if removed {
                if let Some(inverse) = other.meta().field_id(def.other_field) {
                    em.field_changed(&other, inverse);
                }
            }
        }
        Ok(())
    }
}
