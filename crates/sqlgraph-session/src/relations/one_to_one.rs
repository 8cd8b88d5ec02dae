use super::one_to_many::fetch_children;
use super::{ChildReference, Relation, child_reference, set_child_reference};
use crate::entity::{EntityRef, Permit, RelationState};
use crate::manager::EntityManager;
use crate::metadata::{FieldId, FieldKind};
use futures::future::LocalBoxFuture;
use sqlgraph_core::{Cx, Error, Outcome, Result, try_outcome, try_result};

/// The single child whose foreign key points at the owner.
pub struct OneToOne {
    entity: EntityRef,
    field: FieldId,
    permit: Permit,
}

impl OneToOne {
    pub(crate) fn new(entity: EntityRef, field: FieldId, permit: Permit) -> Self {
        Self {
            entity,
            field,
            permit,
        }
    }

    fn reference(&self, em: &EntityManager) -> Result<(&'static str, ChildReference)> {
        let def = self.entity.meta().try_field(self.field)?;
        let FieldKind::OneToOne { other, other_field } = &def.kind else {
            return Err(Error::Custom(format!(
                "{}.{} is not a one-to-one",
                self.entity.entity_type(),
                def.name
            )));
        };
        let reference = child_reference(em, self.entity.entity_type(), other, other_field)?;
        Ok((*other, reference))
    }

    fn loaded(&self) -> Option<Option<EntityRef>> {
        match self.entity.relation_state(self.field) {
            Some(RelationState::OneToOne(state)) => state,
            _ => None,
        }
    }

    pub fn get(&self) -> Result<Option<EntityRef>> {
        Ok(self.get_with_deleted()?.filter(|c| !c.is_deleted()))
    }

    pub fn get_with_deleted(&self) -> Result<Option<EntityRef>> {
        self.loaded().ok_or_else(|| self.not_loaded())
    }

    pub async fn load(&self, cx: &Cx) -> Outcome<Option<EntityRef>, Error> {
        if self.loaded().is_none() {
            let em = try_result!(self.entity.manager());
            let (other, reference) = try_result!(self.reference(&em));
            let children =
                try_outcome!(fetch_children(cx, &em, &self.entity, other, reference).await);
            if children.len() > 1 {
                tracing::warn!(
                    entity = %self.entity,
                    relation = self.name(),
                    count = children.len(),
                    "One-to-one matched several rows; using the first"
                );
            }
            let first = children.into_iter().next();
            self.entity
                .set_relation_state(self.field, RelationState::OneToOne(Some(first)));
        }
        Outcome::Ok(try_result!(self.get()))
    }

    /// Point `child` at the owner, detaching the previous child. Fails until loaded.
    pub fn set(&self, child: Option<&EntityRef>) -> Result<()> {
        let current = self.get()?;
        if current.as_ref() == child {
            return Ok(());
        }
        let em = self.entity.manager()?;
        let (other, reference) = self.reference(&em)?;
        if let Some(child) = child {
            if child.entity_type() != other {
                return Err(Error::Custom(format!(
                    "{}.{} holds {}, got {}",
                    self.entity.entity_type(),
                    self.name(),
                    other,
                    child.entity_type()
                )));
            }
        }
        if let Some(previous) = &current {
            set_child_reference(previous, reference, None, self.permit)?;
        }
        if let Some(child) = child {
            set_child_reference(child, reference, Some(&self.entity), self.permit)?;
        }
        Ok(())
    }
}

impl Relation for OneToOne {
    fn owner(&self) -> &EntityRef {
        &self.entity
    }

    fn field(&self) -> FieldId {
        self.field
    }

    fn is_loaded(&self) -> bool {
        self.loaded().is_some()
    }

    fn load_targets<'a>(&'a self, cx: &'a Cx) -> LocalBoxFuture<'a, Outcome<Vec<EntityRef>, Error>> {
        Box::pin(async move { self.load(cx).await.map(|c| c.into_iter().collect()) })
    }

    fn loaded_targets(&self) -> Vec<EntityRef> {
        self.loaded().flatten().into_iter().collect()
    }

    fn cleanup_on_entity_deleted(&self) -> Result<()> {
        let Some(child) = self.loaded().flatten() else {
            return Ok(());
        };
        let em = self.entity.manager()?;
        let (other, reference) = self.reference(&em)?;
        if child.is_deleted() || em.meta(other)?.field(reference.field).is_required() {
            return Ok(());
        }
        set_child_reference(&child, reference, None, Permit::Engine)
    }
}
