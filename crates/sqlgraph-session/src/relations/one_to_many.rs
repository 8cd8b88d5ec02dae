use super::{ChildReference, Relation, child_reference, managed_children, set_child_reference};
use crate::entity::{EntityRef, Permit, RelationState, Slot};
use crate::manager::EntityManager;
use crate::metadata::{FieldId, FieldKind};
use futures::future::LocalBoxFuture;
use sqlgraph_core::{Cx, Error, Outcome, Result, Row, try_outcome, try_result};

/// Children whose foreign key points at the owner.
pub struct OneToMany {
    entity: EntityRef,
    field: FieldId,
    permit: Permit,
}

impl OneToMany {
    pub(crate) fn new(entity: EntityRef, field: FieldId, permit: Permit) -> Self {
        Self {
            entity,
            field,
            permit,
        }
    }

    fn target_def(&self) -> Result<(&'static str, &'static str)> {
        let def = self.entity.meta().try_field(self.field)?;
        match &def.kind {
            FieldKind::OneToMany { other, other_field } => Ok((*other, *other_field)),
            _ => Err(Error::Custom(format!(
                "{}.{} is not a one-to-many",
                self.entity.entity_type(),
                def.name
            ))),
        }
    }

    fn reference(&self, em: &EntityManager) -> Result<(&'static str, ChildReference)> {
        let (other, other_field) = self.target_def()?;
        let reference = child_reference(em, self.entity.entity_type(), other, other_field)?;
        Ok((other, reference))
    }

    fn loaded(&self) -> Option<Vec<EntityRef>> {
        match self.entity.relation_state(self.field) {
            Some(RelationState::OneToMany(list)) => list,
            _ => None,
        }
    }

    /// Live children. Fails until loaded.
    pub fn get(&self) -> Result<Vec<EntityRef>> {
        Ok(self
            .get_with_deleted()?
            .into_iter()
            .filter(|c| !c.is_deleted())
            .collect())
    }

    pub fn get_with_deleted(&self) -> Result<Vec<EntityRef>> {
        self.loaded().ok_or_else(|| self.not_loaded())
    }

    pub async fn load(&self, cx: &Cx) -> Outcome<Vec<EntityRef>, Error> {
        if self.loaded().is_none() {
            let em = try_result!(self.entity.manager());
            let (other, reference) = try_result!(self.reference(&em));
            let children =
                try_outcome!(fetch_children(cx, &em, &self.entity, other, reference).await);
            self.entity
                .set_relation_state(self.field, RelationState::OneToMany(Some(children)));
        }
        Outcome::Ok(try_result!(self.get()))
    }

    /// Point `child` at the owner.
    pub fn add(&self, child: &EntityRef) -> Result<()> {
        let em = self.entity.manager()?;
        let (other, reference) = self.reference(&em)?;
        if child.entity_type() != other {
            return Err(Error::Custom(format!(
                "{}.{} holds {}, got {}",
                self.entity.entity_type(),
                self.name(),
                other,
                child.entity_type()
            )));
        }
        set_child_reference(child, reference, Some(&self.entity), self.permit)
    }

    /// Clear `child`'s reference if it points at the owner.
    pub fn remove(&self, child: &EntityRef) -> Result<()> {
        let em = self.entity.manager()?;
        let (_, reference) = self.reference(&em)?;
        if child
            .slot(reference.field)
            .same_as(&Slot::Entity(self.entity.clone()))
        {
            set_child_reference(child, reference, None, self.permit)?;
        }
        Ok(())
    }

    /// Replace the children. Fails until loaded.
    pub fn set(&self, children: &[EntityRef]) -> Result<()> {
        for current in self.get()? {
            if !children.contains(&current) {
                self.remove(&current)?;
            }
        }
        for child in children {
            self.add(child)?;
        }
        Ok(())
    }

    /// Membership without I/O: the loaded list when present, else the
    /// child's own reference.
    pub fn includes(&self, child: &EntityRef) -> Result<bool> {
        if child.is_deleted() {
            return Ok(false);
        }
        if let Some(list) = self.loaded() {
            return Ok(list.contains(child));
        }
        let em = self.entity.manager()?;
        let (_, reference) = self.reference(&em)?;
        Ok(child
            .slot(reference.field)
            .same_as(&Slot::Entity(self.entity.clone())))
    }
}

/// Stored children still pointing at `owner`, plus managed children that
/// were pointed at it in memory. Shared with one-to-one.
pub(crate) async fn fetch_children(
    cx: &Cx,
    em: &EntityManager,
    owner: &EntityRef,
    child_type: &'static str,
    reference: ChildReference,
) -> Outcome<Vec<EntityRef>, Error> {
    let child_meta = try_result!(em.meta(child_type));
    let mut children = Vec::new();
    if let Some(id) = owner.id() {
        let loader = em.children_loader(&child_meta, reference.column);
        let rows: Vec<Row> = try_outcome!(loader.load(cx, id).await).unwrap_or_default();
        for row in &rows {
            children.push(try_result!(em.hydrate(&child_meta, row)));
        }
    }
    let wanted = Slot::Entity(owner.clone());
    children.retain(|child| child.slot(reference.field).same_as(&wanted));
    for child in managed_children(em, child_type, reference, owner) {
        if !children.contains(&child) {
            children.push(child);
        }
    }
    for child in &children {
        child.resolve_slot(reference.field, owner);
    }
    Outcome::Ok(children)
}

impl Relation for OneToMany {
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
        Box::pin(self.load(cx))
    }

    fn loaded_targets(&self) -> Vec<EntityRef> {
        self.loaded().unwrap_or_default()
    }

    /// Optional references of loaded children are cleared; required ones are
    /// left for the database (or a cascade) to reject.
    fn cleanup_on_entity_deleted(&self) -> Result<()> {
        let em = self.entity.manager()?;
        let (_, reference) = self.reference(&em)?;
        let required = em
            .meta(self.target_def()?.0)?
            .field(reference.field)
            .is_required();
        if required {
            return Ok(());
        }
        for child in self.loaded_targets() {
            if child.is_deleted() {
                continue;
            }
            set_child_reference(&child, reference, None, Permit::Engine)?;
        }
        Ok(())
    }
}
