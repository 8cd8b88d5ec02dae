//! Relation handles.
//!
//! A handle is a thin view over one relation field of one entity. Column-backed
//! relations (many-to-one, polymorphic) keep their state in the entity's slot;
//! collections keep a loaded list (one-to-many, one-to-one) or defer to the
//! entity manager's join rows (many-to-many).
//!
//! Synchronous `get` fails with [`Error::NotLoaded`] until the relation has
//! been loaded, either directly or through [`EntityManager::populate`].
//!
//! [`EntityManager::populate`]: crate::EntityManager::populate

mod many_to_many;
mod many_to_one;
mod one_to_many;
mod one_to_one;
mod polymorphic;

pub use many_to_many::ManyToMany;
pub use many_to_one::ManyToOne;
pub use one_to_many::OneToMany;
pub use one_to_one::OneToOne;
pub use polymorphic::Polymorphic;
pub(crate) use polymorphic::component_values;

use crate::entity::{EntityRef, Permit, RelationState, Slot};
use crate::field_index::IndexKey;
use crate::hint::LoadHint;
use crate::manager::EntityManager;
use crate::metadata::{FieldId, FieldKind};
use futures::future::LocalBoxFuture;
use sqlgraph_core::{Cx, Error, Outcome, Result, try_result};

/// Behavior shared by every relation kind, used by populate, cascade and
/// reactive walks.
pub trait Relation {
    fn owner(&self) -> &EntityRef;

    fn field(&self) -> FieldId;

    fn is_loaded(&self) -> bool;

    /// Load if needed; resolves to the live (non-deleted) targets.
    fn load_targets<'a>(&'a self, cx: &'a Cx) -> LocalBoxFuture<'a, Outcome<Vec<EntityRef>, Error>>;

    /// Currently loaded targets, pending-deleted ones included. Empty when
    /// not loaded.
    fn loaded_targets(&self) -> Vec<EntityRef>;

    /// Unhook the owner from its targets after the owner was deleted.
    fn cleanup_on_entity_deleted(&self) -> Result<()>;

    fn name(&self) -> &'static str {
        self.owner()
            .meta()
            .try_field(self.field())
            .map_or("<unknown>", |def| def.name)
    }

    fn not_loaded(&self) -> Error {
        Error::NotLoaded {
            entity: self.owner().to_string(),
            relation: self.name(),
        }
    }
}

/// The handle for any relation field.
pub(crate) fn handle(entity: &EntityRef, field: FieldId, permit: Permit) -> Result<Box<dyn Relation>> {
    let def = entity.meta().try_field(field)?;
    let entity = entity.clone();
    Ok(match def.kind {
        FieldKind::ManyToOne { .. } => Box::new(ManyToOne::new(entity, field, permit)),
        FieldKind::OneToMany { .. } => Box::new(OneToMany::new(entity, field, permit)),
        FieldKind::ManyToMany { .. } => Box::new(ManyToMany::new(entity, field, permit)),
        FieldKind::OneToOne { .. } => Box::new(OneToOne::new(entity, field, permit)),
        FieldKind::Polymorphic { .. } => Box::new(Polymorphic::new(entity, field, permit)),
        _ => {
            return Err(Error::Custom(format!(
                "{}.{} is not a relation",
                entity.entity_type(),
                def.name
            )));
        }
    })
}

/// Load one relation field and resolve to its live targets.
pub(crate) fn load_field<'a>(
    cx: &'a Cx,
    entity: &EntityRef,
    field: FieldId,
) -> LocalBoxFuture<'a, Outcome<Vec<EntityRef>, Error>> {
    let entity = entity.clone();
    Box::pin(async move {
        let relation = try_result!(handle(&entity, field, Permit::Engine));
        relation.load_targets(cx).await
    })
}

/// Whether every relation named by `hint` is loaded, recursively.
pub(crate) fn is_hint_loaded(entity: &EntityRef, hint: &LoadHint) -> bool {
    hint.children().all(|(name, child)| {
        let Some(field) = entity.meta().field_id(name) else {
            return false;
        };
        if !entity.meta().field(field).kind.is_relation() {
            return true;
        }
        let Ok(relation) = handle(entity, field, Permit::Engine) else {
            return false;
        };
        relation.is_loaded()
            && (child.is_empty()
                || relation
                    .loaded_targets()
                    .iter()
                    .all(|target| is_hint_loaded(target, child)))
    })
}

/// Keep `target`'s loaded inverse collection in step after `child` started
/// pointing at it.
pub(crate) fn inverse_add(target: &EntityRef, inverse: &str, child: &EntityRef) {
    let Some(field) = target.meta().field_id(inverse) else {
        return;
    };
    target.with_relation_state(field, |state| match state {
        RelationState::OneToMany(Some(list)) => {
            if !list.contains(child) {
                list.push(child.clone());
            }
        }
        RelationState::OneToOne(loaded @ Some(_)) => *loaded = Some(Some(child.clone())),
        _ => {}
    });
}

/// Counterpart of [`inverse_add`] after `child` stopped pointing at `target`.
pub(crate) fn inverse_remove(target: &EntityRef, inverse: &str, child: &EntityRef) {
    let Some(field) = target.meta().field_id(inverse) else {
        return;
    };
    target.with_relation_state(field, |state| match state {
        RelationState::OneToMany(Some(list)) => list.retain(|c| c != child),
        RelationState::OneToOne(Some(current)) if current.as_ref() == Some(child) => {
            *current = None;
        }
        _ => {}
    });
}

/// How a child type's reference field points at an owner type.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildReference {
    pub field: FieldId,
    pub column: &'static str,
    pub polymorphic: bool,
}

/// Resolve the reference on `child_type` named `other_field` that points back
/// at `owner_type`.
pub(crate) fn child_reference(
    em: &EntityManager,
    owner_type: &str,
    child_type: &str,
    other_field: &str,
) -> Result<ChildReference> {
    let child_meta = em.meta(child_type)?;
    let def = child_meta.field_by_name(other_field)?;
    match &def.kind {
        FieldKind::ManyToOne { column, .. } => Ok(ChildReference {
            field: def.id,
            column: *column,
            polymorphic: false,
        }),
        FieldKind::Polymorphic { components, .. } => components
            .iter()
            .find(|c| c.other == owner_type)
            .map(|c| ChildReference {
                field: def.id,
                column: c.column,
                polymorphic: true,
            })
            .ok_or_else(|| {
                Error::Custom(format!(
                    "{child_type}.{other_field} cannot reference {owner_type}"
                ))
            }),
        _ => Err(Error::Custom(format!(
            "{child_type}.{other_field} is not a reference"
        ))),
    }
}

/// Point `child`'s reference at `owner`, or clear it.
pub(crate) fn set_child_reference(
    child: &EntityRef,
    reference: ChildReference,
    owner: Option<&EntityRef>,
    permit: Permit,
) -> Result<()> {
    if reference.polymorphic {
        Polymorphic::new(child.clone(), reference.field, permit).set(owner)
    } else {
        ManyToOne::new(child.clone(), reference.field, permit).set(owner)
    }
}

/// Managed children of `reference`'s type whose reference currently points
/// at `owner`, found through the field index when one is built.
pub(crate) fn managed_children(
    em: &EntityManager,
    child_type: &str,
    reference: ChildReference,
    owner: &EntityRef,
) -> Vec<EntityRef> {
    let keys = IndexKey::of_target(owner, reference.polymorphic);
    let indexed = em
        .inner
        .index
        .borrow()
        .lookup(child_type, reference.field, &keys);
    let candidates: Vec<EntityRef> = match indexed {
        Some(hits) => hits.into_iter().collect(),
        None => em.entities_of(child_type),
    };
    let wanted = Slot::Entity(owner.clone());
    candidates
        .into_iter()
        .filter(|child| child.slot(reference.field).same_as(&wanted))
        .collect()
}

/// Relation handles by field id.
impl EntityRef {
    pub fn field_id(&self, name: &str) -> Result<FieldId> {
        self.meta().field_by_name(name).map(|f| f.id)
    }

    pub fn many_to_one(&self, field: FieldId) -> ManyToOne {
        ManyToOne::new(self.clone(), field, Permit::Application)
    }

    pub fn one_to_many(&self, field: FieldId) -> OneToMany {
        OneToMany::new(self.clone(), field, Permit::Application)
    }

    pub fn many_to_many(&self, field: FieldId) -> ManyToMany {
        ManyToMany::new(self.clone(), field, Permit::Application)
    }

    pub fn one_to_one(&self, field: FieldId) -> OneToOne {
        OneToOne::new(self.clone(), field, Permit::Application)
    }

    pub fn polymorphic(&self, field: FieldId) -> Polymorphic {
        Polymorphic::new(self.clone(), field, Permit::Application)
    }
}
