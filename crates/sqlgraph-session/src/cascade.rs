//! Delete bookkeeping and cascades.
//!
//! `delete()` is synchronous: it cascades through whatever is already loaded
//! and unhooks the entity from loaded relations. Relations that were not
//! loaded yet are handled at flush time by [`settle_cascades`], which loads
//! them for every pending delete and repeats until no new delete appears.

use crate::entity::{DeletedState, EntityRef, Permit};
use crate::manager::EntityManager;
use crate::metadata::FieldKind;
use crate::reactive;
use crate::relations;
use sqlgraph_core::{Cx, Error, Outcome, Result, try_outcome, try_result};
use std::sync::Arc;

pub(crate) fn delete_entity(em: &EntityManager, entity: &EntityRef, permit: Permit) -> Result<()> {
    em.check_flush_gate(entity, permit)?;
    if entity.is_deleted() {
        return Ok(());
    }
    entity.state_mut().deleted = DeletedState::Pending;
    tracing::debug!(entity = %entity, "Entity marked for deletion");
    reactive::entity_deleted(em, entity);
    em.inner.pending_cascade.borrow_mut().push(entity.clone());
    unhook(em, entity)
}

/// Cascade into loaded `cascade_delete` relations and detach from the rest.
fn unhook(em: &EntityManager, entity: &EntityRef) -> Result<()> {
    let meta = Arc::clone(entity.meta());
    let mut cascaded = Vec::new();
    for field in meta.relations() {
        let relation = relations::handle(entity, field.id, Permit::Engine)?;
        // Join rows go away with either side; the far side itself stays.
        let joins_only = matches!(field.kind, FieldKind::ManyToMany { .. });
        if field.cascade_delete && !joins_only {
            cascaded.extend(relation.loaded_targets());
        } else {
            relation.cleanup_on_entity_deleted()?;
        }
    }
    for target in cascaded {
        if !target.is_deleted() {
            tracing::debug!(from = %entity, to = %target, "Cascading delete");
            delete_entity(em, &target, Permit::Engine)?;
        }
    }
    Ok(())
}

/// Load the relations of pending deletes that `delete()` could not see and
/// cascade through them, to a fixed point.
pub(crate) async fn settle_cascades(em: &EntityManager, cx: &Cx) -> Outcome<(), Error> {
    loop {
        let pending: Vec<EntityRef> = std::mem::take(&mut *em.inner.pending_cascade.borrow_mut())
            .into_iter()
            .filter(|e| !e.state().cascade_done)
            .collect();
        if pending.is_empty() {
            return Outcome::Ok(());
        }
        tracing::debug!(entities = pending.len(), "Loading relations of deleted entities");

        let mut loads = Vec::new();
        for entity in &pending {
            for field in entity.meta().relations() {
                if field.kind.is_collection_like() || field.cascade_delete {
                    loads.push(relations::load_field(cx, entity, field.id));
                }
            }
        }
        for outcome in futures::future::join_all(loads).await {
            try_outcome!(outcome);
        }

        for entity in &pending {
            entity.state_mut().cascade_done = true;
            try_result!(unhook(em, entity));
        }
    }
}
