//! Reactive recalculation.
//!
//! A write to a field that some reactive field or rule depends on enqueues
//! the registry's reverse walks for that field. Draining the queue follows
//! each walk from the changed entity back to its owners, loading what it
//! needs, then recomputes owner fields and collects owner rules for the
//! next validation pass. Recomputed values are written through the normal
//! write path, so fields that depend on other reactive fields are enqueued
//! in turn; the registry rejects cycles up front, so draining terminates.
//!
//! References are walked through both their current and their original
//! target, so moving a child between parents recalculates both parents.

use crate::entity::{EntityRef, Permit, Slot};
use crate::manager::EntityManager;
use crate::metadata::{FieldId, FieldKind};
use crate::registry::{ReactiveKind, ReactiveTarget};
use crate::relations::{self, is_hint_loaded};
use futures::future::LocalBoxFuture;
use sqlgraph_core::{Cx, Error, IdValue, Outcome, Result, Value, try_outcome, try_result};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

type Walk = (EntityRef, Arc<ReactiveTarget>);

#[derive(Default)]
pub(crate) struct ReactiveQueue {
    walks: Vec<Walk>,
    walk_keys: HashSet<(EntityRef, usize)>,
    direct: Vec<(EntityRef, ReactiveKind)>,
    direct_keys: HashSet<(EntityRef, ReactiveKind)>,
    /// Owner rules whose inputs changed since the last validation.
    rules: BTreeSet<(EntityRef, usize)>,
}

impl ReactiveQueue {
    fn push_walk(&mut self, entity: &EntityRef, target: &Arc<ReactiveTarget>) {
        let key = (entity.clone(), Arc::as_ptr(target) as usize);
        if self.walk_keys.insert(key) {
            self.walks.push((entity.clone(), Arc::clone(target)));
        }
    }

    fn push_direct(&mut self, entity: &EntityRef, kind: ReactiveKind) {
        if self.direct_keys.insert((entity.clone(), kind)) {
            self.direct.push((entity.clone(), kind));
        }
    }

    fn take_work(&mut self) -> (Vec<Walk>, Vec<(EntityRef, ReactiveKind)>) {
        self.walk_keys.clear();
        self.direct_keys.clear();
        (
            std::mem::take(&mut self.walks),
            std::mem::take(&mut self.direct),
        )
    }

    pub fn is_idle(&self) -> bool {
        self.walks.is_empty() && self.direct.is_empty()
    }
}

pub(crate) fn on_field_changed(em: &EntityManager, entity: &EntityRef, field: FieldId) {
    let registry = Arc::clone(em.registry());
    let targets = registry.reactive_targets(entity.entity_type(), field);
    if targets.is_empty() {
        return;
    }
    let mut queue = em.inner.reactive.borrow_mut();
    for target in targets {
        queue.push_walk(entity, target);
    }
}

/// A new entity computes every reactive field and checks every reactive rule.
pub(crate) fn entity_created(em: &EntityManager, entity: &EntityRef) {
    enqueue_own(em, entity);
}

pub(crate) fn entity_touched(em: &EntityManager, entity: &EntityRef) {
    enqueue_own(em, entity);
}

fn enqueue_own(em: &EntityManager, entity: &EntityRef) {
    let meta = entity.meta();
    if meta.reactive_fields.is_empty() && meta.reactive_rules.is_empty() {
        return;
    }
    let mut queue = em.inner.reactive.borrow_mut();
    for reactive in &meta.reactive_fields {
        queue.push_direct(entity, ReactiveKind::Field(reactive.field));
    }
    for index in 0..meta.reactive_rules.len() {
        queue.push_direct(entity, ReactiveKind::Rule(index));
    }
}

/// A deleted entity drops out of every collection it fed.
pub(crate) fn entity_deleted(em: &EntityManager, entity: &EntityRef) {
    for field in em.registry().reactive_sources(entity.entity_type()) {
        on_field_changed(em, entity, field);
    }
}

pub(crate) fn is_idle(em: &EntityManager) -> bool {
    em.inner.reactive.borrow().is_idle()
}

/// Rules collected since the last call.
pub(crate) fn take_rules(em: &EntityManager) -> Vec<(EntityRef, usize)> {
    std::mem::take(&mut em.inner.reactive.borrow_mut().rules)
        .into_iter()
        .collect()
}

/// Put back rules taken by a flush that did not commit.
pub(crate) fn requeue_rules(em: &EntityManager, rules: Vec<(EntityRef, usize)>) {
    em.inner.reactive.borrow_mut().rules.extend(rules);
}

pub(crate) fn clear(em: &EntityManager) {
    *em.inner.reactive.borrow_mut() = ReactiveQueue::default();
}

/// Drain the queue until no walk or recalculation is pending.
pub(crate) async fn recalc_pending(em: &EntityManager, cx: &Cx) -> Outcome<(), Error> {
    let mut rounds = 0usize;
    loop {
        let (walks, direct) = em.inner.reactive.borrow_mut().take_work();
        if walks.is_empty() && direct.is_empty() {
            return Outcome::Ok(());
        }
        rounds += 1;
        tracing::debug!(
            round = rounds,
            walks = walks.len(),
            direct = direct.len(),
            "Recalculating reactive fields"
        );

        let mut owners: Vec<(EntityRef, ReactiveKind)> = direct;
        let walked =
            futures::future::join_all(walks.iter().map(|(entity, target)| walk(cx, entity, target)))
                .await;
        for ((_, target), outcome) in walks.iter().zip(walked) {
            for owner in try_outcome!(outcome) {
                owners.push((owner, target.kind));
            }
        }

        let mut seen = HashSet::new();
        let mut fields = Vec::new();
        for (owner, kind) in owners {
            if !seen.insert((owner.clone(), kind)) {
                continue;
            }
            if owner.is_deleted() {
                tracing::debug!(entity = %owner, "Skipping reactive owner pending deletion");
                continue;
            }
            match kind {
                ReactiveKind::Field(field) => fields.push((owner, field)),
                ReactiveKind::Rule(index) => {
                    em.inner.reactive.borrow_mut().rules.insert((owner, index));
                }
            }
        }

        let recomputes = fields
            .iter()
            .map(|(owner, field)| recompute_field(em, cx, owner, *field));
        for outcome in futures::future::join_all(recomputes).await {
            try_outcome!(outcome);
        }
    }
}

/// Owners reached by following `target.path` from `entity`.
async fn walk(
    cx: &Cx,
    entity: &EntityRef,
    target: &ReactiveTarget,
) -> Outcome<Vec<EntityRef>, Error> {
    let mut current = vec![entity.clone()];
    for step in &target.path {
        let steps = current
            .iter()
            .filter(|e| e.entity_type() == step.entity)
            .map(|e| step_targets(cx, e, step.field));
        let mut next = BTreeSet::new();
        for outcome in futures::future::join_all(steps).await {
            next.extend(try_outcome!(outcome));
        }
        current = next.into_iter().collect();
        if current.is_empty() {
            break;
        }
    }
    Outcome::Ok(current)
}

fn step_targets<'a>(
    cx: &'a Cx,
    entity: &EntityRef,
    field: FieldId,
) -> LocalBoxFuture<'a, Outcome<Vec<EntityRef>, Error>> {
    let entity = entity.clone();
    Box::pin(async move {
        let mut targets = try_outcome!(relations::load_field(cx, &entity, field).await);
        if let Some(original) = try_outcome!(original_target(cx, &entity, field).await) {
            targets.push(original);
        }
        Outcome::Ok(targets)
    })
}

/// The target a reference pointed at before its first change since the last flush.
async fn original_target(
    cx: &Cx,
    entity: &EntityRef,
    field: FieldId,
) -> Outcome<Option<EntityRef>, Error> {
    let value = match entity.original_slot(field) {
        None => return Outcome::Ok(None),
        Some(Slot::Entity(target)) => return Outcome::Ok(Some(target)),
        Some(Slot::Value(Value::Null)) => return Outcome::Ok(None),
        Some(Slot::Value(value)) => value,
    };
    let em = try_result!(entity.manager());
    let meta = match &entity.meta().field(field).kind {
        FieldKind::ManyToOne { other, .. } => try_result!(em.meta(other)),
        FieldKind::Polymorphic { .. } => {
            let tag = value.as_str().and_then(|text| text.split_once(':')).map(|(t, _)| t);
            match tag.and_then(|t| em.registry().by_tag(t)) {
                Some(meta) => Arc::clone(meta),
                None => return Outcome::Ok(None),
            }
        }
        _ => return Outcome::Ok(None),
    };
    let id = match value.as_str() {
        Some(text) => IdValue::parse_tagged(text, meta.tag),
        None => IdValue::from_value(&value),
    };
    let Some(id) = id else {
        return Outcome::Ok(None);
    };
    em.load_if_exists(cx, &meta, id).await
}

async fn recompute_field(
    em: &EntityManager,
    cx: &Cx,
    owner: &EntityRef,
    field: FieldId,
) -> Outcome<(), Error> {
    let Some(reactive) = owner.meta().reactive_field(field).cloned() else {
        return Outcome::Ok(());
    };
    try_outcome!(em.populate(cx, std::slice::from_ref(owner), reactive.hint.clone()).await);
    match (reactive.compute)(owner) {
        Ok(value) => {
            try_result!(owner.set_with(field, value, Permit::Engine));
            Outcome::Ok(())
        }
        Err(Error::NotLoaded { entity, relation }) => {
            tracing::warn!(
                owner = %owner,
                field = owner.meta().field(field).name,
                entity = %entity,
                relation,
                "Reactive field read a relation outside its load hint"
            );
            Outcome::Ok(())
        }
        Err(e) => Outcome::Err(e),
    }
}

/// Read-time recalculation: when everything the field depends on is
/// already loaded, recompute it and store the result.
pub(crate) fn read_reactive(entity: &EntityRef, field: FieldId) -> Result<Option<Value>> {
    let Some(reactive) = entity.meta().reactive_field(field) else {
        return Ok(None);
    };
    if entity.is_deleted() || !is_hint_loaded(entity, &reactive.hint) {
        return Ok(None);
    }
    let value = match (reactive.compute)(entity) {
        Ok(value) => value,
        Err(Error::NotLoaded { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    entity.set_with(field, value.clone(), Permit::Engine)?;
    Ok(Some(value))
}

impl EntityRef {
    /// Evaluate a computed (non-persisted) property, loading its hint first.
    pub async fn computed(&self, cx: &Cx, name: &str) -> Outcome<Value, Error> {
        let Some(property) = self.meta().computed.iter().find(|c| c.name == name).cloned() else {
            return Outcome::Err(Error::Custom(format!(
                "{} has no computed property '{}'",
                self.entity_type(),
                name
            )));
        };
        let em = try_result!(self.manager());
        try_outcome!(em.populate(cx, std::slice::from_ref(self), property.hint.clone()).await);
        Outcome::Ok(try_result!((property.compute)(self)))
    }

    /// Evaluate a computed property from what is already loaded.
    pub fn computed_now(&self, name: &str) -> Result<Value> {
        let property = self
            .meta()
            .computed
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                Error::Custom(format!(
                    "{} has no computed property '{}'",
                    self.entity_type(),
                    name
                ))
            })?;
        (property.compute)(self)
    }
}
