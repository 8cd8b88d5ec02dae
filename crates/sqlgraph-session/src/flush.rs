//! The flush pipeline.
//!
//! A flush runs through four stages:
//! - settling: cascade deletes and reactive fields run to a fixed point
//! - hooking: lifecycle hooks run for every entity with a pending
//!   operation, repeated until hooks stop producing new ones
//! - validating: field constraints and entity rules first, then reactive
//!   rules, then `afterValidation`
//! - persisting: one transaction (or the open outer one) writes entity
//!   rows in flush order, then join rows
//!
//! While a flush runs the entity manager rejects application writes; hooks
//! write through their [`HookContext`](crate::hooks::HookContext), whose
//! secret is only valid for the flush that minted it.

use crate::cascade;
use crate::entity::{DeletedState, EntityRef, Permit};
use crate::hooks::{self, FlushSecret, HookPoint};
use crate::manager::{EntityManager, FlushOptions};
use crate::metadata::{EntityMetadata, FieldKind};
use crate::reactive;
use crate::relations::component_values;
use crate::validation::{self, Validator};
use sqlgraph_core::{
    Cx, EntityTodo, Error, Outcome, Result, RowChange, ValidationErrorKind, ValidationErrors,
    try_outcome, try_result,
};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Marks the entity manager busy for the lifetime of one flush.
pub(crate) struct FlushGuard {
    em: EntityManager,
    epoch: u64,
}

impl FlushGuard {
    pub fn acquire(em: &EntityManager) -> Result<Self> {
        if em.inner.flushing.get() {
            return Err(Error::ConcurrentFlush);
        }
        let epoch = em.inner.flush_epoch.get() + 1;
        em.inner.flush_epoch.set(epoch);
        em.inner.flushing.set(true);
        Ok(Self {
            em: em.clone(),
            epoch,
        })
    }

    pub fn secret(&self) -> FlushSecret {
        FlushSecret::new(self.epoch)
    }
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        self.em.inner.flushing.set(false);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Op {
    Insert,
    Update,
    Delete,
}

fn pending_op(entity: &EntityRef) -> Option<Op> {
    let state = entity.state();
    match (state.is_new, state.deleted) {
        (true, DeletedState::None) => Some(Op::Insert),
        (false, DeletedState::None) if !state.original.is_empty() || state.touched => {
            Some(Op::Update)
        }
        (false, DeletedState::Pending) => Some(Op::Delete),
        _ => None,
    }
}

fn pending_ops(em: &EntityManager) -> Vec<(EntityRef, Op)> {
    em.entities()
        .into_iter()
        .filter_map(|e| pending_op(&e).map(|op| (e, op)))
        .collect()
}

fn with_op(ops: &[(EntityRef, Op)], wanted: &[Op]) -> Vec<EntityRef> {
    ops.iter()
        .filter(|(_, op)| wanted.contains(op))
        .map(|(e, _)| e.clone())
        .collect()
}

#[tracing::instrument(level = "info", skip_all)]
pub(crate) async fn run(
    em: &EntityManager,
    cx: &Cx,
    options: FlushOptions,
) -> Outcome<Vec<EntityRef>, Error> {
    let guard = try_result!(FlushGuard::acquire(em));
    let secret = guard.secret();

    try_outcome!(hook_loop(em, cx, secret).await);

    let rules = reactive::take_rules(em);
    if options.skip_validation {
        tracing::debug!("Skipping validation");
    } else if let Outcome::Err(e) = validate(em, cx, secret, &rules).await {
        reactive::requeue_rules(em, rules);
        return Outcome::Err(e);
    }

    let ops = pending_ops(em);
    let changed: Vec<EntityRef> = ops.iter().map(|(e, _)| e.clone()).collect();
    let join_changes = em.inner.join_rows.borrow().has_changes();
    let mut plan = try_result!(Plan::build(em, &ops));
    if plan.is_empty() && !join_changes {
        tracing::debug!(entities = changed.len(), "Nothing to write");
        finish(em, &ops, false);
        return Outcome::Ok(changed_sorted(changed));
    }

    let ambient = em.in_transaction();
    tracing::info!(
        inserts = plan.count(|t| t.inserts.len()),
        updates = plan.count(|t| t.updates.len()),
        deletes = plan.count(|t| t.deletes.len()),
        ambient,
        "Flushing"
    );
    match persist(em, cx, &mut plan, ambient).await {
        Outcome::Ok(()) => {}
        Outcome::Err(e) => {
            if !ambient {
                rollback_quietly(em, cx).await;
            }
            reactive::requeue_rules(em, rules);
            return Outcome::Err(map_constraint(em, e));
        }
        other => {
            if !ambient {
                rollback_quietly(em, cx).await;
            }
            reactive::requeue_rules(em, rules);
            return other.map(|()| Vec::new());
        }
    }

    finish(em, &ops, ambient);
    if ambient {
        em.inner
            .tx
            .borrow_mut()
            .after_commit
            .extend(changed.iter().cloned());
    } else {
        try_outcome!(hooks::run_hooks(em, cx, secret, HookPoint::AfterCommit, &changed).await);
    }
    drop(guard);
    Outcome::Ok(changed_sorted(changed))
}

fn changed_sorted(mut changed: Vec<EntityRef>) -> Vec<EntityRef> {
    changed.sort();
    changed
}

async fn settle(em: &EntityManager, cx: &Cx) -> Outcome<(), Error> {
    loop {
        try_outcome!(cascade::settle_cascades(em, cx).await);
        try_outcome!(reactive::recalc_pending(em, cx).await);
        let cascades_done = em.inner.pending_cascade.borrow().is_empty();
        if cascades_done && reactive::is_idle(em) {
            return Outcome::Ok(());
        }
    }
}

/// Settle, run hooks for operations not hooked yet, sync derived fields;
/// repeat until hooks stop producing new operations.
async fn hook_loop(em: &EntityManager, cx: &Cx, secret: FlushSecret) -> Outcome<(), Error> {
    let mut hooked: HashSet<(EntityRef, Op)> = HashSet::new();
    let mut pass = 0usize;
    loop {
        try_outcome!(settle(em, cx).await);
        let fresh: Vec<(EntityRef, Op)> = pending_ops(em)
            .into_iter()
            .filter(|p| !hooked.contains(p))
            .collect();
        if fresh.is_empty() {
            return Outcome::Ok(());
        }
        pass += 1;
        tracing::debug!(pass, entities = fresh.len(), "Running flush hooks");

        let creates = with_op(&fresh, &[Op::Insert]);
        let updates = with_op(&fresh, &[Op::Update]);
        hooked.extend(fresh.iter().filter(|(_, op)| *op != Op::Delete).cloned());
        try_outcome!(hooks::run_hooks(em, cx, secret, HookPoint::BeforeCreate, &creates).await);
        try_outcome!(hooks::run_hooks(em, cx, secret, HookPoint::BeforeUpdate, &updates).await);
        let writes = with_op(&fresh, &[Op::Insert, Op::Update]);
        try_outcome!(hooks::run_hooks(em, cx, secret, HookPoint::BeforeFlush, &writes).await);

        // Hooks above may have deleted more entities.
        let deletes: Vec<EntityRef> = pending_ops(em)
            .into_iter()
            .filter(|p| p.1 == Op::Delete && hooked.insert(p.clone()))
            .map(|(e, _)| e)
            .collect();
        try_outcome!(hooks::run_hooks(em, cx, secret, HookPoint::BeforeDelete, &deletes).await);

        try_result!(sync_derived_fields(em));
    }
}

/// Evaluate synchronous derived fields of every entity being written.
fn sync_derived_fields(em: &EntityManager) -> Result<()> {
    for (entity, op) in pending_ops(em) {
        if op == Op::Delete {
            continue;
        }
        for derived in &entity.meta().derived_fields {
            let value = (derived.compute)(&entity)?;
            entity.set_with(derived.field, value, Permit::Engine)?;
        }
    }
    Ok(())
}

async fn validate(
    em: &EntityManager,
    cx: &Cx,
    secret: FlushSecret,
    rules: &[(EntityRef, usize)],
) -> Outcome<(), Error> {
    let writes = with_op(&pending_ops(em), &[Op::Insert, Op::Update]);

    // Static constraints first so reactive rules never see invalid rows.
    let errors = try_result!(Validator::default().validate(&writes));
    if !errors.is_empty() {
        tracing::debug!(errors = errors.len(), "Validation failed");
        return Outcome::Err(Error::Validation(errors));
    }
    let errors = try_outcome!(validation::run_reactive_rules(em, cx, rules).await);
    if !errors.is_empty() {
        tracing::debug!(errors = errors.len(), "Reactive validation failed");
        return Outcome::Err(Error::Validation(errors));
    }
    hooks::run_hooks(em, cx, secret, HookPoint::AfterValidation, &writes).await
}

/// Per-type todos plus the inserted entities behind each todo's insert rows.
struct Plan {
    todos: Vec<EntityTodo>,
    inserted: Vec<Vec<EntityRef>>,
}

impl Plan {
    fn build(em: &EntityManager, ops: &[(EntityRef, Op)]) -> Result<Self> {
        let mut plan = Plan {
            todos: Vec::new(),
            inserted: Vec::new(),
        };
        let mut positions: HashMap<&'static str, usize> = HashMap::new();
        for (entity, op) in ops {
            let meta = entity.meta();
            let index = *positions.entry(meta.name).or_insert_with(|| {
                plan.todos.push(EntityTodo::new(
                    meta.name,
                    meta.table,
                    meta.pk_column(),
                    meta.flush_order,
                ));
                plan.inserted.push(Vec::new());
                plan.todos.len() - 1
            });
            let todo = &mut plan.todos[index];
            match op {
                // Columns are filled once ids are assigned.
                Op::Insert => {
                    todo.inserts.push(RowChange::new(entity.id()));
                    plan.inserted[index].push(entity.clone());
                }
                Op::Update => {
                    let change = row_change(em, entity, true)?;
                    if !change.columns.is_empty() {
                        todo.updates.push(change);
                    }
                }
                Op::Delete => {
                    if let Some(id) = entity.id() {
                        todo.deletes.push(id);
                    }
                }
            }
        }

        let mut pairs: Vec<(EntityTodo, Vec<EntityRef>)> =
            plan.todos.into_iter().zip(plan.inserted).collect();
        pairs.sort_by_key(|(todo, _)| (todo.flush_order, todo.entity));
        let (todos, inserted) = pairs.into_iter().unzip();
        Ok(Plan { todos, inserted })
    }

    fn is_empty(&self) -> bool {
        self.todos.iter().all(EntityTodo::is_empty)
    }

    fn count(&self, f: impl Fn(&EntityTodo) -> usize) -> usize {
        self.todos.iter().map(f).sum()
    }

    /// Copy driver-assigned ids onto the new entities, then fill their columns.
    fn complete_inserts(&mut self, em: &EntityManager) -> Result<()> {
        for (todo, entities) in self.todos.iter_mut().zip(&self.inserted) {
            for (row, entity) in todo.inserts.iter_mut().zip(entities) {
                if entity.id().is_none() {
                    let id = row.id.clone().ok_or_else(|| {
                        Error::Custom(format!("driver assigned no id to {entity}"))
                    })?;
                    entity.assign_id(id);
                    em.inner.identity.borrow_mut().index_id(entity)?;
                }
            }
        }
        // Second pass: references to other new entities now have ids.
        for (todo, entities) in self.todos.iter_mut().zip(&self.inserted) {
            for (row, entity) in todo.inserts.iter_mut().zip(entities) {
                *row = row_change(em, entity, false)?;
            }
        }
        Ok(())
    }
}

/// Column values of `entity`; with `changed_only`, just the fields changed
/// since the last flush.
fn row_change(em: &EntityManager, entity: &EntityRef, changed_only: bool) -> Result<RowChange> {
    let meta: &EntityMetadata = entity.meta();
    let changed: BTreeSet<_> = entity.state().original.keys().copied().collect();
    let mut change = RowChange::new(entity.id());
    for field in &meta.fields {
        if changed_only && !changed.contains(&field.id) {
            continue;
        }
        let slot = entity.slot(field.id);
        match &field.kind {
            FieldKind::Primitive { column, serde, .. } => {
                change.push(*column, serde.to_column(&entity.slot_value(field.id))?);
            }
            FieldKind::Enum { column, .. } => change.push(*column, entity.slot_value(field.id)),
            FieldKind::ManyToOne { column, .. } => change.push(*column, slot.reference_value()),
            FieldKind::Polymorphic { components, .. } => {
                for (column, value) in component_values(em, components, &slot) {
                    change.push(column, value);
                }
            }
            _ => {}
        }
    }
    Ok(change)
}

async fn persist(
    em: &EntityManager,
    cx: &Cx,
    plan: &mut Plan,
    ambient: bool,
) -> Outcome<(), Error> {
    let driver = std::rc::Rc::clone(em.driver());
    if !ambient {
        try_outcome!(driver.begin(cx, em.config().flush_isolation).await);
    }
    if plan.todos.iter().any(|t| t.missing_ids() > 0) {
        try_outcome!(driver.assign_new_ids(cx, &mut plan.todos).await);
    }
    try_result!(plan.complete_inserts(em));

    let todos: Vec<EntityTodo> = plan.todos.iter().filter(|t| !t.is_empty()).cloned().collect();
    if !todos.is_empty() {
        try_outcome!(driver.flush_entities(cx, &todos).await);
    }
    let join_todos = try_result!(em.inner.join_rows.borrow().todos());
    if !join_todos.is_empty() {
        try_outcome!(driver.flush_join_tables(cx, &join_todos).await);
    }
    if !ambient {
        try_outcome!(driver.commit(cx).await);
    }
    Outcome::Ok(())
}

async fn rollback_quietly(em: &EntityManager, cx: &Cx) {
    if let Outcome::Err(e) = em.driver().rollback(cx).await {
        tracing::warn!(error = %e, "Rollback after failed flush failed");
    }
}

/// Reset bookkeeping of everything this flush wrote and drop per-request caches.
fn finish(em: &EntityManager, ops: &[(EntityRef, Op)], ambient: bool) {
    let mut evicted = HashSet::new();
    let mut flushed_deletes = Vec::new();
    if ambient {
        let mut tx = em.inner.tx.borrow_mut();
        for (entity, op) in ops {
            if !matches!(op, Op::Delete) {
                tx.record_write(entity);
            }
        }
    }
    for (entity, op) in ops {
        let mut state = entity.state_mut();
        state.original.clear();
        state.touched = false;
        match op {
            Op::Insert => state.is_new = false,
            Op::Update => {}
            Op::Delete if ambient => {
                state.deleted = DeletedState::Flushed;
                flushed_deletes.push(entity.clone());
            }
            Op::Delete => {
                state.deleted = DeletedState::Deleted;
                evicted.insert(entity.clone());
            }
        }
    }
    // Created and deleted before ever reaching the database.
    for entity in em.entities() {
        if entity.is_new() && entity.is_deleted() {
            entity.state_mut().deleted = DeletedState::Deleted;
            evicted.insert(entity);
        }
    }
    em.inner
        .tx
        .borrow_mut()
        .flushed_deletes
        .extend(flushed_deletes);
    em.evict(&evicted);
    let settled = em.inner.join_rows.borrow_mut().compact();
    if ambient {
        em.inner.tx.borrow_mut().flushed_join_rows.extend(settled);
    }
    em.inner.pending_cascade.borrow_mut().clear();
    em.clear_loaders();
    reactive::clear(em);
}

/// A violated constraint with a configured message becomes a validation error.
fn map_constraint(em: &EntityManager, error: Error) -> Error {
    let Some(name) = error.constraint().map(str::to_string) else {
        return error;
    };
    let Some(message) = em.config().constraint_messages.get(&name) else {
        tracing::debug!(constraint = %name, "Unmapped constraint violation");
        return error;
    };
    let mut errors = ValidationErrors::new();
    errors.add(name, None, ValidationErrorKind::Constraint, message.clone());
    Error::Validation(errors)
}
