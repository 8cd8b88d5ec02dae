//! Lifecycle hooks and the flush-secret capability.
//!
//! While a flush runs, ordinary writes are rejected. Hooks receive a
//! [`HookContext`] carrying a [`FlushSecret`] minted for that flush; writes made
//! through the context are the only application writes accepted until the
//! flush finishes. A secret from an earlier flush is rejected.
//!
//! Hooks registered for one lifecycle point run concurrently. All of them are
//! allowed to finish before the first failure is reported.

use crate::entity::{EntityRef, Permit};
use crate::manager::EntityManager;
use crate::metadata::FieldId;
use crate::relations::{ManyToMany, ManyToOne, OneToMany, OneToOne, Polymorphic};
use futures::future::LocalBoxFuture;
use sqlgraph_core::{Cx, Error, Outcome, Result, Value};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeCreate,
    BeforeUpdate,
    BeforeDelete,
    BeforeFlush,
    AfterValidation,
    AfterCommit,
}

impl HookPoint {
    pub const fn name(self) -> &'static str {
        match self {
            HookPoint::BeforeCreate => "beforeCreate",
            HookPoint::BeforeUpdate => "beforeUpdate",
            HookPoint::BeforeDelete => "beforeDelete",
            HookPoint::BeforeFlush => "beforeFlush",
            HookPoint::AfterValidation => "afterValidation",
            HookPoint::AfterCommit => "afterCommit",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Permission to write while the flush that minted it is running.
///
/// Only the flush pipeline can construct one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSecret {
    epoch: u64,
}

impl FlushSecret {
    pub(crate) fn new(epoch: u64) -> Self {
        Self { epoch }
    }

    pub(crate) fn epoch(self) -> u64 {
        self.epoch
    }
}

pub type SyncHookFn = Arc<dyn Fn(&EntityRef, &HookContext<'_>) -> Result<()> + Send + Sync>;

/// A hook that needs to await, e.g. to load relations before deciding.
pub trait AsyncHook: Send + Sync {
    fn call<'a>(
        &'a self,
        entity: &'a EntityRef,
        ctx: &'a HookContext<'a>,
    ) -> LocalBoxFuture<'a, Result<()>>;
}

#[derive(Clone)]
pub enum Hook {
    Sync(SyncHookFn),
    Async(Arc<dyn AsyncHook>),
}

/// What a hook may use while the flush is running.
pub struct HookContext<'a> {
    em: &'a EntityManager,
    cx: &'a Cx,
    secret: FlushSecret,
}

impl<'a> HookContext<'a> {
    pub(crate) fn new(em: &'a EntityManager, cx: &'a Cx, secret: FlushSecret) -> Self {
        Self { em, cx, secret }
    }

    pub fn em(&self) -> &'a EntityManager {
        self.em
    }

    pub fn cx(&self) -> &'a Cx {
        self.cx
    }

    pub fn secret(&self) -> FlushSecret {
        self.secret
    }

    fn permit(&self) -> Permit {
        Permit::Hook(self.secret)
    }

    /// Write a primitive field from inside the flush.
    pub fn set(&self, entity: &EntityRef, field: FieldId, value: impl Into<Value>) -> Result<()> {
        entity.set_with(field, value.into(), self.permit())
    }

    /// Create an entity; it joins the current flush.
    pub fn create(&self, entity_type: &str) -> Result<EntityRef> {
        self.em.create_with_permit(entity_type, self.permit())
    }

    pub fn delete(&self, entity: &EntityRef) -> Result<()> {
        self.em.delete_with_permit(entity, self.permit())
    }

    pub fn many_to_one(&self, entity: &EntityRef, field: FieldId) -> ManyToOne {
        ManyToOne::new(entity.clone(), field, self.permit())
    }

    pub fn one_to_many(&self, entity: &EntityRef, field: FieldId) -> OneToMany {
        OneToMany::new(entity.clone(), field, self.permit())
    }

    pub fn many_to_many(&self, entity: &EntityRef, field: FieldId) -> ManyToMany {
        ManyToMany::new(entity.clone(), field, self.permit())
    }

    pub fn one_to_one(&self, entity: &EntityRef, field: FieldId) -> OneToOne {
        OneToOne::new(entity.clone(), field, self.permit())
    }

    pub fn polymorphic(&self, entity: &EntityRef, field: FieldId) -> Polymorphic {
        Polymorphic::new(entity.clone(), field, self.permit())
    }
}

/// Run every hook registered at `point` for `entities`, allSettled-style.
pub(crate) async fn run_hooks(
    em: &EntityManager,
    cx: &Cx,
    secret: FlushSecret,
    point: HookPoint,
    entities: &[EntityRef],
) -> Outcome<(), Error> {
    let ctx = HookContext::new(em, cx, secret);
    let mut calls: Vec<LocalBoxFuture<'_, Result<()>>> = Vec::new();
    for entity in entities {
        for hook in entity.meta().hooks_for(point) {
            match hook {
                Hook::Sync(f) => {
                    let ctx = &ctx;
                    calls.push(Box::pin(async move { f(entity, ctx) }));
                }
                Hook::Async(h) => calls.push(h.call(entity, &ctx)),
            }
        }
    }
    if calls.is_empty() {
        return Outcome::Ok(());
    }

    tracing::debug!(hook = %point, count = calls.len(), "Running hooks");
    let mut first = None;
    for result in futures::future::join_all(calls).await {
        if let Err(e) = result {
            tracing::warn!(hook = %point, error = %e, "Hook failed");
            first.get_or_insert(e);
        }
    }
    match first {
        None => Outcome::Ok(()),
        Some(e @ (Error::Validation(_) | Error::Hook { .. })) => Outcome::Err(e),
        Some(e) => Outcome::Err(Error::Hook {
            hook: point.name(),
            message: e.to_string(),
        }),
    }
}
