//! Entity handles and per-instance bookkeeping.
//!
//! An [`EntityRef`] is a cheap-clone handle with pointer identity: two handles
//! are equal only if they point at the same managed instance, which is what
//! the identity map guarantees for equal ids.
//!
//! Every write goes through [`write_slot`]: it records the first pre-mutation
//! value in `original`, keeps the field index current and enqueues reactive
//! recalculation for whatever depends on the field.

use crate::hooks::FlushSecret;
use crate::manager::{EntityManager, ManagerInner};
use crate::metadata::{EntityMetadata, FieldId, FieldKind};
use sqlgraph_core::{Error, IdValue, Result, Value};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Deletion progress of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletedState {
    #[default]
    None,
    /// `delete()` was called; the row still exists.
    Pending,
    /// The DELETE ran inside a transaction that has not committed yet.
    Flushed,
    /// Committed; the entity has been evicted from the identity map.
    Deleted,
}

/// Who is asking to write a field.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Permit {
    /// Ordinary application code.
    Application,
    /// Code running underneath a flush hook, holding the flush secret.
    Hook(FlushSecret),
    /// The engine itself: hydration, reactive write-back, cascade cleanup.
    Engine,
}

/// Stored value of a field with a column.
///
/// References hold either the target's id (`Value`) until loaded, or the
/// target instance itself (`Entity`).
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Value(Value),
    Entity(EntityRef),
}

impl Slot {
    pub(crate) const NULL: Slot = Slot::Value(Value::Null);

    pub(crate) fn is_null(&self) -> bool {
        matches!(self, Slot::Value(Value::Null))
    }

    pub(crate) fn same_as(&self, other: &Slot) -> bool {
        match (self, other) {
            (Slot::Value(a), Slot::Value(b)) => a.same_as(b),
            (Slot::Entity(a), Slot::Entity(b)) => a == b,
            (Slot::Entity(e), Slot::Value(v)) | (Slot::Value(v), Slot::Entity(e)) => {
                e.matches_reference(v)
            }
        }
    }

    /// The column value a many-to-one slot serializes to.
    pub(crate) fn reference_value(&self) -> Value {
        match self {
            Slot::Value(v) => v.clone(),
            Slot::Entity(e) => e.id().map_or(Value::Null, |id| id.to_value()),
        }
    }

    pub(crate) fn entity(&self) -> Option<&EntityRef> {
        match self {
            Slot::Entity(e) => Some(e),
            Slot::Value(_) => None,
        }
    }
}

/// Cached state of relations that are not stored in a column.
#[derive(Debug, Clone)]
pub(crate) enum RelationState {
    /// Loaded children, including pending-deleted ones.
    OneToMany(Option<Vec<EntityRef>>),
    /// Whether the join rows for this side are known; contents live in the
    /// entity manager's join-row registry.
    ManyToMany(bool),
    OneToOne(Option<Option<EntityRef>>),
}

#[derive(Debug, Default)]
pub(crate) struct InstanceState {
    pub is_new: bool,
    pub deleted: DeletedState,
    pub touched: bool,
    /// First pre-mutation value of each field changed since the last flush.
    pub original: BTreeMap<FieldId, Slot>,
    /// Flush-time cascade processing has loaded and walked this entity's relations.
    pub cascade_done: bool,
}

/// What a flush inside an open transaction overwrote, kept for rollback.
#[derive(Debug)]
pub(crate) struct FlushedState {
    pub is_new: bool,
    pub touched: bool,
    pub original: BTreeMap<FieldId, Slot>,
}

impl FlushedState {
    pub fn capture(state: &InstanceState) -> Self {
        Self {
            is_new: state.is_new,
            touched: state.touched,
            original: state.original.clone(),
        }
    }

    /// Fold in a later flush; earlier originals win.
    pub fn merge(&mut self, state: &InstanceState) {
        for (field, slot) in &state.original {
            self.original.entry(*field).or_insert_with(|| slot.clone());
        }
    }
}

pub(crate) struct EntityInner {
    pub meta: Arc<EntityMetadata>,
    pub em: Weak<ManagerInner>,
    /// Registration order; gives handles a stable sort order.
    pub serial: u64,
    pub id: RefCell<Option<IdValue>>,
    pub data: RefCell<Vec<Slot>>,
    pub state: RefCell<InstanceState>,
    pub relations: RefCell<HashMap<FieldId, RelationState>>,
}

/// Handle to one managed entity.
#[derive(Clone)]
pub struct EntityRef(pub(crate) Rc<EntityInner>);

impl EntityRef {
    pub(crate) fn new(
        meta: Arc<EntityMetadata>,
        em: Weak<ManagerInner>,
        serial: u64,
        id: Option<IdValue>,
        data: Vec<Slot>,
        is_new: bool,
    ) -> Self {
        let mut relations = HashMap::new();
        if is_new {
            // A new entity's collections are known to be empty.
            for field in meta.fields.iter() {
                let state = match field.kind {
                    FieldKind::OneToMany { .. } => RelationState::OneToMany(Some(Vec::new())),
                    FieldKind::ManyToMany { .. } => RelationState::ManyToMany(true),
                    FieldKind::OneToOne { .. } => RelationState::OneToOne(Some(None)),
                    _ => continue,
                };
                relations.insert(field.id, state);
            }
        }
        EntityRef(Rc::new(EntityInner {
            meta,
            em,
            serial,
            id: RefCell::new(id),
            data: RefCell::new(data),
            state: RefCell::new(InstanceState {
                is_new,
                ..InstanceState::default()
            }),
            relations: RefCell::new(relations),
        }))
    }

    pub fn meta(&self) -> &Arc<EntityMetadata> {
        &self.0.meta
    }

    pub fn entity_type(&self) -> &'static str {
        self.0.meta.name
    }

    pub fn id(&self) -> Option<IdValue> {
        self.0.id.borrow().clone()
    }

    /// `a:1` style id, or `None` while unsaved.
    pub fn tagged_id(&self) -> Option<String> {
        self.id().map(|id| id.tagged(self.0.meta.tag))
    }

    pub fn is_new(&self) -> bool {
        self.0.state.borrow().is_new
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_state() != DeletedState::None
    }

    pub fn deleted_state(&self) -> DeletedState {
        self.0.state.borrow().deleted
    }

    pub fn is_dirty(&self) -> bool {
        !self.0.state.borrow().original.is_empty()
    }

    pub fn is_touched(&self) -> bool {
        self.0.state.borrow().touched
    }

    /// Names of fields changed since the last flush.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        self.0
            .state
            .borrow()
            .original
            .keys()
            .map(|id| self.0.meta.field(*id).name)
            .collect()
    }

    /// The value a field had before its first change since the last flush.
    pub fn original_value(&self, field: FieldId) -> Option<Value> {
        self.0
            .state
            .borrow()
            .original
            .get(&field)
            .map(Slot::reference_value)
    }

    pub fn manager(&self) -> Result<EntityManager> {
        self.0
            .em
            .upgrade()
            .map(EntityManager::from_inner)
            .ok_or_else(|| Error::Custom(format!("{self} outlived its entity manager")))
    }

    /// Read a column-backed field.
    ///
    /// References return the target id (`Null` while unset or unsaved).
    /// Reactive fields whose dependencies are loaded are recalculated first.
    pub fn get(&self, field: FieldId) -> Result<Value> {
        let def = self.0.meta.try_field(field)?;
        match &def.kind {
            FieldKind::PrimaryKey { .. } => Ok(self.id().map_or(Value::Null, |id| id.to_value())),
            FieldKind::Primitive { .. } | FieldKind::Enum { .. } => {
                if def.derived && self.0.meta.reactive_field(field).is_some() {
                    if let Some(value) = crate::reactive::read_reactive(self, field)? {
                        return Ok(value);
                    }
                }
                Ok(self.slot_value(field))
            }
            FieldKind::ManyToOne { .. } => Ok(self.slot(field).reference_value()),
            FieldKind::Polymorphic { .. } => Ok(match self.slot(field) {
                Slot::Value(v) => v,
                Slot::Entity(e) => e.tagged_id().map_or(Value::Null, Value::Text),
            }),
            _ => Err(Error::Custom(format!(
                "{}.{} is a collection; use its relation handle",
                self.0.meta.name, def.name
            ))),
        }
    }

    pub fn get_by_name(&self, name: &str) -> Result<Value> {
        let id = self.0.meta.field_by_name(name)?.id;
        self.get(id)
    }

    /// Write a primitive or enum field.
    pub fn set(&self, field: FieldId, value: impl Into<Value>) -> Result<()> {
        self.set_with(field, value.into(), Permit::Application)
    }

    pub fn set_by_name(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let id = self.0.meta.field_by_name(name)?.id;
        self.set(id, value)
    }

    pub(crate) fn set_with(&self, field: FieldId, value: Value, permit: Permit) -> Result<()> {
        let def = self.0.meta.try_field(field)?;
        match &def.kind {
            FieldKind::Primitive { .. } | FieldKind::Enum { .. } => {}
            FieldKind::PrimaryKey { .. } => {
                return Err(self.read_only("primary keys are assigned by the flush"));
            }
            _ => {
                return Err(Error::Custom(format!(
                    "{}.{} is a relation; use its relation handle",
                    self.0.meta.name, def.name
                )));
            }
        }
        if def.derived && !matches!(permit, Permit::Engine) {
            return Err(self.read_only(&format!("{} is derived", def.name)));
        }
        write_slot(self, field, Slot::Value(value), permit).map(|_| ())
    }

    /// A field this type does not have reads as unset.
    pub(crate) fn slot(&self, field: FieldId) -> Slot {
        self.0.data.borrow().get(field.0).cloned().unwrap_or(Slot::NULL)
    }

    pub(crate) fn slot_value(&self, field: FieldId) -> Value {
        match self.0.data.borrow().get(field.0) {
            Some(Slot::Value(v)) => v.clone(),
            Some(Slot::Entity(e)) => e.id().map_or(Value::Null, |id| id.to_value()),
            None => Value::Null,
        }
    }

    /// Drop every strong link to other entities, leaving references as ids.
    /// Returns the entities that were linked.
    pub(crate) fn detach_links(&self) -> Vec<EntityRef> {
        let mut linked = Vec::new();
        let mut unlink = |field: FieldId, slot: &mut Slot| {
            if let Slot::Entity(target) = slot {
                linked.push(target.clone());
                let polymorphic = matches!(
                    self.0.meta.fields.get(field.0).map(|f| &f.kind),
                    Some(FieldKind::Polymorphic { .. })
                );
                *slot = Slot::Value(if polymorphic {
                    target.tagged_id().map_or(Value::Null, Value::Text)
                } else {
                    target.id().map_or(Value::Null, |id| id.to_value())
                });
            }
        };
        for (i, slot) in self.0.data.borrow_mut().iter_mut().enumerate() {
            unlink(FieldId(i), slot);
        }
        for (field, slot) in &mut self.0.state.borrow_mut().original {
            unlink(*field, slot);
        }
        for (_, state) in self.0.relations.borrow_mut().drain() {
            match state {
                RelationState::OneToMany(Some(children)) => linked.extend(children),
                RelationState::OneToOne(Some(Some(child))) => linked.push(child),
                _ => {}
            }
        }
        linked
    }

    /// Replace an unloaded reference id with its instance without dirtying.
    pub(crate) fn resolve_slot(&self, field: FieldId, target: &EntityRef) {
        let mut data = self.0.data.borrow_mut();
        if let Some(slot) = data.get_mut(field.0) {
            if slot.same_as(&Slot::Entity(target.clone())) {
                *slot = Slot::Entity(target.clone());
            }
        }
    }

    pub(crate) fn original_slot(&self, field: FieldId) -> Option<Slot> {
        self.0.state.borrow().original.get(&field).cloned()
    }

    /// Make the writes of rolled-back flushes pending again. Ids stay assigned.
    pub(crate) fn restore_flushed(&self, saved: FlushedState) {
        let data = self.0.data.borrow();
        let mut state = self.0.state.borrow_mut();
        state.is_new = saved.is_new;
        state.touched |= saved.touched;
        for (field, before) in saved.original {
            if data.get(field.0).is_some_and(|current| current.same_as(&before)) {
                state.original.remove(&field);
            } else {
                state.original.insert(field, before);
            }
        }
    }

    pub(crate) fn state(&self) -> std::cell::Ref<'_, InstanceState> {
        self.0.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> std::cell::RefMut<'_, InstanceState> {
        self.0.state.borrow_mut()
    }

    pub(crate) fn relation_state(&self, field: FieldId) -> Option<RelationState> {
        self.0.relations.borrow().get(&field).cloned()
    }

    pub(crate) fn set_relation_state(&self, field: FieldId, state: RelationState) {
        self.0.relations.borrow_mut().insert(field, state);
    }

    pub(crate) fn with_relation_state<R>(
        &self,
        field: FieldId,
        f: impl FnOnce(&mut RelationState) -> R,
    ) -> Option<R> {
        self.0.relations.borrow_mut().get_mut(&field).map(f)
    }

    pub(crate) fn assign_id(&self, id: IdValue) {
        *self.0.id.borrow_mut() = Some(id);
    }

    pub(crate) fn serial(&self) -> u64 {
        self.0.serial
    }

    /// Whether a stored reference value (id or tagged id) names this entity.
    pub(crate) fn matches_reference(&self, value: &Value) -> bool {
        let Some(id) = self.id() else {
            return false;
        };
        if id.to_value().same_as(value) {
            return true;
        }
        value
            .as_str()
            .is_some_and(|text| text == id.tagged(self.0.meta.tag))
    }

    pub(crate) fn read_only(&self, reason: &str) -> Error {
        Error::ReadOnly {
            entity: self.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// The single mutation path. Returns whether the stored value changed.
pub(crate) fn write_slot(
    entity: &EntityRef,
    field: FieldId,
    slot: Slot,
    permit: Permit,
) -> Result<bool> {
    entity.meta().try_field(field)?;
    let em = entity.manager()?;
    check_writable(entity, &em, permit)?;

    let previous = entity.slot(field);
    if previous.same_as(&slot) {
        // Swap an id for its instance (or back) without counting as a change.
        entity.0.data.borrow_mut()[field.0] = slot;
        return Ok(false);
    }

    {
        let mut state = entity.state_mut();
        match state.original.get(&field) {
            Some(original) if original.same_as(&slot) => {
                state.original.remove(&field);
            }
            Some(_) => {}
            None => {
                state.original.insert(field, previous.clone());
            }
        }
    }
    entity.0.data.borrow_mut()[field.0] = slot.clone();

    tracing::trace!(
        entity = %entity,
        field = entity.meta().field(field).name,
        "Field changed"
    );
    em.field_index_update(entity, field, &previous, &slot);
    em.field_changed(entity, field);
    Ok(true)
}

pub(crate) fn check_writable(entity: &EntityRef, em: &EntityManager, permit: Permit) -> Result<()> {
    em.check_flush_gate(entity, permit)?;
    if matches!(permit, Permit::Application) && entity.is_deleted() {
        return Err(entity.read_only("entity is deleted"));
    }
    Ok(())
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Rc::as_ptr(&self.0), state);
    }
}

impl PartialOrd for EntityRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntityRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .serial
            .cmp(&other.0.serial)
            .then_with(|| Rc::as_ptr(&self.0).cmp(&Rc::as_ptr(&other.0)))
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tagged_id() {
            Some(tagged) => write!(f, "{}#{}", self.0.meta.name, tagged),
            None => write!(f, "{}#new", self.0.meta.name),
        }
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}
