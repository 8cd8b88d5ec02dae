//! The unit of work: one [`EntityManager`] per request.
//!
//! The entity manager owns the identity map, the batched loaders, the
//! many-to-many join rows, the reactive queue and the field index. Nothing
//! here is shared across requests; after every successful flush the loader
//! caches and the reactive queue are discarded because the database changed
//! underneath them.
//!
//! Every I/O-bound method takes a [`Cx`] and returns an [`Outcome`]. Loads
//! issued concurrently (e.g. via `join_all`) coalesce into one driver call
//! per entity type.

use crate::cascade;
use crate::entity::{EntityInner, EntityRef, FlushedState, Permit, Slot};
use crate::field_index::FieldIndex;
use crate::filter::Filter;
use crate::flush;
use crate::hint::LoadHint;
use crate::hooks::{self, FlushSecret, HookPoint};
use crate::identity_map::{IdentityMap, ObjectKey};
use crate::join_rows::{JoinRow, JoinRows, JoinSide};
use crate::loader::DataLoader;
use crate::metadata::{EntityMetadata, FieldId, FieldKind};
use crate::reactive::{self, ReactiveQueue};
use crate::registry::MetadataRegistry;
use crate::relations;
use futures::future::LocalBoxFuture;
use sqlgraph_core::{
    Condition, Cx, Driver, Error, FindQuery, IdValue, IsolationLevel, NotFoundError, Outcome, Page,
    Result, Row, TransactionError, TransactionErrorKind, Value, try_outcome, try_result,
};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Tuning knobs for one entity manager.
#[derive(Debug, Clone)]
pub struct EntityManagerConfig {
    /// Hard ceiling on managed entities; catches runaway graphs.
    pub entity_limit: usize,
    /// Managed count per type above which in-memory matching uses an index.
    pub index_threshold: usize,
    /// Isolation of [`EntityManager::begin_transaction`] and [`EntityManager::transaction`].
    pub isolation: IsolationLevel,
    /// Isolation of the transaction a flush opens for itself.
    pub flush_isolation: IsolationLevel,
    /// Database constraint name -> validation message.
    pub constraint_messages: HashMap<String, String>,
}

impl Default for EntityManagerConfig {
    fn default() -> Self {
        Self {
            entity_limit: 10_000,
            index_threshold: 1_000,
            isolation: IsolationLevel::Serializable,
            flush_isolation: IsolationLevel::ReadCommitted,
            constraint_messages: HashMap::new(),
        }
    }
}

impl EntityManagerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entity_limit(mut self, limit: usize) -> Self {
        self.entity_limit = limit;
        self
    }

    #[must_use]
    pub fn index_threshold(mut self, threshold: usize) -> Self {
        self.index_threshold = threshold;
        self
    }

    #[must_use]
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    #[must_use]
    pub fn flush_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.flush_isolation = isolation;
        self
    }

    /// Map a violated constraint to the message reported in `ValidationErrors`.
    #[must_use]
    pub fn constraint_message(
        mut self,
        constraint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.constraint_messages
            .insert(constraint.into(), message.into());
        self
    }
}

/// Options for [`EntityManager::flush`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushOptions {
    pub skip_validation: bool,
}

impl FlushOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn skip_validation(mut self, value: bool) -> Self {
        self.skip_validation = value;
        self
    }
}

/// Explicit outer transaction bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct TransactionState {
    pub open: bool,
    /// Entities whose `afterCommit` hooks wait for the outer commit.
    pub after_commit: Vec<EntityRef>,
    /// Deletes already sent to the database inside the open transaction.
    pub flushed_deletes: Vec<EntityRef>,
    /// Inserts and updates already sent, with their state before the first one.
    pub flushed_writes: HashMap<EntityRef, FlushedState>,
    /// Join rows settled by flushes inside the transaction, oldest first.
    pub flushed_join_rows: Vec<(&'static str, JoinRow)>,
}

impl TransactionState {
    pub fn record_write(&mut self, entity: &EntityRef) {
        let state = entity.state();
        self.flushed_writes
            .entry(entity.clone())
            .and_modify(|saved| saved.merge(&state))
            .or_insert_with(|| FlushedState::capture(&state));
    }
}

pub(crate) struct ManagerInner {
    pub registry: Arc<MetadataRegistry>,
    pub driver: Rc<dyn Driver>,
    pub config: EntityManagerConfig,
    pub identity: RefCell<IdentityMap>,
    pub join_rows: RefCell<JoinRows>,
    pub index: RefCell<FieldIndex>,
    pub loaders: RefCell<HashMap<(&'static str, String), Box<dyn Any>>>,
    pub reactive: RefCell<ReactiveQueue>,
    /// Deleted entities whose unloaded relations still need a cascade pass.
    pub pending_cascade: RefCell<Vec<EntityRef>>,
    pub flushing: Cell<bool>,
    pub flush_epoch: Cell<u64>,
    pub tx: RefCell<TransactionState>,
    /// Entities evicted after their delete committed; still linked to others.
    pub evicted: RefCell<Vec<Weak<EntityInner>>>,
    next_serial: Cell<u64>,
}

impl Drop for ManagerInner {
    /// Entities link to each other in both directions; break the links so
    /// they are freed together with the unit of work.
    fn drop(&mut self) {
        let mut pending: Vec<EntityRef> = self.identity.get_mut().all().to_vec();
        pending.extend(
            self.evicted
                .get_mut()
                .drain(..)
                .filter_map(|weak| weak.upgrade().map(EntityRef)),
        );
        pending.append(self.pending_cascade.get_mut());
        let mut seen = HashSet::new();
        while let Some(entity) = pending.pop() {
            if seen.insert(entity.clone()) {
                pending.extend(entity.detach_links());
            }
        }
    }
}

/// Handle to one unit of work. Clones share the same state.
#[derive(Clone)]
pub struct EntityManager {
    pub(crate) inner: Rc<ManagerInner>,
}

impl EntityManager {
    pub fn new(registry: Arc<MetadataRegistry>, driver: impl Driver + 'static) -> Self {
        Self::with_config(registry, driver, EntityManagerConfig::default())
    }

    pub fn with_config(
        registry: Arc<MetadataRegistry>,
        driver: impl Driver + 'static,
        config: EntityManagerConfig,
    ) -> Self {
        let inner = ManagerInner {
            registry,
            driver: Rc::new(driver),
            identity: RefCell::new(IdentityMap::new(config.entity_limit)),
            join_rows: RefCell::new(JoinRows::default()),
            index: RefCell::new(FieldIndex::new(config.index_threshold)),
            loaders: RefCell::new(HashMap::new()),
            reactive: RefCell::new(ReactiveQueue::default()),
            pending_cascade: RefCell::new(Vec::new()),
            flushing: Cell::new(false),
            flush_epoch: Cell::new(0),
            tx: RefCell::new(TransactionState::default()),
            evicted: RefCell::new(Vec::new()),
            next_serial: Cell::new(1),
            config,
        };
        Self {
            inner: Rc::new(inner),
        }
    }

    pub(crate) fn from_inner(inner: Rc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn weak(&self) -> Weak<ManagerInner> {
        Rc::downgrade(&self.inner)
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &EntityManagerConfig {
        &self.inner.config
    }

    pub(crate) fn driver(&self) -> &Rc<dyn Driver> {
        &self.inner.driver
    }

    pub(crate) fn meta(&self, entity_type: &str) -> Result<Arc<EntityMetadata>> {
        self.inner.registry.require(entity_type).map(Arc::clone)
    }

    // ========================================================================
    // Flush gate
    // ========================================================================

    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.get()
    }

    pub(crate) fn accepts_secret(&self, secret: FlushSecret) -> bool {
        self.is_flushing() && secret.epoch() == self.inner.flush_epoch.get()
    }

    /// Reject writes that the running flush (if any) does not permit.
    pub(crate) fn check_flush_gate(&self, subject: &dyn fmt::Display, permit: Permit) -> Result<()> {
        let reason = match permit {
            Permit::Engine => return Ok(()),
            Permit::Hook(secret) if self.accepts_secret(secret) => return Ok(()),
            Permit::Hook(_) => "flush secret is not valid for the running flush",
            Permit::Application if self.is_flushing() => "a flush is in progress",
            Permit::Application => return Ok(()),
        };
        Err(Error::ReadOnly {
            entity: subject.to_string(),
            reason: reason.to_string(),
        })
    }

    pub(crate) fn field_index_update(&self, entity: &EntityRef, field: FieldId, old: &Slot, new: &Slot) {
        self.inner.index.borrow_mut().update(entity, field, old, new);
    }

    pub(crate) fn field_changed(&self, entity: &EntityRef, field: FieldId) {
        reactive::on_field_changed(self, entity, field);
    }

    // ========================================================================
    // Identity map
    // ========================================================================

    fn next_serial(&self) -> u64 {
        let serial = self.inner.next_serial.get();
        self.inner.next_serial.set(serial + 1);
        serial
    }

    /// Start managing a freshly built entity.
    fn manage(&self, entity: &EntityRef) -> Result<()> {
        self.inner.identity.borrow_mut().register(entity)?;
        let identity = self.inner.identity.borrow();
        let mut index = self.inner.index.borrow_mut();
        if index.is_indexed(entity.entity_type()) {
            index.insert(entity);
        } else {
            index.on_count_changed(entity.meta(), identity.of_type(entity.entity_type()));
        }
        Ok(())
    }

    /// Stop managing `evicted` and shrink the field index accordingly.
    pub(crate) fn evict(&self, evicted: &HashSet<EntityRef>) {
        self.inner
            .evicted
            .borrow_mut()
            .extend(evicted.iter().map(|e| Rc::downgrade(&e.0)));
        let types = self.inner.identity.borrow_mut().evict(evicted);
        let identity = self.inner.identity.borrow();
        let mut index = self.inner.index.borrow_mut();
        for name in types {
            if let Some(meta) = self.inner.registry.get(name) {
                index.on_count_changed(meta, identity.of_type(name));
            }
        }
    }

    /// Every managed entity, in registration order.
    pub fn entities(&self) -> Vec<EntityRef> {
        self.inner.identity.borrow().all().to_vec()
    }

    pub fn entities_of(&self, entity_type: &str) -> Vec<EntityRef> {
        self.inner.identity.borrow().of_type(entity_type).to_vec()
    }

    /// Look up a managed entity by tagged id (`a:1`) without I/O.
    pub fn find_existing(&self, tagged_id: &str) -> Option<EntityRef> {
        let (tag, _) = tagged_id.split_once(':')?;
        let meta = self.inner.registry.by_tag(tag)?;
        let id = IdValue::parse_tagged(tagged_id, meta.tag)?;
        self.find_existing_id(meta.name, &id)
    }

    pub fn find_existing_id(&self, entity_type: &str, id: &IdValue) -> Option<EntityRef> {
        let name = self.inner.registry.get(entity_type)?.name;
        self.inner
            .identity
            .borrow()
            .get(&ObjectKey::new(name, id.clone()))
    }

    /// Create a new entity; it is inserted by the next flush.
    pub fn create(&self, entity_type: &str) -> Result<EntityRef> {
        self.create_with_permit(entity_type, Permit::Application)
    }

    /// Create a new entity and set primitive fields by name.
    pub fn create_with<'a, I>(&self, entity_type: &str, values: I) -> Result<EntityRef>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let entity = self.create(entity_type)?;
        for (name, value) in values {
            entity.set_by_name(name, value)?;
        }
        Ok(entity)
    }

    pub(crate) fn create_with_permit(&self, entity_type: &str, permit: Permit) -> Result<EntityRef> {
        let meta = self.meta(entity_type)?;
        self.check_flush_gate(&meta.name, permit)?;
        let data = meta
            .fields
            .iter()
            .map(|field| match &field.kind {
                FieldKind::Primitive {
                    default: Some(value),
                    ..
                } => Slot::Value(value.clone()),
                _ => Slot::NULL,
            })
            .collect();
        let entity = EntityRef::new(meta, self.weak(), self.next_serial(), None, data, true);
        self.manage(&entity)?;
        tracing::trace!(entity = %entity, "Created entity");
        reactive::entity_created(self, &entity);
        Ok(entity)
    }

    /// Manage an entity read from `row`; fails if its id is already managed.
    pub fn register(&self, entity_type: &str, row: &Row) -> Result<EntityRef> {
        let meta = self.meta(entity_type)?;
        let id = row_id(&meta, row)?;
        if self.find_existing_id(meta.name, &id).is_some() {
            return Err(Error::DuplicateEntity {
                tagged_id: id.tagged(meta.tag),
            });
        }
        self.hydrate(&meta, row)
    }

    /// The managed instance for `row`, creating it if needed.
    pub(crate) fn hydrate(&self, meta: &Arc<EntityMetadata>, row: &Row) -> Result<EntityRef> {
        let id = row_id(meta, row)?;
        if let Some(existing) = self.find_existing_id(meta.name, &id) {
            return Ok(existing);
        }
        let column = |name: &str| row.get_by_name(name).cloned().unwrap_or(Value::Null);
        let mut data = Vec::with_capacity(meta.fields.len());
        for field in &meta.fields {
            let slot = match &field.kind {
                FieldKind::PrimaryKey { .. } => Slot::Value(id.to_value()),
                FieldKind::Primitive { column: c, serde, .. } => {
                    Slot::Value(serde.from_column(&column(*c))?)
                }
                FieldKind::Enum { column: c, .. } | FieldKind::ManyToOne { column: c, .. } => {
                    Slot::Value(column(*c))
                }
                FieldKind::Polymorphic { components, .. } => {
                    let mut slot = Slot::NULL;
                    for component in components {
                        if let Some(target_id) = IdValue::from_value(&column(component.column)) {
                            let tag = self.meta(component.other)?.tag;
                            slot = Slot::Value(Value::Text(target_id.tagged(tag)));
                            break;
                        }
                    }
                    slot
                }
                _ => Slot::NULL,
            };
            data.push(slot);
        }
        let entity = EntityRef::new(
            Arc::clone(meta),
            self.weak(),
            self.next_serial(),
            Some(id),
            data,
            false,
        );
        self.manage(&entity)?;
        Ok(entity)
    }

    fn hydrate_all(&self, meta: &Arc<EntityMetadata>, rows: &[Row]) -> Result<Vec<EntityRef>> {
        rows.iter().map(|row| self.hydrate(meta, row)).collect()
    }

    // ========================================================================
    // Loaders
    // ========================================================================

    /// The loader for `(operation, batch_key)`, created by `make` on first use
    /// and kept until the next successful flush.
    pub fn loader<K, V, F>(
        &self,
        operation: &'static str,
        batch_key: impl Into<String>,
        make: F,
    ) -> DataLoader<K, V>
    where
        K: Eq + std::hash::Hash + Clone + fmt::Debug + 'static,
        V: Clone + 'static,
        F: FnOnce() -> DataLoader<K, V>,
    {
        let key = (operation, batch_key.into());
        {
            let loaders = self.inner.loaders.borrow();
            if let Some(loader) = loaders
                .get(&key)
                .and_then(|l| l.downcast_ref::<DataLoader<K, V>>())
            {
                return loader.clone();
            }
        }
        let loader = make();
        self.inner
            .loaders
            .borrow_mut()
            .insert(key, Box::new(loader.clone()));
        loader
    }

    pub(crate) fn clear_loaders(&self) {
        self.inner.loaders.borrow_mut().clear();
    }

    /// Rows by primary key.
    fn row_loader(&self, meta: &Arc<EntityMetadata>) -> DataLoader<IdValue, Row> {
        let weak = self.weak();
        let meta = Arc::clone(meta);
        self.loader("load", meta.name, move || {
            DataLoader::new(format!("load {}", meta.name), move |cx, ids: Vec<IdValue>| {
                let weak = weak.clone();
                let meta = Arc::clone(&meta);
                Box::pin(async move {
                    let em = try_result!(upgrade(&weak));
                    let pk = meta.pk_column();
                    let query = FindQuery::new(meta.table)
                        .filter(Condition::In(pk, ids.iter().map(IdValue::to_value).collect()));
                    let rows = try_outcome!(
                        em.driver().execute_find(cx, &query, Page::default()).await
                    );
                    let mut by_id: HashMap<IdValue, Row> = rows
                        .into_iter()
                        .filter_map(|row| {
                            let id = row.get_by_name(pk).and_then(IdValue::from_value)?;
                            Some((id, row))
                        })
                        .collect();
                    Outcome::Ok(ids.iter().map(|id| by_id.remove(id)).collect())
                })
            })
        })
    }

    /// Child rows grouped by the value of `column` (a foreign key).
    pub(crate) fn children_loader(
        &self,
        child: &Arc<EntityMetadata>,
        column: &'static str,
    ) -> DataLoader<IdValue, Vec<Row>> {
        let weak = self.weak();
        let table = child.table;
        self.loader("o2m", format!("{}.{}", child.name, column), move || {
            DataLoader::new(format!("o2m {table}.{column}"), move |cx, owners: Vec<IdValue>| {
                let weak = weak.clone();
                Box::pin(async move {
                    let em = try_result!(upgrade(&weak));
                    let query = FindQuery::new(table)
                        .filter(Condition::In(column, owners.iter().map(IdValue::to_value).collect()));
                    let rows = try_outcome!(
                        em.driver().execute_find(cx, &query, Page::default()).await
                    );
                    let mut groups: HashMap<IdValue, Vec<Row>> = HashMap::new();
                    for row in rows {
                        if let Some(owner) = row.get_by_name(column).and_then(IdValue::from_value) {
                            groups.entry(owner).or_default().push(row);
                        }
                    }
                    Outcome::Ok(
                        owners
                            .iter()
                            .map(|id| Some(groups.remove(id).unwrap_or_default()))
                            .collect(),
                    )
                })
            })
        })
    }

    /// Far-side ids of one join-table side, keyed by owner id.
    pub(crate) fn join_loader(&self, side: &JoinSide) -> DataLoader<IdValue, Vec<IdValue>> {
        let weak = self.weak();
        let table = side.table;
        let owner_column = side.owner_column();
        let other_column = side.other_column();
        self.loader("m2m", format!("{table}.{owner_column}"), move || {
            DataLoader::new(format!("m2m {table}.{owner_column}"), move |cx, owners: Vec<IdValue>| {
                let weak = weak.clone();
                Box::pin(async move {
                    let em = try_result!(upgrade(&weak));
                    let query = FindQuery::new(table).filter(Condition::In(
                        owner_column,
                        owners.iter().map(IdValue::to_value).collect(),
                    ));
                    let rows = try_outcome!(
                        em.driver().execute_find(cx, &query, Page::default()).await
                    );
                    let mut groups: HashMap<IdValue, Vec<IdValue>> = HashMap::new();
                    for row in rows {
                        let owner = row.get_by_name(owner_column).and_then(IdValue::from_value);
                        let other = row.get_by_name(other_column).and_then(IdValue::from_value);
                        if let (Some(owner), Some(other)) = (owner, other) {
                            groups.entry(owner).or_default().push(other);
                        }
                    }
                    Outcome::Ok(
                        owners
                            .iter()
                            .map(|id| Some(groups.remove(id).unwrap_or_default()))
                            .collect(),
                    )
                })
            })
        })
    }

    /// Whether `(column1, column2)` pairs exist in a join table.
    pub(crate) fn join_probe_loader(&self, side: &JoinSide) -> DataLoader<(IdValue, IdValue), bool> {
        let weak = self.weak();
        let (table, column1, column2) = (side.table, side.column1, side.column2);
        self.loader("m2m-probe", table, move || {
            DataLoader::new(
                format!("m2m-probe {table}"),
                move |cx, pairs: Vec<(IdValue, IdValue)>| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let em = try_result!(upgrade(&weak));
                        let lefts: BTreeSet<&IdValue> = pairs.iter().map(|(l, _)| l).collect();
                        let rights: BTreeSet<&IdValue> = pairs.iter().map(|(_, r)| r).collect();
                        let query = FindQuery::new(table)
                            .filter(Condition::In(column1, lefts.into_iter().map(IdValue::to_value).collect()))
                            .filter(Condition::In(column2, rights.into_iter().map(IdValue::to_value).collect()));
                        let rows = try_outcome!(
                            em.driver().execute_find(cx, &query, Page::default()).await
                        );
                        let found: HashSet<(IdValue, IdValue)> = rows
                            .iter()
                            .filter_map(|row| {
                                let l = row.get_by_name(column1).and_then(IdValue::from_value)?;
                                let r = row.get_by_name(column2).and_then(IdValue::from_value)?;
                                Some((l, r))
                            })
                            .collect();
                        Outcome::Ok(pairs.iter().map(|p| Some(found.contains(p))).collect())
                    })
                },
            )
        })
    }

    /// Identical unbounded finds in one tick share a single query.
    fn find_loader(&self, query: FindQuery) -> DataLoader<(), Vec<Row>> {
        let weak = self.weak();
        let key = format!("{query:?}");
        self.loader("find", key, move || {
            DataLoader::new(format!("find {}", query.table), move |cx, keys: Vec<()>| {
                let weak = weak.clone();
                let query = query.clone();
                Box::pin(async move {
                    let em = try_result!(upgrade(&weak));
                    let rows = try_outcome!(
                        em.driver().execute_find(cx, &query, Page::default()).await
                    );
                    Outcome::Ok(keys.iter().map(|_| Some(rows.clone())).collect())
                })
            })
        })
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load by id; accepts tagged (`a:1`) or untagged (`1`) ids.
    pub async fn load(&self, cx: &Cx, entity_type: &str, id: &str) -> Outcome<EntityRef, Error> {
        let meta = try_result!(self.meta(entity_type));
        let parsed = try_result!(parse_id(&meta, id));
        self.load_by_id(cx, entity_type, parsed).await
    }

    pub async fn load_by_id(
        &self,
        cx: &Cx,
        entity_type: &str,
        id: IdValue,
    ) -> Outcome<EntityRef, Error> {
        let meta = try_result!(self.meta(entity_type));
        match try_outcome!(self.load_if_exists(cx, &meta, id.clone()).await) {
            Some(entity) => Outcome::Ok(entity),
            None => Outcome::Err(Error::NotFound(NotFoundError {
                entity: meta.name,
                ids: vec![id.tagged(meta.tag)],
            })),
        }
    }

    pub(crate) async fn load_if_exists(
        &self,
        cx: &Cx,
        meta: &Arc<EntityMetadata>,
        id: IdValue,
    ) -> Outcome<Option<EntityRef>, Error> {
        if let Some(existing) = self.find_existing_id(meta.name, &id) {
            return Outcome::Ok(Some(existing));
        }
        let loader = self.row_loader(meta);
        match try_outcome!(loader.load(cx, id).await) {
            Some(row) => Outcome::Ok(Some(try_result!(self.hydrate(meta, &row)))),
            None => Outcome::Ok(None),
        }
    }

    /// Load several ids in one batch; fails listing every missing id.
    pub async fn load_all(
        &self,
        cx: &Cx,
        entity_type: &str,
        ids: &[&str],
    ) -> Outcome<Vec<EntityRef>, Error> {
        let meta = try_result!(self.meta(entity_type));
        let (found, missing) = try_outcome!(self.load_many(cx, &meta, ids).await);
        if missing.is_empty() {
            Outcome::Ok(found)
        } else {
            Outcome::Err(Error::NotFound(NotFoundError {
                entity: meta.name,
                ids: missing,
            }))
        }
    }

    /// Like [`load_all`](Self::load_all) but silently skips missing ids.
    pub async fn load_all_if_exists(
        &self,
        cx: &Cx,
        entity_type: &str,
        ids: &[&str],
    ) -> Outcome<Vec<EntityRef>, Error> {
        let meta = try_result!(self.meta(entity_type));
        let (found, _) = try_outcome!(self.load_many(cx, &meta, ids).await);
        Outcome::Ok(found)
    }

    async fn load_many(
        &self,
        cx: &Cx,
        meta: &Arc<EntityMetadata>,
        ids: &[&str],
    ) -> Outcome<(Vec<EntityRef>, Vec<String>), Error> {
        let mut parsed = Vec::with_capacity(ids.len());
        for id in ids {
            parsed.push(try_result!(parse_id(meta, id)));
        }
        let loads = parsed
            .iter()
            .map(|id| self.load_if_exists(cx, meta, id.clone()));
        let results = futures::future::join_all(loads).await;
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for (id, outcome) in parsed.iter().zip(results) {
            match try_outcome!(outcome) {
                Some(entity) => found.push(entity),
                None => missing.push(id.tagged(meta.tag)),
            }
        }
        Outcome::Ok((found, missing))
    }

    // ========================================================================
    // Finding
    // ========================================================================

    /// Entities whose stored rows match `filter`. Batched and deduplicated;
    /// pending-deleted entities are excluded.
    pub async fn find(
        &self,
        cx: &Cx,
        entity_type: &str,
        filter: Filter,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let meta = try_result!(self.meta(entity_type));
        let Some(query) = try_result!(filter.to_query(&meta)) else {
            return Outcome::Ok(Vec::new());
        };
        let loader = self.find_loader(query);
        let rows = try_outcome!(loader.load(cx, ()).await).unwrap_or_default();
        let entities = try_result!(self.hydrate_all(&meta, &rows));
        Outcome::Ok(entities.into_iter().filter(|e| !e.is_deleted()).collect())
    }

    /// At most one match; more is a [`Error::TooMany`].
    pub async fn find_one(
        &self,
        cx: &Cx,
        entity_type: &str,
        filter: Filter,
    ) -> Outcome<Option<EntityRef>, Error> {
        let mut found = try_outcome!(self.find(cx, entity_type, filter).await);
        if found.len() > 1 {
            let entity = try_result!(self.meta(entity_type)).name;
            return Outcome::Err(Error::TooMany {
                entity,
                count: found.len(),
            });
        }
        Outcome::Ok(found.pop())
    }

    /// Exactly one match.
    pub async fn find_one_or_fail(
        &self,
        cx: &Cx,
        entity_type: &str,
        filter: Filter,
    ) -> Outcome<EntityRef, Error> {
        let description = filter.to_string();
        match try_outcome!(self.find_one(cx, entity_type, filter).await) {
            Some(entity) => Outcome::Ok(entity),
            None => {
                let entity = try_result!(self.meta(entity_type)).name;
                Outcome::Err(Error::NotFound(NotFoundError {
                    entity,
                    ids: vec![description],
                }))
            }
        }
    }

    /// Paginated find. Never batched: every call is its own round trip.
    pub async fn find_paginated(
        &self,
        cx: &Cx,
        entity_type: &str,
        filter: Filter,
        page: Page,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let meta = try_result!(self.meta(entity_type));
        let Some(query) = try_result!(filter.to_query(&meta)) else {
            return Outcome::Ok(Vec::new());
        };
        let rows = try_outcome!(self.driver().execute_find(cx, &query, page).await);
        let entities = try_result!(self.hydrate_all(&meta, &rows));
        Outcome::Ok(entities.into_iter().filter(|e| !e.is_deleted()).collect())
    }

    /// Stored matches that still match in memory, plus new or changed
    /// managed entities that match.
    pub async fn find_with_new_or_changed(
        &self,
        cx: &Cx,
        entity_type: &str,
        filter: Filter,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let meta = try_result!(self.meta(entity_type));
        let stored = try_outcome!(self.find(cx, entity_type, filter.clone()).await);

        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for entity in stored {
            if try_result!(filter.matches(&entity)) && seen.insert(entity.clone()) {
                out.push(entity);
            }
        }

        let candidates: Vec<EntityRef> = {
            let probe = filter.index_probe(&meta);
            let indexed = probe.and_then(|(field, keys)| {
                self.inner.index.borrow().lookup(meta.name, field, &keys)
            });
            match indexed {
                Some(hits) => hits.into_iter().collect(),
                None => self.entities_of(meta.name),
            }
        };
        for entity in candidates {
            if entity.is_deleted() || !(entity.is_new() || entity.is_dirty()) {
                continue;
            }
            if try_result!(filter.matches(&entity)) && seen.insert(entity.clone()) {
                out.push(entity);
            }
        }
        Outcome::Ok(out)
    }

    /// Run raw SQL whose rows are entities of `entity_type`.
    pub async fn find_by_sql(
        &self,
        cx: &Cx,
        entity_type: &str,
        sql: &str,
        params: &[Value],
    ) -> Outcome<Vec<EntityRef>, Error> {
        let meta = try_result!(self.meta(entity_type));
        let rows = try_outcome!(self.driver().execute_query(cx, sql, params).await);
        Outcome::Ok(try_result!(self.hydrate_all(&meta, &rows)))
    }

    /// Load every relation named by `hint`, recursively, batching each level.
    pub async fn populate(
        &self,
        cx: &Cx,
        entities: &[EntityRef],
        hint: impl Into<LoadHint>,
    ) -> Outcome<(), Error> {
        let hint = hint.into();
        self.populate_level(cx, entities.to_vec(), &hint).await
    }

    fn populate_level<'a>(
        &'a self,
        cx: &'a Cx,
        entities: Vec<EntityRef>,
        hint: &'a LoadHint,
    ) -> LocalBoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            for (name, child) in hint.children() {
                let mut loads = Vec::new();
                for entity in &entities {
                    let field = try_result!(entity.meta().field_by_name(name));
                    if field.kind.is_relation() {
                        loads.push(relations::load_field(cx, entity, field.id));
                    }
                }
                let mut next = Vec::new();
                for outcome in futures::future::join_all(loads).await {
                    next.extend(try_outcome!(outcome));
                }
                if !child.is_empty() && !next.is_empty() {
                    next.sort();
                    next.dedup();
                    try_outcome!(self.populate_level(cx, next, child).await);
                }
            }
            Outcome::Ok(())
        })
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Mark `entity` deleted. Idempotent.
    pub fn delete(&self, entity: &EntityRef) -> Result<()> {
        self.delete_with_permit(entity, Permit::Application)
    }

    pub(crate) fn delete_with_permit(&self, entity: &EntityRef, permit: Permit) -> Result<()> {
        cascade::delete_entity(self, entity, permit)
    }

    /// Force an update pass (hooks, derived fields) without a field change.
    pub fn touch(&self, entity: &EntityRef) -> Result<()> {
        self.check_flush_gate(entity, Permit::Application)?;
        if entity.is_deleted() {
            return Err(entity.read_only("entity is deleted"));
        }
        entity.state_mut().touched = true;
        reactive::entity_touched(self, entity);
        Ok(())
    }

    /// Persist every pending change in one transaction.
    pub async fn flush(&self, cx: &Cx, options: FlushOptions) -> Outcome<Vec<EntityRef>, Error> {
        flush::run(self, cx, options).await
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn in_transaction(&self) -> bool {
        self.inner.tx.borrow().open
    }

    /// Open an explicit outer transaction; flushes reuse it until commit.
    pub async fn begin_transaction(&self, cx: &Cx) -> Outcome<(), Error> {
        if self.in_transaction() {
            return Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyOpen,
                message: "a transaction is already open".to_string(),
            }));
        }
        try_outcome!(self.driver().begin(cx, self.inner.config.isolation).await);
        self.inner.tx.borrow_mut().open = true;
        tracing::info!(isolation = self.inner.config.isolation.as_sql(), "Transaction started");
        Outcome::Ok(())
    }

    /// Commit the outer transaction, then run deferred `afterCommit` hooks.
    pub async fn commit(&self, cx: &Cx) -> Outcome<(), Error> {
        try_result!(self.require_transaction());
        try_outcome!(self.driver().commit(cx).await);
        let (after_commit, deleted) = {
            let mut tx = self.inner.tx.borrow_mut();
            tx.open = false;
            tx.flushed_writes.clear();
            tx.flushed_join_rows.clear();
            (
                std::mem::take(&mut tx.after_commit),
                std::mem::take(&mut tx.flushed_deletes),
            )
        };
        let evicted: HashSet<EntityRef> = deleted.into_iter().collect();
        for entity in &evicted {
            entity.state_mut().deleted = crate::entity::DeletedState::Deleted;
        }
        self.evict(&evicted);
        tracing::info!(deferred_hooks = after_commit.len(), "Transaction committed");

        if after_commit.is_empty() {
            return Outcome::Ok(());
        }
        let guard = try_result!(flush::FlushGuard::acquire(self));
        let secret = guard.secret();
        hooks::run_hooks(self, cx, secret, HookPoint::AfterCommit, &after_commit).await
    }

    /// Roll back the outer transaction. Everything its flushes wrote becomes
    /// pending again, so the next flush writes it once more.
    pub async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        try_result!(self.require_transaction());
        let outcome = self.driver().rollback(cx).await;
        let (deleted, written, join_rows) = {
            let mut tx = self.inner.tx.borrow_mut();
            tx.open = false;
            tx.after_commit.clear();
            (
                std::mem::take(&mut tx.flushed_deletes),
                std::mem::take(&mut tx.flushed_writes),
                std::mem::take(&mut tx.flushed_join_rows),
            )
        };
        for entity in deleted {
            entity.state_mut().deleted = crate::entity::DeletedState::Pending;
        }
        let restored = written.len();
        for (entity, saved) in written {
            entity.restore_flushed(saved);
        }
        self.inner.join_rows.borrow_mut().restore(join_rows);
        tracing::info!(restored, "Transaction rolled back");
        outcome
    }

    /// Run `f` inside a transaction, flush, and commit; roll back on any failure.
    pub async fn transaction<T, F>(&self, cx: &Cx, f: F) -> Outcome<T, Error>
    where
        F: for<'a> FnOnce(&'a EntityManager, &'a Cx) -> LocalBoxFuture<'a, Outcome<T, Error>>,
    {
        try_outcome!(self.begin_transaction(cx).await);
        let value = match f(self, cx).await {
            Outcome::Ok(value) => value,
            other => {
                self.abort(cx).await;
                return other;
            }
        };
        match self.flush(cx, FlushOptions::default()).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => {
                self.abort(cx).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(reason) => {
                self.abort(cx).await;
                return Outcome::Cancelled(reason);
            }
            Outcome::Panicked(payload) => {
                self.abort(cx).await;
                return Outcome::Panicked(payload);
            }
        }
        try_outcome!(self.commit(cx).await);
        Outcome::Ok(value)
    }

    async fn abort(&self, cx: &Cx) {
        if let Outcome::Err(e) = self.rollback(cx).await {
            tracing::warn!(error = %e, "Rollback failed");
        }
    }

    fn require_transaction(&self) -> Result<()> {
        if self.in_transaction() {
            Ok(())
        } else {
            Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotOpen,
                message: "no transaction is open".to_string(),
            }))
        }
    }
}

impl fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityManager")
            .field("entities", &self.inner.identity.borrow().len())
            .field("flushing", &self.is_flushing())
            .field("in_transaction", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

pub(crate) fn upgrade(weak: &Weak<ManagerInner>) -> Result<EntityManager> {
    weak.upgrade()
        .map(EntityManager::from_inner)
        .ok_or_else(|| Error::Custom("entity manager was dropped".to_string()))
}

fn row_id(meta: &EntityMetadata, row: &Row) -> Result<IdValue> {
    let value = row.require(meta.pk_column())?;
    IdValue::from_value(value).ok_or_else(|| {
        Error::Custom(format!(
            "{} row has unusable primary key {}",
            meta.name, value
        ))
    })
}

fn parse_id(meta: &EntityMetadata, id: &str) -> Result<IdValue> {
    IdValue::parse_tagged(id, meta.tag)
        .ok_or_else(|| Error::Custom(format!("'{}' is not a {} id", id, meta.name)))
}
