//! The database driver contract.
//!
//! The unit of work never writes SQL itself; it hands parsed finds and
//! per-type batches of changes to a [`Driver`]:
//!
//! - [`Driver`] - object-safe trait consumed by the entity manager
//! - [`FindQuery`] / [`Condition`] / [`Page`] - the parsed shape of a find
//! - [`EntityTodo`] / [`JoinTableTodo`] - one flush worth of row changes
//! - [`IsolationLevel`] - SQL transaction isolation levels
//!
//! All operations take a `Cx` context for cancellation and return `Outcome`.

use crate::error::Error;
use crate::row::Row;
use crate::value::{IdValue, Value};
use asupersync::{Cx, Outcome};
use futures::future::LocalBoxFuture;

/// Boxed future returned by every driver operation.
pub type DriverFuture<'a, T> = LocalBoxFuture<'a, Outcome<T, Error>>;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read committed: Transactions only see committed changes from others.
    ReadCommitted,

    /// Repeatable read: Transactions see a consistent snapshot of the database.
    RepeatableRead,

    /// Serializable: Transactions appear to execute sequentially.
    ///
    /// Default for explicit transactions, so find-then-insert uniqueness
    /// checks in application code stay sound.
    #[default]
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// One predicate of a [`FindQuery`]. Predicates are AND-ed.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(&'static str, Value),
    In(&'static str, Vec<Value>),
    IsNull(&'static str),
}

impl Condition {
    pub fn column(&self) -> &'static str {
        match self {
            Condition::Eq(c, _) | Condition::In(c, _) | Condition::IsNull(c) => c,
        }
    }

    /// Evaluate against a row; used by in-memory drivers and by
    /// `find_with_new_or_changed` style matching.
    pub fn matches(&self, row: &Row) -> bool {
        let value = row.get_by_name(self.column()).unwrap_or(&Value::Null);
        match self {
            Condition::Eq(_, expected) => !value.is_null() && value.same_as(expected),
            Condition::In(_, options) => options.iter().any(|o| value.same_as(o)),
            Condition::IsNull(_) => value.is_null(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: &'static str,
    pub ascending: bool,
}

/// A parsed, dialect-free find: `SELECT * FROM table WHERE ... ORDER BY ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    pub table: &'static str,
    pub conditions: Vec<Condition>,
    pub order_by: Vec<OrderBy>,
}

impl FindQuery {
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            conditions: Vec::new(),
            order_by: Vec::new(),
        }
    }

    #[must_use]
    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: &'static str, ascending: bool) -> Self {
        self.order_by.push(OrderBy { column, ascending });
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}

/// LIMIT/OFFSET for the non-batched find path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Page {
    pub fn new(limit: u64, offset: u64) -> Self {
        Self {
            limit: Some(limit),
            offset: Some(offset),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.limit.is_none() && self.offset.is_none()
    }
}

/// The columns written for one row.
///
/// For inserts `id` is `None` until [`Driver::assign_new_ids`] fills it in,
/// and `columns` excludes the primary key column.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    pub id: Option<IdValue>,
    pub columns: Vec<&'static str>,
    pub values: Vec<Value>,
}

impl RowChange {
    pub fn new(id: Option<IdValue>) -> Self {
        Self {
            id,
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn push(&mut self, column: &'static str, value: Value) {
        self.columns.push(column);
        self.values.push(value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| *c == column)
            .map(|i| &self.values[i])
    }
}

/// All pending row changes for one entity type in one flush.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityTodo {
    pub entity: &'static str,
    pub table: &'static str,
    pub pk_column: &'static str,
    /// Topological flush position; lower flushes first for inserts.
    pub flush_order: usize,
    pub inserts: Vec<RowChange>,
    pub updates: Vec<RowChange>,
    pub deletes: Vec<IdValue>,
}

impl EntityTodo {
    pub fn new(
        entity: &'static str,
        table: &'static str,
        pk_column: &'static str,
        flush_order: usize,
    ) -> Self {
        Self {
            entity,
            table,
            pk_column,
            flush_order,
            inserts: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Number of inserts still waiting for a primary key.
    pub fn missing_ids(&self) -> usize {
        self.inserts.iter().filter(|r| r.id.is_none()).count()
    }
}

/// Pending link rows for one many-to-many join table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTableTodo {
    pub table: &'static str,
    pub column1: &'static str,
    pub column2: &'static str,
    pub inserts: Vec<(IdValue, IdValue)>,
    pub deletes: Vec<(IdValue, IdValue)>,
}

impl JoinTableTodo {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }
}

/// A database backend as seen by the unit of work.
///
/// Implementations are single-connection and single-threaded: the entity
/// manager owns one driver handle and never calls into it from two tasks at
/// once, so futures are `!Send` and borrow `self`.
///
/// `transaction(fn)` is expressed as the [`begin`](Driver::begin) /
/// [`commit`](Driver::commit) / [`rollback`](Driver::rollback) primitives;
/// the entity manager builds the closure-taking helper on top of them.
pub trait Driver {
    /// Run a parsed find. An unbounded `page` is the batched path.
    fn execute_find<'a>(
        &'a self,
        cx: &'a Cx,
        query: &'a FindQuery,
        page: Page,
    ) -> DriverFuture<'a, Vec<Row>>;

    /// Run raw SQL with positional bindings.
    fn execute_query<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> DriverFuture<'a, Vec<Row>>;

    fn begin<'a>(&'a self, cx: &'a Cx, isolation: IsolationLevel) -> DriverFuture<'a, ()>;

    fn commit<'a>(&'a self, cx: &'a Cx) -> DriverFuture<'a, ()>;

    fn rollback<'a>(&'a self, cx: &'a Cx) -> DriverFuture<'a, ()>;

    /// Fill in `id` for every insert that lacks one.
    fn assign_new_ids<'a>(
        &'a self,
        cx: &'a Cx,
        todos: &'a mut [EntityTodo],
    ) -> DriverFuture<'a, ()>;

    /// Write entity rows. `todos` arrive sorted by ascending `flush_order`.
    fn flush_entities<'a>(&'a self, cx: &'a Cx, todos: &'a [EntityTodo]) -> DriverFuture<'a, ()>;

    /// Write join rows, deletes before inserts. Inserting a pair that
    /// already exists must be a no-op.
    fn flush_join_tables<'a>(
        &'a self,
        cx: &'a Cx,
        todos: &'a [JoinTableTodo],
    ) -> DriverFuture<'a, ()>;
}
