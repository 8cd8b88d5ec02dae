//! In-memory driver and shared fixtures for the integration suites.
//!
//! `MemoryDriver` keeps one row vector per table, hands out ids from
//! per-table sequences and records every statement it runs so tests can
//! assert round trips and their order.

#![allow(dead_code)]

use sqlgraph::{
    Cx, Driver, DriverFuture, EntityBuilder, EntityManager, EntityManagerConfig, EntityTodo,
    Error, Field, FindQuery, IdValue, IsolationLevel, JoinTableTodo, MetadataRegistry, Outcome,
    Page, QueryError, QueryErrorKind, Row, Value,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

#[derive(Default)]
struct State {
    tables: BTreeMap<String, Vec<Row>>,
    sequences: HashMap<String, i64>,
    log: Vec<String>,
    finds: Vec<FindQuery>,
    snapshot: Option<BTreeMap<String, Vec<Row>>>,
    isolation: Option<IsolationLevel>,
    /// table -> constraint reported when inserting into it
    failing_inserts: HashMap<String, String>,
}

/// Clones share the same tables and log.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Rc<RefCell<State>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row without logging a statement.
    pub fn seed(&self, table: &str, pairs: &[(&str, Value)]) {
        let row = Row::from_pairs(pairs.iter().map(|(c, v)| (*c, v.clone())));
        let mut state = self.state.borrow_mut();
        if let Some(id) = row.get_by_name("id").and_then(Value::as_i64) {
            let seq = state.sequences.entry(table.to_string()).or_insert(0);
            *seq = (*seq).max(id);
        }
        state.tables.entry(table.to_string()).or_default().push(row);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .borrow()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: i64) -> Option<Row> {
        self.rows(table)
            .into_iter()
            .find(|r| r.get_by_name("id").and_then(Value::as_i64) == Some(id))
    }

    pub fn log(&self) -> Vec<String> {
        self.state.borrow().log.clone()
    }

    /// Statements starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .borrow()
            .log
            .iter()
            .filter(|s| s.starts_with(prefix))
            .count()
    }

    pub fn finds(&self) -> Vec<FindQuery> {
        self.state.borrow().finds.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.borrow_mut();
        state.log.clear();
        state.finds.clear();
    }

    pub fn last_isolation(&self) -> Option<IsolationLevel> {
        self.state.borrow().isolation
    }

    /// Make every insert into `table` fail with a violation of `constraint`.
    pub fn fail_inserts(&self, table: &str, constraint: &str) {
        self.state
            .borrow_mut()
            .failing_inserts
            .insert(table.to_string(), constraint.to_string());
    }

    fn record(&self, statement: String) {
        self.state.borrow_mut().log.push(statement);
    }

    fn write_entities(&self, todos: &[EntityTodo]) -> Result<(), Error> {
        let mut ordered: Vec<&EntityTodo> = todos.iter().collect();
        ordered.sort_by_key(|t| t.flush_order);
        let mut state = self.state.borrow_mut();

        for todo in &ordered {
            if todo.inserts.is_empty() {
                continue;
            }
            state.log.push(format!("INSERT {}", todo.table));
            if let Some(constraint) = state.failing_inserts.get(todo.table) {
                let mut error = QueryError::new(QueryErrorKind::Constraint, "duplicate key value");
                error.sqlstate = Some("23505".to_string());
                error.constraint = Some(constraint.clone());
                return Err(Error::Query(error));
            }
            for change in &todo.inserts {
                let id = change
                    .id
                    .clone()
                    .ok_or_else(|| Error::Custom(format!("insert into {} without id", todo.table)))?;
                let mut row = Row::from_pairs([(todo.pk_column, id.to_value())]);
                for (column, value) in change.columns.iter().zip(&change.values) {
                    row.set(column, value.clone());
                }
                state.tables.entry(todo.table.to_string()).or_default().push(row);
            }
        }

        for todo in &ordered {
            for change in &todo.updates {
                state.log.push(format!("UPDATE {}", todo.table));
                let rows = state.tables.entry(todo.table.to_string()).or_default();
                let target = change.id.as_ref().map(IdValue::to_value);
                for row in rows.iter_mut() {
                    let hit = match (&target, row.get_by_name(todo.pk_column)) {
                        (Some(id), Some(value)) => value.same_as(id),
                        _ => false,
                    };
                    if hit {
                        for (column, value) in change.columns.iter().zip(&change.values) {
                            row.set(column, value.clone());
                        }
                    }
                }
            }
        }

        for todo in ordered.iter().rev() {
            if todo.deletes.is_empty() {
                continue;
            }
            state.log.push(format!("DELETE {}", todo.table));
            let ids: Vec<Value> = todo.deletes.iter().map(IdValue::to_value).collect();
            if let Some(rows) = state.tables.get_mut(todo.table) {
                rows.retain(|row| {
                    let id = row.get_by_name(todo.pk_column).cloned().unwrap_or(Value::Null);
                    !ids.iter().any(|d| d.same_as(&id))
                });
            }
        }
        Ok(())
    }

    fn write_join_rows(&self, todos: &[JoinTableTodo]) {
        let mut state = self.state.borrow_mut();
        for todo in todos {
            if !todo.deletes.is_empty() {
                state.log.push(format!("DELETE {}", todo.table));
                if let Some(rows) = state.tables.get_mut(todo.table) {
                    rows.retain(|row| {
                        !todo.deletes.iter().any(|(a, b)| {
                            row.get_by_name(todo.column1).is_some_and(|v| v.same_as(&a.to_value()))
                                && row
                                    .get_by_name(todo.column2)
                                    .is_some_and(|v| v.same_as(&b.to_value()))
                        })
                    });
                }
            }
            if !todo.inserts.is_empty() {
                state.log.push(format!("INSERT {}", todo.table));
                let rows = state.tables.entry(todo.table.to_string()).or_default();
                for (a, b) in &todo.inserts {
                    let exists = rows.iter().any(|row| {
                        row.get_by_name(todo.column1).is_some_and(|v| v.same_as(&a.to_value()))
                            && row
                                .get_by_name(todo.column2)
                                .is_some_and(|v| v.same_as(&b.to_value()))
                    });
                    if exists {
                        continue;
                    }
                    rows.push(Row::from_pairs([
                        (todo.column1, a.to_value()),
                        (todo.column2, b.to_value()),
                    ]));
                }
            }
        }
    }
}

fn done<'a, T: 'a>(value: Result<T, Error>) -> DriverFuture<'a, T> {
    Box::pin(async move {
        match value {
            Ok(v) => Outcome::Ok(v),
            Err(e) => Outcome::Err(e),
        }
    })
}

impl Driver for MemoryDriver {
    fn execute_find<'a>(
        &'a self,
        _cx: &'a Cx,
        query: &'a FindQuery,
        page: Page,
    ) -> DriverFuture<'a, Vec<Row>> {
        self.record(format!("SELECT {}", query.table));
        self.state.borrow_mut().finds.push(query.clone());
        let mut rows: Vec<Row> = self
            .rows(query.table)
            .into_iter()
            .filter(|row| query.matches(row))
            .collect();
        for order in query.order_by.iter().rev() {
            rows.sort_by(|a, b| {
                let key = |row: &Row| row.get_by_name(order.column).map(ToString::to_string);
                let ordering = key(a).cmp(&key(b));
                if order.ascending { ordering } else { ordering.reverse() }
            });
        }
        let offset = usize::try_from(page.offset.unwrap_or(0)).unwrap_or(usize::MAX);
        let limit = page
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        done(Ok(rows.into_iter().skip(offset).take(limit).collect()))
    }

    /// Understands `SELECT * FROM <table>` only.
    fn execute_query<'a>(
        &'a self,
        _cx: &'a Cx,
        sql: &'a str,
        _params: &'a [Value],
    ) -> DriverFuture<'a, Vec<Row>> {
        self.record(format!("QUERY {sql}"));
        let rows = sql
            .strip_prefix("SELECT * FROM ")
            .map(|table| self.rows(table.trim()))
            .ok_or_else(|| Error::Custom(format!("unsupported sql: {sql}")));
        done(rows)
    }

    fn begin<'a>(&'a self, _cx: &'a Cx, isolation: IsolationLevel) -> DriverFuture<'a, ()> {
        let mut state = self.state.borrow_mut();
        state.log.push("BEGIN".to_string());
        state.isolation = Some(isolation);
        state.snapshot = Some(state.tables.clone());
        done(Ok(()))
    }

    fn commit<'a>(&'a self, _cx: &'a Cx) -> DriverFuture<'a, ()> {
        let mut state = self.state.borrow_mut();
        state.log.push("COMMIT".to_string());
        state.snapshot = None;
        done(Ok(()))
    }

    fn rollback<'a>(&'a self, _cx: &'a Cx) -> DriverFuture<'a, ()> {
        let mut state = self.state.borrow_mut();
        state.log.push("ROLLBACK".to_string());
        if let Some(snapshot) = state.snapshot.take() {
            state.tables = snapshot;
        }
        done(Ok(()))
    }

    fn assign_new_ids<'a>(
        &'a self,
        _cx: &'a Cx,
        todos: &'a mut [EntityTodo],
    ) -> DriverFuture<'a, ()> {
        let mut state = self.state.borrow_mut();
        for todo in todos.iter_mut() {
            let seq = state.sequences.entry(todo.table.to_string()).or_insert(0);
            for change in &mut todo.inserts {
                if change.id.is_none() {
                    *seq += 1;
                    change.id = Some(IdValue::Int(*seq));
                }
            }
        }
        done(Ok(()))
    }

    fn flush_entities<'a>(&'a self, _cx: &'a Cx, todos: &'a [EntityTodo]) -> DriverFuture<'a, ()> {
        done(self.write_entities(todos))
    }

    fn flush_join_tables<'a>(
        &'a self,
        _cx: &'a Cx,
        todos: &'a [JoinTableTodo],
    ) -> DriverFuture<'a, ()> {
        self.write_join_rows(todos);
        done(Ok(()))
    }
}

/// Drive a unit-of-work future on the current thread.
pub fn run<F: Future>(future: F) -> F::Output {
    futures::executor::block_on(future)
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

// ============================================================================
// Fixture model
// ============================================================================

pub fn publisher() -> EntityBuilder {
    EntityBuilder::new("Publisher", "p", "publishers")
        .primary_key("id")
        .field(Field::primitive("name").required())
        .field(Field::one_to_many("authors", "Author", "publisher").cascade_delete())
}

pub fn author() -> EntityBuilder {
    EntityBuilder::new("Author", "a", "authors")
        .primary_key("id")
        .field(Field::primitive("first_name").required().max_length(20))
        .field(Field::primitive("email").pattern(r"^[^@\s]+@[^@\s]+$"))
        .field(Field::primitive("number_of_books"))
        .field(Field::many_to_one("publisher", "publisher_id", "Publisher", "authors"))
        .field(Field::one_to_many("books", "Book", "author").cascade_delete())
        .field(Field::one_to_one("image", "Image", "author"))
        .reactive_field("number_of_books", "books", |author| {
            let books = author.one_to_many(author.field_id("books")?).get()?;
            Ok(Value::BigInt(i64::try_from(books.len()).unwrap_or(i64::MAX)))
        })
}

pub fn book() -> EntityBuilder {
    EntityBuilder::new("Book", "b", "books")
        .primary_key("id")
        .field(Field::primitive("title").required())
        .field(Field::many_to_one("author", "author_id", "Author", "books").required())
        .field(Field::one_to_many("reviews", "BookReview", "book").cascade_delete())
        .field(Field::many_to_many("tags", "Tag", "books", "books_to_tags", "book_id", "tag_id"))
}

pub fn review() -> EntityBuilder {
    EntityBuilder::new("BookReview", "br", "book_reviews")
        .primary_key("id")
        .field(Field::primitive("rating").required())
        .field(Field::many_to_one("book", "book_id", "Book", "reviews").required())
}

pub fn tag() -> EntityBuilder {
    EntityBuilder::new("Tag", "t", "tags")
        .primary_key("id")
        .field(Field::primitive("name").required())
        .field(Field::many_to_many("books", "Book", "tags", "books_to_tags", "tag_id", "book_id"))
}

pub fn image() -> EntityBuilder {
    EntityBuilder::new("Image", "i", "images")
        .primary_key("id")
        .field(Field::primitive("file_name").required())
        .field(Field::many_to_one("author", "author_id", "Author", "image"))
}

pub fn comment() -> EntityBuilder {
    EntityBuilder::new("Comment", "c", "comments")
        .primary_key("id")
        .field(Field::primitive("text").required())
        .field(Field::polymorphic(
            "parent",
            &[("Book", "parent_book_id", "comments"), ("Author", "parent_author_id", "comments")],
        ))
}

/// The fixture entities, each with the given extra declarations applied.
pub fn registry_with(
    customize: impl Fn(&'static str, EntityBuilder) -> EntityBuilder,
) -> Arc<MetadataRegistry> {
    let entities = [
        ("Publisher", publisher()),
        ("Author", author().field(Field::one_to_many("comments", "Comment", "parent"))),
        ("Book", book().field(Field::one_to_many("comments", "Comment", "parent"))),
        ("BookReview", review()),
        ("Tag", tag()),
        ("Image", image()),
        ("Comment", comment()),
    ];
    let mut builder = MetadataRegistry::builder();
    for (name, entity) in entities {
        builder = builder.entity(customize(name, entity));
    }
    match builder.build() {
        Ok(registry) => registry,
        Err(e) => panic!("fixture registry is invalid: {e}"),
    }
}

pub fn registry() -> Arc<MetadataRegistry> {
    registry_with(|_, entity| entity)
}

pub fn manager(driver: &MemoryDriver) -> EntityManager {
    EntityManager::new(registry(), driver.clone())
}

pub fn manager_with(driver: &MemoryDriver, config: EntityManagerConfig) -> EntityManager {
    EntityManager::with_config(registry(), driver.clone(), config)
}

/// Publisher 1; authors 1 and 2 (author 1 published by 1); books 1 and 2
/// by author 1, book 3 by author 2; review 1 on book 1; tag 1 on book 1.
pub fn seed_library(driver: &MemoryDriver) {
    driver.seed("publishers", &[("id", Value::BigInt(1)), ("name", Value::from("p1"))]);
    for (id, name, publisher) in [(1, "a1", Value::BigInt(1)), (2, "a2", Value::Null)] {
        driver.seed(
            "authors",
            &[
                ("id", Value::BigInt(id)),
                ("first_name", Value::from(name)),
                ("email", Value::Null),
                ("number_of_books", Value::BigInt(if id == 1 { 2 } else { 1 })),
                ("publisher_id", publisher),
            ],
        );
    }
    for (id, title, author) in [(1, "b1", 1), (2, "b2", 1), (3, "b3", 2)] {
        driver.seed(
            "books",
            &[
                ("id", Value::BigInt(id)),
                ("title", Value::from(title)),
                ("author_id", Value::BigInt(author)),
            ],
        );
    }
    driver.seed(
        "book_reviews",
        &[
            ("id", Value::BigInt(1)),
            ("rating", Value::BigInt(5)),
            ("book_id", Value::BigInt(1)),
        ],
    );
    driver.seed("tags", &[("id", Value::BigInt(1)), ("name", Value::from("t1"))]);
    driver.seed(
        "books_to_tags",
        &[("book_id", Value::BigInt(1)), ("tag_id", Value::BigInt(1))],
    );
}
