//! A [`Driver`] that renders Postgres-style SQL over a minimal executor.
//!
//! Write ordering within one flush:
//! - INSERT parent-first (ascending flush order)
//! - UPDATE in the same order
//! - DELETE child-first (descending flush order)
//!
//! Inserts of one table are sent as a single multi-row statement, deletes as
//! one `DELETE ... WHERE pk IN (...)`.

use crate::driver::{
    Condition, Driver, DriverFuture, EntityTodo, FindQuery, IsolationLevel, JoinTableTodo, Page,
    RowChange,
};
use crate::error::{Error, TypeError};
use crate::row::Row;
use crate::try_outcome;
use crate::value::{IdValue, Value};
use asupersync::{Cx, Outcome};

/// The two calls a SQL connection must offer to back a [`SqlDriver`].
pub trait SqlExecutor {
    fn query<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> DriverFuture<'a, Vec<Row>>;

    /// Execute a statement, returning the affected row count.
    fn execute<'a>(&'a self, cx: &'a Cx, sql: &'a str, params: &'a [Value])
    -> DriverFuture<'a, u64>;
}

/// SQL-rendering driver.
#[derive(Debug)]
pub struct SqlDriver<E> {
    executor: E,
}

impl<E: SqlExecutor> SqlDriver<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    async fn run(&self, cx: &Cx, sql: String, params: Vec<Value>) -> Outcome<u64, Error> {
        tracing::trace!(sql = %sql, params = params.len(), "Executing statement");
        self.executor.execute(cx, &sql, &params).await
    }

    #[tracing::instrument(level = "debug", skip(self, cx, todos))]
    async fn write_entities(&self, cx: &Cx, todos: &[EntityTodo]) -> Outcome<(), Error> {
        let mut ordered: Vec<&EntityTodo> = todos.iter().collect();
        ordered.sort_by_key(|t| t.flush_order);

        for todo in &ordered {
            for batch in batch_by_columns(&todo.inserts) {
                let (sql, params) = match render_insert(todo.table, todo.pk_column, &batch) {
                    Ok(rendered) => rendered,
                    Err(e) => return Outcome::Err(e),
                };
                try_outcome!(self.run(cx, sql, params).await);
            }
        }

        for todo in &ordered {
            for change in &todo.updates {
                if let Some((sql, params)) = render_update(todo.table, todo.pk_column, change) {
                    try_outcome!(self.run(cx, sql, params).await);
                }
            }
        }

        for todo in ordered.iter().rev() {
            if let Some((sql, params)) = render_delete(todo.table, todo.pk_column, &todo.deletes) {
                try_outcome!(self.run(cx, sql, params).await);
            }
        }

        Outcome::Ok(())
    }
}

impl<E: SqlExecutor> Driver for SqlDriver<E> {
    fn execute_find<'a>(
        &'a self,
        cx: &'a Cx,
        query: &'a FindQuery,
        page: Page,
    ) -> DriverFuture<'a, Vec<Row>> {
        Box::pin(async move {
            let (sql, params) = render_find(query, page);
            tracing::trace!(sql = %sql, "Executing find");
            self.executor.query(cx, &sql, &params).await
        })
    }

    fn execute_query<'a>(
        &'a self,
        cx: &'a Cx,
        sql: &'a str,
        params: &'a [Value],
    ) -> DriverFuture<'a, Vec<Row>> {
        self.executor.query(cx, sql, params)
    }

    fn begin<'a>(&'a self, cx: &'a Cx, isolation: IsolationLevel) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let sql = format!("BEGIN ISOLATION LEVEL {}", isolation.as_sql());
            self.run(cx, sql, Vec::new()).await.map(|_| ())
        })
    }

    fn commit<'a>(&'a self, cx: &'a Cx) -> DriverFuture<'a, ()> {
        Box::pin(async move { self.run(cx, "COMMIT".to_string(), Vec::new()).await.map(|_| ()) })
    }

    fn rollback<'a>(&'a self, cx: &'a Cx) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.run(cx, "ROLLBACK".to_string(), Vec::new())
                .await
                .map(|_| ())
        })
    }

    fn assign_new_ids<'a>(
        &'a self,
        cx: &'a Cx,
        todos: &'a mut [EntityTodo],
    ) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            for todo in todos.iter_mut() {
                let missing = todo.missing_ids();
                if missing == 0 {
                    continue;
                }
                let sql = format!(
                    "SELECT nextval('{}_id_seq') FROM generate_series(1, {})",
                    todo.table, missing
                );
                let rows = try_outcome!(self.executor.query(cx, &sql, &[]).await);
                let mut ids = Vec::with_capacity(rows.len());
                for row in &rows {
                    match row.get(0).and_then(IdValue::from_value) {
                        Some(id) => ids.push(id),
                        None => {
                            return Outcome::Err(Error::Type(TypeError {
                                expected: "sequence id",
                                actual: format!("{:?}", row.get(0)),
                                column: Some("nextval".to_string()),
                            }));
                        }
                    }
                }
                if ids.len() != missing {
                    return Outcome::Err(Error::Custom(format!(
                        "sequence for {} returned {} ids, expected {}",
                        todo.table,
                        ids.len(),
                        missing
                    )));
                }
                let mut ids = ids.into_iter();
                for insert in todo.inserts.iter_mut().filter(|r| r.id.is_none()) {
                    insert.id = ids.next();
                }
                tracing::debug!(table = todo.table, count = missing, "Assigned new ids");
            }
            Outcome::Ok(())
        })
    }

    fn flush_entities<'a>(&'a self, cx: &'a Cx, todos: &'a [EntityTodo]) -> DriverFuture<'a, ()> {
        Box::pin(self.write_entities(cx, todos))
    }

    fn flush_join_tables<'a>(
        &'a self,
        cx: &'a Cx,
        todos: &'a [JoinTableTodo],
    ) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            for todo in todos {
                for (a, b) in &todo.deletes {
                    let sql = format!(
                        "DELETE FROM \"{}\" WHERE \"{}\" = $1 AND \"{}\" = $2",
                        todo.table, todo.column1, todo.column2
                    );
                    try_outcome!(self.run(cx, sql, vec![a.to_value(), b.to_value()]).await);
                }
                if todo.inserts.is_empty() {
                    continue;
                }
                let mut sql = format!(
                    "INSERT INTO \"{}\" (\"{}\", \"{}\") VALUES ",
                    todo.table, todo.column1, todo.column2
                );
                let mut params = Vec::with_capacity(todo.inserts.len() * 2);
                for (i, (a, b)) in todo.inserts.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    sql.push_str(&format!("(${}, ${})", params.len() + 1, params.len() + 2));
                    params.push(a.to_value());
                    params.push(b.to_value());
                }
                // A pair added before either side was loaded may already exist.
                sql.push_str(" ON CONFLICT DO NOTHING");
                try_outcome!(self.run(cx, sql, params).await);
            }
            Outcome::Ok(())
        })
    }
}

/// Render a find as `SELECT *` with `$n` placeholders.
pub fn render_find(query: &FindQuery, page: Page) -> (String, Vec<Value>) {
    let mut sql = format!("SELECT * FROM \"{}\"", query.table);
    let mut params = Vec::new();
    let mut clauses = Vec::new();

    for condition in &query.conditions {
        match condition {
            Condition::Eq(col, value) => {
                params.push(value.clone());
                clauses.push(format!("\"{}\" = ${}", col, params.len()));
            }
            Condition::In(_, values) if values.is_empty() => clauses.push("FALSE".to_string()),
            Condition::In(col, values) => {
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|v| {
                        params.push(v.clone());
                        format!("${}", params.len())
                    })
                    .collect();
                clauses.push(format!("\"{}\" IN ({})", col, placeholders.join(", ")));
            }
            Condition::IsNull(col) => clauses.push(format!("\"{}\" IS NULL", col)),
        }
    }

    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    if !query.order_by.is_empty() {
        let order: Vec<String> = query
            .order_by
            .iter()
            .map(|o| format!("\"{}\" {}", o.column, if o.ascending { "ASC" } else { "DESC" }))
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }
    if let Some(limit) = page.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = page.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }
    (sql, params)
}

/// Group consecutive inserts that write the same column list.
fn batch_by_columns(rows: &[RowChange]) -> Vec<Vec<&RowChange>> {
    let mut batches: Vec<Vec<&RowChange>> = Vec::new();
    for row in rows {
        match batches.last_mut() {
            Some(batch) if batch[0].columns == row.columns => batch.push(row),
            _ => batches.push(vec![row]),
        }
    }
    batches
}

/// `INSERT INTO table ("id", "col1") VALUES ($1, $2), ($3, $4), ...`
#[allow(clippy::result_large_err)]
fn render_insert(
    table: &str,
    pk_column: &str,
    rows: &[&RowChange],
) -> crate::Result<(String, Vec<Value>)> {
    let Some(first) = rows.first() else {
        return Err(Error::Custom(format!("empty insert batch for {table}")));
    };
    let mut col_list = vec![format!("\"{}\"", pk_column)];
    col_list.extend(first.columns.iter().map(|c| format!("\"{}\"", c)));

    let mut sql = format!("INSERT INTO \"{}\" ({}) VALUES ", table, col_list.join(", "));
    let mut params: Vec<Value> = Vec::new();

    for (i, row) in rows.iter().enumerate() {
        let Some(id) = &row.id else {
            return Err(Error::Custom(format!(
                "insert into {table} has no primary key assigned"
            )));
        };
        if i > 0 {
            sql.push_str(", ");
        }
        params.push(id.to_value());
        let mut placeholders = vec![format!("${}", params.len())];
        for value in &row.values {
            params.push(value.clone());
            placeholders.push(format!("${}", params.len()));
        }
        sql.push('(');
        sql.push_str(&placeholders.join(", "));
        sql.push(')');
    }
    Ok((sql, params))
}

/// `UPDATE table SET col1 = $1, col2 = $2 WHERE pk = $3`
fn render_update(table: &str, pk_column: &str, change: &RowChange) -> Option<(String, Vec<Value>)> {
    let id = change.id.as_ref()?;
    if change.columns.is_empty() {
        return None;
    }
    let set_clause: Vec<String> = change
        .columns
        .iter()
        .enumerate()
        .map(|(i, col)| format!("\"{}\" = ${}", col, i + 1))
        .collect();
    let sql = format!(
        "UPDATE \"{}\" SET {} WHERE \"{}\" = ${}",
        table,
        set_clause.join(", "),
        pk_column,
        change.columns.len() + 1
    );
    let mut params = change.values.clone();
    params.push(id.to_value());
    Some((sql, params))
}

/// `DELETE FROM table WHERE pk IN ($1, $2, ...)`
fn render_delete(table: &str, pk_column: &str, ids: &[IdValue]) -> Option<(String, Vec<Value>)> {
    if ids.is_empty() {
        return None;
    }
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("${i}")).collect();
    let sql = format!(
        "DELETE FROM \"{}\" WHERE \"{}\" IN ({})",
        table,
        pk_column,
        placeholders.join(", ")
    );
    Some((sql, ids.iter().map(IdValue::to_value).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use std::cell::RefCell;

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    #[derive(Default)]
    struct RecordingExecutor {
        executed: RefCell<Vec<(String, Vec<Value>)>>,
        next_id: RefCell<i64>,
    }

    impl SqlExecutor for RecordingExecutor {
        fn query<'a>(
            &'a self,
            _cx: &'a Cx,
            sql: &'a str,
            _params: &'a [Value],
        ) -> DriverFuture<'a, Vec<Row>> {
            Box::pin(async move {
                self.executed.borrow_mut().push((sql.to_string(), Vec::new()));
                let count: usize = sql
                    .rsplit(", ")
                    .next()
                    .and_then(|s| s.trim_end_matches(')').parse().ok())
                    .unwrap_or(0);
                let mut rows = Vec::new();
                for _ in 0..count {
                    let mut next = self.next_id.borrow_mut();
                    *next += 1;
                    rows.push(Row::from_pairs([("nextval", Value::BigInt(*next))]));
                }
                Outcome::Ok(rows)
            })
        }

        fn execute<'a>(
            &'a self,
            _cx: &'a Cx,
            sql: &'a str,
            params: &'a [Value],
        ) -> DriverFuture<'a, u64> {
            Box::pin(async move {
                self.executed
                    .borrow_mut()
                    .push((sql.to_string(), params.to_vec()));
                Outcome::Ok(1)
            })
        }
    }

    fn insert(id: Option<i64>, name: &str) -> RowChange {
        let mut row = RowChange::new(id.map(IdValue::Int));
        row.push("name", Value::Text(name.to_string()));
        row
    }

    // ========================================================================
    // Rendering
    // ========================================================================

    #[test]
    fn test_render_find_with_in_and_page() {
        let query = FindQuery::new("books")
            .filter(Condition::In("author_id", vec![Value::BigInt(1), Value::BigInt(2)]))
            .filter(Condition::Eq("title", Value::Text("b1".into())))
            .order_by("id", true);
        let (sql, params) = render_find(&query, Page::new(10, 20));
        assert_eq!(
            sql,
            "SELECT * FROM \"books\" WHERE \"author_id\" IN ($1, $2) AND \"title\" = $3 ORDER BY \"id\" ASC LIMIT 10 OFFSET 20"
        );
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_render_find_empty_in_is_false() {
        let query = FindQuery::new("books").filter(Condition::In("id", Vec::new()));
        let (sql, params) = render_find(&query, Page::default());
        assert_eq!(sql, "SELECT * FROM \"books\" WHERE FALSE");
        assert!(params.is_empty());
    }

    #[test]
    fn test_render_insert_multi_row() {
        let a = insert(Some(1), "a1");
        let b = insert(Some(2), "a2");
        let (sql, params) = render_insert("authors", "id", &[&a, &b]).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"authors\" (\"id\", \"name\") VALUES ($1, $2), ($3, $4)"
        );
        assert_eq!(params[2], Value::BigInt(2));
    }

    #[test]
    fn test_render_insert_requires_id() {
        let a = insert(None, "a1");
        assert!(render_insert("authors", "id", &[&a]).is_err());
    }

    #[test]
    fn test_render_update_and_delete() {
        let change = insert(Some(7), "b2");
        let (sql, params) = render_update("books", "id", &change).unwrap();
        assert_eq!(sql, "UPDATE \"books\" SET \"name\" = $1 WHERE \"id\" = $2");
        assert_eq!(params, vec![Value::Text("b2".into()), Value::BigInt(7)]);

        assert!(render_update("books", "id", &RowChange::new(Some(IdValue::Int(7)))).is_none());

        let (sql, _) = render_delete("books", "id", &[IdValue::Int(1), IdValue::Int(2)]).unwrap();
        assert_eq!(sql, "DELETE FROM \"books\" WHERE \"id\" IN ($1, $2)");
        assert!(render_delete("books", "id", &[]).is_none());
    }

    #[test]
    fn test_batch_by_columns_splits_on_shape_change() {
        let a = insert(Some(1), "a1");
        let b = insert(Some(2), "a2");
        let mut c = RowChange::new(Some(IdValue::Int(3)));
        c.push("email", Value::Null);
        let rows = vec![a, b, c];
        let batches = batch_by_columns(&rows);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
    }

    // ========================================================================
    // Driver behavior
    // ========================================================================

    #[test]
    fn test_flush_orders_inserts_parent_first_and_deletes_child_first() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = SqlDriver::new(RecordingExecutor::default());

        let mut books = EntityTodo::new("Book", "books", "id", 1);
        books.inserts.push(insert(Some(10), "b1"));
        books.deletes.push(IdValue::Int(11));
        let mut authors = EntityTodo::new("Author", "authors", "id", 0);
        authors.inserts.push(insert(Some(1), "a1"));
        authors.deletes.push(IdValue::Int(2));

        rt.block_on(async {
            unwrap_outcome(driver.flush_entities(&cx, &[books, authors]).await);
        });

        let executed: Vec<String> = driver
            .executor()
            .executed
            .borrow()
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect();
        assert!(executed[0].starts_with("INSERT INTO \"authors\""));
        assert!(executed[1].starts_with("INSERT INTO \"books\""));
        assert!(executed[2].starts_with("DELETE FROM \"books\""));
        assert!(executed[3].starts_with("DELETE FROM \"authors\""));
    }

    #[test]
    fn test_assign_new_ids_fills_missing_only() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = SqlDriver::new(RecordingExecutor::default());

        let mut authors = EntityTodo::new("Author", "authors", "id", 0);
        authors.inserts.push(insert(None, "a1"));
        authors.inserts.push(insert(Some(99), "a2"));
        authors.inserts.push(insert(None, "a3"));
        let mut todos = vec![authors];

        rt.block_on(async {
            unwrap_outcome(driver.assign_new_ids(&cx, &mut todos).await);
        });

        let ids: Vec<Option<IdValue>> = todos[0].inserts.iter().map(|r| r.id.clone()).collect();
        assert_eq!(
            ids,
            vec![
                Some(IdValue::Int(1)),
                Some(IdValue::Int(99)),
                Some(IdValue::Int(2))
            ]
        );
        let executed = driver.executor().executed.borrow();
        assert_eq!(
            executed[0].0,
            "SELECT nextval('authors_id_seq') FROM generate_series(1, 2)"
        );
    }

    #[test]
    fn test_join_tables_delete_then_insert() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let driver = SqlDriver::new(RecordingExecutor::default());

        let todo = JoinTableTodo {
            table: "books_to_tags",
            column1: "book_id",
            column2: "tag_id",
            inserts: vec![
                (IdValue::Int(1), IdValue::Int(2)),
                (IdValue::Int(1), IdValue::Int(3)),
            ],
            deletes: vec![(IdValue::Int(1), IdValue::Int(4))],
        };

        rt.block_on(async {
            unwrap_outcome(driver.flush_join_tables(&cx, &[todo]).await);
        });

        let executed = driver.executor().executed.borrow();
        assert_eq!(
            executed[0].0,
            "DELETE FROM \"books_to_tags\" WHERE \"book_id\" = $1 AND \"tag_id\" = $2"
        );
        assert_eq!(
            executed[1].0,
            "INSERT INTO \"books_to_tags\" (\"book_id\", \"tag_id\") VALUES ($1, $2), ($3, $4) \
             ON CONFLICT DO NOTHING"
        );
        assert_eq!(executed[1].1.len(), 4);
    }
}
