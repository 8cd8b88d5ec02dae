//! Many-to-many join rows tracked independently of either side's load state.
//!
//! Rows are stored once per join table in a canonical orientation (`left` is
//! the entity whose id goes in `column1`), so both sides of the relation read
//! and write the same row. Adding or removing before either side is loaded
//! still produces the right INSERT/DELETE at flush.

use crate::entity::EntityRef;
use sqlgraph_core::{Error, IdValue, JoinTableTodo, Result};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RowOrigin {
    /// Added in this unit of work.
    New,
    /// Read from the database.
    Persisted,
    /// Removed before either side was loaded; may or may not exist.
    Unknown,
}

#[derive(Debug, Clone)]
pub(crate) struct JoinRow {
    pub left: EntityRef,
    pub right: EntityRef,
    pub origin: RowOrigin,
    pub deleted: bool,
}

impl JoinRow {
    fn other(&self, entity: &EntityRef) -> &EntityRef {
        if &self.left == entity {
            &self.right
        } else {
            &self.left
        }
    }
}

#[derive(Debug)]
pub(crate) struct JoinTable {
    pub column1: &'static str,
    pub column2: &'static str,
    rows: Vec<JoinRow>,
}

impl JoinTable {
    fn position(&self, left: &EntityRef, right: &EntityRef) -> Option<usize> {
        self.rows
            .iter()
            .position(|r| &r.left == left && &r.right == right)
    }
}

/// A side of a join table as seen from one many-to-many field.
#[derive(Debug, Clone, Copy)]
pub(crate) struct JoinSide {
    pub table: &'static str,
    pub column1: &'static str,
    pub column2: &'static str,
    /// Whether the owning field's entity is stored in `column1`.
    pub owner_is_left: bool,
}

impl JoinSide {
    pub fn new(table: &'static str, column: &'static str, other_column: &'static str) -> Self {
        if column <= other_column {
            Self {
                table,
                column1: column,
                column2: other_column,
                owner_is_left: true,
            }
        } else {
            Self {
                table,
                column1: other_column,
                column2: column,
                owner_is_left: false,
            }
        }
    }

    pub fn orient(&self, owner: &EntityRef, other: &EntityRef) -> (EntityRef, EntityRef) {
        if self.owner_is_left {
            (owner.clone(), other.clone())
        } else {
            (other.clone(), owner.clone())
        }
    }

    /// The owner-side column, e.g. for loading one side by owner id.
    pub fn owner_column(&self) -> &'static str {
        if self.owner_is_left {
            self.column1
        } else {
            self.column2
        }
    }

    pub fn other_column(&self) -> &'static str {
        if self.owner_is_left {
            self.column2
        } else {
            self.column1
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct JoinRows {
    tables: BTreeMap<&'static str, JoinTable>,
}

impl JoinRows {
    fn table(&mut self, side: &JoinSide) -> &mut JoinTable {
        self.tables.entry(side.table).or_insert_with(|| JoinTable {
            column1: side.column1,
            column2: side.column2,
            rows: Vec::new(),
        })
    }

    /// Returns whether membership changed.
    pub fn add(&mut self, side: &JoinSide, owner: &EntityRef, other: &EntityRef) -> bool {
        let (left, right) = side.orient(owner, other);
        let table = self.table(side);
        match table.position(&left, &right) {
            Some(i) if table.rows[i].deleted => {
                table.rows[i].deleted = false;
                true
            }
            Some(_) => false,
            None => {
                table.rows.push(JoinRow {
                    left,
                    right,
                    origin: RowOrigin::New,
                    deleted: false,
                });
                true
            }
        }
    }

    /// Returns whether membership changed.
    pub fn remove(&mut self, side: &JoinSide, owner: &EntityRef, other: &EntityRef) -> bool {
        let (left, right) = side.orient(owner, other);
        let table = self.table(side);
        match table.position(&left, &right) {
            Some(i) if table.rows[i].deleted => false,
            Some(i) if table.rows[i].origin == RowOrigin::New => {
                table.rows.remove(i);
                true
            }
            Some(i) => {
                table.rows[i].deleted = true;
                true
            }
            None => {
                table.rows.push(JoinRow {
                    left,
                    right,
                    origin: RowOrigin::Unknown,
                    deleted: true,
                });
                true
            }
        }
    }

    /// Record a row read from the database; local changes to it win.
    pub fn register_persisted(&mut self, side: &JoinSide, owner: &EntityRef, other: &EntityRef) {
        let (left, right) = side.orient(owner, other);
        let table = self.table(side);
        match table.position(&left, &right) {
            Some(i) => table.rows[i].origin = RowOrigin::Persisted,
            None => table.rows.push(JoinRow {
                left,
                right,
                origin: RowOrigin::Persisted,
                deleted: false,
            }),
        }
    }

    pub fn find(&self, side: &JoinSide, owner: &EntityRef, other: &EntityRef) -> Option<&JoinRow> {
        let (left, right) = side.orient(owner, other);
        let table = self.tables.get(side.table)?;
        table.position(&left, &right).map(|i| &table.rows[i])
    }

    /// Live members of `owner`'s side, in insertion order.
    pub fn targets(&self, side: &JoinSide, owner: &EntityRef) -> Vec<EntityRef> {
        let Some(table) = self.tables.get(side.table) else {
            return Vec::new();
        };
        table
            .rows
            .iter()
            .filter(|r| !r.deleted)
            .filter(|r| {
                if side.owner_is_left {
                    &r.left == owner
                } else {
                    &r.right == owner
                }
            })
            .map(|r| r.other(owner).clone())
            .collect()
    }

    pub fn has_changes(&self) -> bool {
        self.tables
            .values()
            .flat_map(|t| t.rows.iter())
            .any(|r| r.deleted || r.origin != RowOrigin::Persisted)
    }

    /// Join-table writes for this flush. Entity ids must already be assigned.
    pub fn todos(&self) -> Result<Vec<JoinTableTodo>> {
        let mut todos = Vec::new();
        for (name, table) in &self.tables {
            let mut todo = JoinTableTodo {
                table: name,
                column1: table.column1,
                column2: table.column2,
                inserts: Vec::new(),
                deletes: Vec::new(),
            };
            for row in &table.rows {
                // Rows whose far side was created and deleted in this unit of
                // work never reached the database.
                let unsaved_and_gone = |e: &EntityRef| e.is_new() && e.is_deleted();
                if unsaved_and_gone(&row.left) || unsaved_and_gone(&row.right) {
                    continue;
                }
                let pair = || -> Result<(IdValue, IdValue)> { Ok((id_of(&row.left)?, id_of(&row.right)?)) };
                match (row.origin, row.deleted) {
                    (RowOrigin::New, false) => todo.inserts.push(pair()?),
                    (RowOrigin::Persisted | RowOrigin::Unknown, true) => {
                        todo.deletes.push(pair()?);
                    }
                    // Removed and re-added before load: replace whatever exists.
                    (RowOrigin::Unknown, false) => {
                        let pair = pair()?;
                        todo.deletes.push(pair.clone());
                        todo.inserts.push(pair);
                    }
                    (RowOrigin::Persisted, false) | (RowOrigin::New, true) => {}
                }
            }
            if !todo.is_empty() {
                todos.push(todo);
            }
        }
        Ok(todos)
    }

    /// After a successful flush: drop deleted rows, everything else is persisted.
    ///
    /// Returns the rows this changed, as they were before, keyed by table.
    pub fn compact(&mut self) -> Vec<(&'static str, JoinRow)> {
        let mut settled = Vec::new();
        for (name, table) in &mut self.tables {
            for row in &table.rows {
                let gone = row.deleted || row.left.is_deleted() || row.right.is_deleted();
                if gone || row.origin != RowOrigin::Persisted {
                    settled.push((*name, row.clone()));
                }
            }
            table.rows.retain(|r| {
                !r.deleted && !(r.left.is_deleted() || r.right.is_deleted())
            });
            for row in &mut table.rows {
                row.origin = RowOrigin::Persisted;
            }
        }
        settled
    }

    /// Undo `compact` for flushes whose transaction rolled back.
    ///
    /// `settled` is in flush order; the first entry per pair tells what the
    /// database holds again.
    pub fn restore(&mut self, settled: Vec<(&'static str, JoinRow)>) {
        let mut seen = HashSet::new();
        for (name, before) in settled {
            if !seen.insert((name, before.left.clone(), before.right.clone())) {
                continue;
            }
            let Some(table) = self.tables.get_mut(name) else {
                continue;
            };
            match table.position(&before.left, &before.right) {
                Some(i) if before.origin == RowOrigin::New && table.rows[i].deleted => {
                    table.rows.remove(i);
                }
                Some(i) => table.rows[i].origin = before.origin,
                // Removed since: a row that may exist must be deleted again.
                None if before.origin != RowOrigin::New => table.rows.push(JoinRow {
                    deleted: true,
                    ..before
                }),
                None => {}
            }
        }
    }
}

fn id_of(entity: &EntityRef) -> Result<IdValue> {
    entity
        .id()
        .ok_or_else(|| Error::Custom(format!("{entity} has no id for its join row")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Slot;
    use crate::metadata::EntityBuilder;
    use std::rc::Weak;
    use std::sync::Arc;

    fn entity(name: &'static str, tag: &'static str, id: i64) -> EntityRef {
        let meta = Arc::new(
            EntityBuilder::new(name, tag, "t")
                .primary_key("id")
                .finish(0)
                .unwrap(),
        );
        EntityRef::new(
            meta,
            Weak::new(),
            id as u64,
            Some(IdValue::Int(id)),
            vec![Slot::NULL],
            false,
        )
    }

    fn sides() -> (JoinSide, JoinSide) {
        (
            JoinSide::new("authors_to_tags", "author_id", "tag_id"),
            JoinSide::new("authors_to_tags", "tag_id", "author_id"),
        )
    }

    #[test]
    fn both_sides_share_one_row() {
        let (author_side, tag_side) = sides();
        let a = entity("Author", "a", 1);
        let t = entity("Tag", "t", 2);
        let mut rows = JoinRows::default();

        assert!(rows.add(&author_side, &a, &t));
        assert!(!rows.add(&tag_side, &t, &a));
        assert_eq!(rows.targets(&author_side, &a), vec![t.clone()]);
        assert_eq!(rows.targets(&tag_side, &t), vec![a.clone()]);

        let todos = rows.todos().unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].column1, "author_id");
        assert_eq!(todos[0].inserts, vec![(IdValue::Int(1), IdValue::Int(2))]);
    }

    #[test]
    fn add_then_remove_of_new_row_is_a_no_op() {
        let (author_side, _) = sides();
        let a = entity("Author", "a", 1);
        let t = entity("Tag", "t", 2);
        let mut rows = JoinRows::default();
        rows.add(&author_side, &a, &t);
        rows.remove(&author_side, &a, &t);
        assert!(!rows.has_changes());
        assert!(rows.todos().unwrap().is_empty());
    }

    #[test]
    fn remove_before_load_emits_delete() {
        let (author_side, tag_side) = sides();
        let a = entity("Author", "a", 1);
        let t = entity("Tag", "t", 2);
        let mut rows = JoinRows::default();
        assert!(rows.remove(&tag_side, &t, &a));
        // Loading later must not resurrect the row.
        rows.register_persisted(&author_side, &a, &t);
        assert!(rows.targets(&author_side, &a).is_empty());
        let todos = rows.todos().unwrap();
        assert_eq!(todos[0].deletes, vec![(IdValue::Int(1), IdValue::Int(2))]);
        assert!(todos[0].inserts.is_empty());

        rows.compact();
        assert!(!rows.has_changes());
    }

    #[test]
    fn removing_a_persisted_row_deletes_it() {
        let (author_side, tag_side) = sides();
        let a = entity("Author", "a", 1);
        let t1 = entity("Tag", "t", 2);
        let t2 = entity("Tag", "t", 3);
        let mut rows = JoinRows::default();
        rows.register_persisted(&author_side, &a, &t1);
        rows.add(&author_side, &a, &t2);
        assert!(rows.remove(&tag_side, &t1, &a));
        assert!(!rows.remove(&tag_side, &t1, &a));
        assert_eq!(rows.targets(&author_side, &a), vec![t2]);
        let todos = rows.todos().unwrap();
        assert_eq!(todos[0].deletes, vec![(IdValue::Int(1), IdValue::Int(2))]);
        assert_eq!(todos[0].inserts, vec![(IdValue::Int(1), IdValue::Int(3))]);
    }

    #[test]
    fn restore_brings_back_rows_written_by_a_rolled_back_flush() {
        let (author_side, _) = sides();
        let a = entity("Author", "a", 1);
        let t1 = entity("Tag", "t", 2);
        let t2 = entity("Tag", "t", 3);
        let mut rows = JoinRows::default();
        rows.register_persisted(&author_side, &a, &t1);
        rows.remove(&author_side, &a, &t1);
        rows.add(&author_side, &a, &t2);
        let before = rows.todos().unwrap();

        let settled = rows.compact();
        assert_eq!(settled.len(), 2);
        assert!(!rows.has_changes());

        rows.restore(settled);
        assert_eq!(rows.targets(&author_side, &a), vec![t2]);
        let after = rows.todos().unwrap();
        assert_eq!(after[0].deletes, before[0].deletes);
        assert_eq!(after[0].inserts, before[0].inserts);
    }

    #[test]
    fn restore_keeps_the_earliest_state_of_a_pair() {
        let (author_side, _) = sides();
        let a = entity("Author", "a", 1);
        let t = entity("Tag", "t", 2);
        let mut rows = JoinRows::default();
        rows.add(&author_side, &a, &t);
        let mut settled = rows.compact();
        // Removed again by a second flush in the same transaction.
        rows.remove(&author_side, &a, &t);
        settled.extend(rows.compact());

        rows.restore(settled);
        assert!(rows.targets(&author_side, &a).is_empty());
        assert!(rows.todos().unwrap().is_empty());
    }
}
