//! Equality filters usable both as a database query and against managed entities.

use crate::entity::{EntityRef, Slot};
use crate::field_index::IndexKey;
use crate::metadata::{EntityMetadata, FieldId, FieldKind};
use sqlgraph_core::{Condition, Error, FindQuery, Result, Value};
use std::fmt;

/// A filter operand: a plain value, or an entity for reference fields.
#[derive(Debug, Clone)]
pub enum FilterValue {
    Value(Value),
    Entity(EntityRef),
}

impl FilterValue {
    fn slot(&self) -> Slot {
        match self {
            FilterValue::Value(v) => Slot::Value(v.clone()),
            FilterValue::Entity(e) => Slot::Entity(e.clone()),
        }
    }
}

macro_rules! filter_value_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for FilterValue {
                fn from(value: $ty) -> Self {
                    FilterValue::Value(value.into())
                }
            }
        )*
    };
}

filter_value_from!(Value, bool, i32, i64, f64, String, &str);

impl From<&EntityRef> for FilterValue {
    fn from(entity: &EntityRef) -> Self {
        FilterValue::Entity(entity.clone())
    }
}

#[derive(Debug, Clone)]
enum Clause {
    Eq(&'static str, FilterValue),
    In(&'static str, Vec<FilterValue>),
    IsNull(&'static str),
}

impl Clause {
    fn field(&self) -> &'static str {
        match self {
            Clause::Eq(f, _) | Clause::In(f, _) | Clause::IsNull(f) => f,
        }
    }
}

/// Conditions on field names, ANDed together.
///
/// ```ignore
/// let filter = Filter::new().eq("title", "b1").entity("author", &a1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<Clause>,
    order_by: Vec<(&'static str, bool)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &'static str, value: impl Into<FilterValue>) -> Self {
        self.clauses.push(Clause::Eq(field, value.into()));
        self
    }

    /// Reference equality; matches unsaved targets in memory.
    pub fn entity(self, field: &'static str, target: &EntityRef) -> Self {
        self.eq(field, FilterValue::Entity(target.clone()))
    }

    pub fn in_<I, V>(mut self, field: &'static str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<FilterValue>,
    {
        self.clauses
            .push(Clause::In(field, values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn is_null(mut self, field: &'static str) -> Self {
        self.clauses.push(Clause::IsNull(field));
        self
    }

    pub fn order_by(mut self, field: &'static str, ascending: bool) -> Self {
        self.order_by.push((field, ascending));
        self
    }

    /// The database query, or `None` when no stored row can match (e.g. a
    /// reference to an entity that has no id yet).
    pub fn to_query(&self, meta: &EntityMetadata) -> Result<Option<FindQuery>> {
        let mut query = FindQuery::new(meta.table);
        for clause in &self.clauses {
            let field = field_id(meta, clause.field())?;
            let condition = match clause {
                Clause::Eq(_, value) => match column_value(meta, field, value)? {
                    Some((column, value)) => Condition::Eq(column, value),
                    None => return Ok(None),
                },
                Clause::In(_, values) => {
                    let mut column = None;
                    let mut list = Vec::with_capacity(values.len());
                    for value in values {
                        if let Some((c, v)) = column_value(meta, field, value)? {
                            column = Some(c);
                            list.push(v);
                        }
                    }
                    match column {
                        Some(column) => Condition::In(column, list),
                        None => return Ok(None),
                    }
                }
                Clause::IsNull(_) => match &meta.field(field).kind {
                    FieldKind::Polymorphic { components, .. } => {
                        for component in components {
                            query = query.filter(Condition::IsNull(component.column));
                        }
                        continue;
                    }
                    kind => Condition::IsNull(plain_column(meta, field, kind)?),
                },
            };
            query = query.filter(condition);
        }
        for (name, ascending) in &self.order_by {
            let field = field_id(meta, name)?;
            let column = plain_column(meta, field, &meta.field(field).kind)?;
            query = query.order_by(column, *ascending);
        }
        Ok(Some(query))
    }

    /// Evaluate against an entity's current in-memory values.
    pub fn matches(&self, entity: &EntityRef) -> Result<bool> {
        let meta = entity.meta();
        for clause in &self.clauses {
            let field = field_id(meta, clause.field())?;
            let slot = entity.slot(field);
            let hit = match clause {
                Clause::Eq(_, value) => !slot.is_null() && slot.same_as(&value.slot()),
                Clause::In(_, values) => values.iter().any(|v| slot.same_as(&v.slot())),
                Clause::IsNull(_) => slot.is_null(),
            };
            if !hit {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The first equality clause, as index probe keys.
    pub(crate) fn index_probe(&self, meta: &EntityMetadata) -> Option<(FieldId, Vec<IndexKey>)> {
        self.clauses.iter().find_map(|clause| {
            let Clause::Eq(name, value) = clause else {
                return None;
            };
            let field = meta.field_id(name)?;
            let tagged = matches!(meta.field(field).kind, FieldKind::Polymorphic { .. });
            let keys = match value {
                FilterValue::Value(v) => vec![IndexKey::of_value(v)],
                FilterValue::Entity(e) => IndexKey::of_target(e, tagged),
            };
            Some((field, keys))
        })
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .clauses
            .iter()
            .map(|clause| match clause {
                Clause::Eq(field, value) => format!("{field}={}", operand(value)),
                Clause::In(field, values) => format!(
                    "{field} in ({})",
                    values.iter().map(operand).collect::<Vec<_>>().join(", ")
                ),
                Clause::IsNull(field) => format!("{field} is null"),
            })
            .collect();
        f.write_str(&parts.join(" and "))
    }
}

fn operand(value: &FilterValue) -> String {
    match value {
        FilterValue::Value(v) => v.to_string(),
        FilterValue::Entity(e) => e.to_string(),
    }
}

fn field_id(meta: &EntityMetadata, name: &str) -> Result<FieldId> {
    meta.field_id(name)
        .ok_or_else(|| Error::Custom(format!("{} has no field '{}'", meta.name, name)))
}

fn plain_column(meta: &EntityMetadata, field: FieldId, kind: &FieldKind) -> Result<&'static str> {
    match kind {
        FieldKind::PrimaryKey { column }
        | FieldKind::Primitive { column, .. }
        | FieldKind::Enum { column, .. }
        | FieldKind::ManyToOne { column, .. } => Ok(column),
        _ => Err(Error::Custom(format!(
            "{}.{} cannot be filtered on",
            meta.name,
            meta.field(field).name
        ))),
    }
}

/// Column and stored value an operand compares against.
fn column_value(
    meta: &EntityMetadata,
    field: FieldId,
    value: &FilterValue,
) -> Result<Option<(&'static str, Value)>> {
    let kind = &meta.field(field).kind;
    match (kind, value) {
        (FieldKind::Polymorphic { components, .. }, FilterValue::Entity(target)) => {
            let component = components
                .iter()
                .find(|c| c.other == target.entity_type())
                .ok_or_else(|| {
                    Error::Custom(format!(
                        "{}.{} cannot reference {}",
                        meta.name,
                        meta.field(field).name,
                        target.entity_type()
                    ))
                })?;
            Ok(target.id().map(|id| (component.column, id.to_value())))
        }
        (_, FilterValue::Entity(target)) => {
            let column = plain_column(meta, field, kind)?;
            Ok(target.id().map(|id| (column, id.to_value())))
        }
        (FieldKind::Primitive { column, serde, .. }, FilterValue::Value(v)) => {
            Ok(Some((column, serde.to_column(v)?)))
        }
        (_, FilterValue::Value(v)) => Ok(Some((plain_column(meta, field, kind)?, v.clone()))),
    }
}
