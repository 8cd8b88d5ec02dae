//! Static per-type entity descriptions.
//!
//! Metadata is produced once (normally by generated code) and frozen into a
//! [`MetadataRegistry`](crate::MetadataRegistry). Fields are addressed by
//! [`FieldId`], a dense index into the entity's field store, so generated code
//! can declare `const` ids instead of looking fields up by name.
//!
//! ```ignore
//! const FIRST_NAME: FieldId = FieldId(1);
//! let author = EntityBuilder::new("Author", "a", "authors")
//!     .primary_key("id")
//!     .field(Field::primitive("first_name").required().max_length(20))
//!     .field(Field::one_to_many("books", "Book", "author").cascade_delete());
//! ```

use crate::entity::EntityRef;
use crate::hint::LoadHint;
use crate::hooks::{AsyncHook, Hook, HookContext, HookPoint};
use serde_json::Value as JsonValue;
use sqlgraph_core::{Error, Result, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Index of a field within its entity's field store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub usize);

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a primitive field's in-memory value maps to its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldSerde {
    /// Stored as-is.
    #[default]
    Plain,
    /// Held as `Value::Json` in memory, written as JSON text.
    Json,
}

impl FieldSerde {
    pub fn to_column(self, value: &Value) -> Result<Value> {
        match (self, value) {
            (FieldSerde::Json, Value::Json(json)) => serde_json::to_string(json)
                .map(Value::Text)
                .map_err(|e| Error::Custom(format!("cannot serialize json field: {e}"))),
            _ => Ok(value.clone()),
        }
    }

    pub fn from_column(self, value: &Value) -> Result<Value> {
        match (self, value) {
            (FieldSerde::Json, Value::Text(text)) => serde_json::from_str::<JsonValue>(text)
                .map(Value::Json)
                .map_err(|e| Error::Custom(format!("cannot parse json column: {e}"))),
            _ => Ok(value.clone()),
        }
    }
}

/// One side of a polymorphic reference: a candidate target type and the
/// column holding its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolyComponent {
    pub other: &'static str,
    pub column: &'static str,
    pub other_field: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    PrimaryKey {
        column: &'static str,
    },
    Primitive {
        column: &'static str,
        required: bool,
        serde: FieldSerde,
        max_length: Option<usize>,
        pattern: Option<&'static str>,
        default: Option<Value>,
    },
    Enum {
        column: &'static str,
        variants: &'static [&'static str],
        required: bool,
    },
    ManyToOne {
        column: &'static str,
        other: &'static str,
        other_field: &'static str,
        required: bool,
    },
    OneToMany {
        other: &'static str,
        other_field: &'static str,
    },
    ManyToMany {
        other: &'static str,
        other_field: &'static str,
        join_table: &'static str,
        column: &'static str,
        other_column: &'static str,
    },
    OneToOne {
        other: &'static str,
        other_field: &'static str,
    },
    Polymorphic {
        components: Vec<PolyComponent>,
        required: bool,
    },
}

impl FieldKind {
    pub fn is_relation(&self) -> bool {
        !matches!(
            self,
            FieldKind::PrimaryKey { .. } | FieldKind::Primitive { .. } | FieldKind::Enum { .. }
        )
    }

    /// Relations whose state is a loaded list or optional target rather than a
    /// column on this entity.
    pub fn is_collection_like(&self) -> bool {
        matches!(
            self,
            FieldKind::OneToMany { .. } | FieldKind::ManyToMany { .. } | FieldKind::OneToOne { .. }
        )
    }

    /// Whether this field is backed by at least one column on its own table.
    pub fn has_column(&self) -> bool {
        !self.is_collection_like()
    }
}

/// A field descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub id: FieldId,
    pub name: &'static str,
    pub kind: FieldKind,
    pub cascade_delete: bool,
    /// Set for persisted reactive fields; only the engine may write them.
    pub derived: bool,
}

impl FieldDef {
    /// Target types of a relation field (empty for columns).
    pub fn targets(&self) -> Vec<(&'static str, &'static str)> {
        match &self.kind {
            FieldKind::ManyToOne {
                other, other_field, ..
            }
            | FieldKind::OneToMany { other, other_field }
            | FieldKind::ManyToMany {
                other, other_field, ..
            }
            | FieldKind::OneToOne { other, other_field } => vec![(*other, *other_field)],
            FieldKind::Polymorphic { components, .. } => components
                .iter()
                .map(|c| (c.other, c.other_field))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_required(&self) -> bool {
        match &self.kind {
            FieldKind::Primitive { required, .. }
            | FieldKind::Enum { required, .. }
            | FieldKind::ManyToOne { required, .. }
            | FieldKind::Polymorphic { required, .. } => *required,
            _ => false,
        }
    }
}

/// Builder-style field declaration consumed by [`EntityBuilder::field`].
#[derive(Debug, Clone)]
pub struct Field {
    name: &'static str,
    kind: FieldKind,
    cascade_delete: bool,
}

impl Field {
    /// A plain column named after the field.
    pub fn primitive(name: &'static str) -> Self {
        Self::new(
            name,
            FieldKind::Primitive {
                column: name,
                required: false,
                serde: FieldSerde::Plain,
                max_length: None,
                pattern: None,
                default: None,
            },
        )
    }

    pub fn enumeration(name: &'static str, variants: &'static [&'static str]) -> Self {
        Self::new(
            name,
            FieldKind::Enum {
                column: name,
                variants,
                required: false,
            },
        )
    }

    pub fn many_to_one(
        name: &'static str,
        column: &'static str,
        other: &'static str,
        other_field: &'static str,
    ) -> Self {
        Self::new(
            name,
            FieldKind::ManyToOne {
                column,
                other,
                other_field,
                required: false,
            },
        )
    }

    pub fn one_to_many(name: &'static str, other: &'static str, other_field: &'static str) -> Self {
        Self::new(name, FieldKind::OneToMany { other, other_field })
    }

    pub fn many_to_many(
        name: &'static str,
        other: &'static str,
        other_field: &'static str,
        join_table: &'static str,
        column: &'static str,
        other_column: &'static str,
    ) -> Self {
        Self::new(
            name,
            FieldKind::ManyToMany {
                other,
                other_field,
                join_table,
                column,
                other_column,
            },
        )
    }

    pub fn one_to_one(name: &'static str, other: &'static str, other_field: &'static str) -> Self {
        Self::new(name, FieldKind::OneToOne { other, other_field })
    }

    /// `components` are `(other type, column, inverse field on other)`.
    pub fn polymorphic(
        name: &'static str,
        components: &[(&'static str, &'static str, &'static str)],
    ) -> Self {
        Self::new(
            name,
            FieldKind::Polymorphic {
                components: components
                    .iter()
                    .map(|&(other, column, other_field)| PolyComponent {
                        other,
                        column,
                        other_field,
                    })
                    .collect(),
                required: false,
            },
        )
    }

    fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            cascade_delete: false,
        }
    }

    /// Override the column name of a primitive or enum field.
    pub fn column(mut self, name: &'static str) -> Self {
        match &mut self.kind {
            FieldKind::Primitive { column, .. }
            | FieldKind::Enum { column, .. }
            | FieldKind::ManyToOne { column, .. } => *column = name,
            _ => {}
        }
        self
    }

    pub fn required(mut self) -> Self {
        match &mut self.kind {
            FieldKind::Primitive { required, .. }
            | FieldKind::Enum { required, .. }
            | FieldKind::ManyToOne { required, .. }
            | FieldKind::Polymorphic { required, .. } => *required = true,
            _ => {}
        }
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        if let FieldKind::Primitive { max_length, .. } = &mut self.kind {
            *max_length = Some(max);
        }
        self
    }

    /// Regex the text value must match.
    pub fn pattern(mut self, regex: &'static str) -> Self {
        if let FieldKind::Primitive { pattern, .. } = &mut self.kind {
            *pattern = Some(regex);
        }
        self
    }

    pub fn json(mut self) -> Self {
        if let FieldKind::Primitive { serde, .. } = &mut self.kind {
            *serde = FieldSerde::Json;
        }
        self
    }

    /// Initial value for new entities.
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        if let FieldKind::Primitive { default, .. } = &mut self.kind {
            *default = Some(value.into());
        }
        self
    }

    pub fn cascade_delete(mut self) -> Self {
        self.cascade_delete = true;
        self
    }
}

pub type ReactiveFn = Arc<dyn Fn(&EntityRef) -> Result<Value> + Send + Sync>;
pub type DerivedFn = Arc<dyn Fn(&EntityRef) -> Result<Value> + Send + Sync>;
pub type RuleFn = Arc<dyn Fn(&EntityRef) -> RuleResult + Send + Sync>;

/// Outcome of a validation rule: `Err(message)` on failure.
pub type RuleResult = std::result::Result<(), String>;

/// A persisted field recalculated whenever something in `hint` changes.
#[derive(Clone)]
pub struct ReactiveField {
    pub field: FieldId,
    pub hint: LoadHint,
    pub compute: ReactiveFn,
}

/// A validation rule re-run whenever something in `hint` changes.
#[derive(Clone)]
pub struct ReactiveRule {
    pub name: &'static str,
    pub hint: LoadHint,
    pub check: RuleFn,
}

/// A persisted field computed synchronously from the entity's own fields.
#[derive(Clone)]
pub struct DerivedField {
    pub field: FieldId,
    pub compute: DerivedFn,
}

/// A non-persisted value computed on read once `hint` is loaded.
#[derive(Clone)]
pub struct ComputedProperty {
    pub name: &'static str,
    pub hint: LoadHint,
    pub compute: ReactiveFn,
}

#[derive(Clone)]
pub struct ValidationRule {
    pub name: &'static str,
    pub check: RuleFn,
}

/// Frozen description of one entity type.
pub struct EntityMetadata {
    pub name: &'static str,
    /// Prefix of tagged ids, e.g. `a` in `a:1`.
    pub tag: &'static str,
    pub table: &'static str,
    pub fields: Vec<FieldDef>,
    pub primary_key: FieldId,
    /// Topological position; types with no required FK flush first.
    pub flush_order: usize,
    pub reactive_fields: Vec<ReactiveField>,
    pub reactive_rules: Vec<ReactiveRule>,
    pub derived_fields: Vec<DerivedField>,
    pub computed: Vec<ComputedProperty>,
    pub rules: Vec<ValidationRule>,
    pub(crate) hooks: Vec<(HookPoint, Hook)>,
    by_name: HashMap<&'static str, FieldId>,
}

impl EntityMetadata {
    pub fn field(&self, id: FieldId) -> &FieldDef {
        &self.fields[id.0]
    }

    pub fn try_field(&self, id: FieldId) -> Result<&FieldDef> {
        self.fields.get(id.0).ok_or_else(|| {
            Error::Custom(format!("{} has no field {}", self.name, id))
        })
    }

    pub fn field_id(&self, name: &str) -> Option<FieldId> {
        self.by_name.get(name).copied()
    }

    pub fn field_by_name(&self, name: &str) -> Result<&FieldDef> {
        self.field_id(name)
            .map(|id| self.field(id))
            .ok_or_else(|| Error::Custom(format!("{} has no field '{}'", self.name, name)))
    }

    pub fn pk_column(&self) -> &'static str {
        match &self.field(self.primary_key).kind {
            FieldKind::PrimaryKey { column } => column,
            _ => "id",
        }
    }

    /// Names of relations that cascade deletes.
    pub fn cascade_delete_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.cascade_delete)
    }

    pub fn relations(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.kind.is_relation())
    }

    pub fn reactive_field(&self, id: FieldId) -> Option<&ReactiveField> {
        self.reactive_fields.iter().find(|r| r.field == id)
    }

    pub fn hooks_for(&self, point: HookPoint) -> impl Iterator<Item = &Hook> {
        self.hooks
            .iter()
            .filter(move |(p, _)| *p == point)
            .map(|(_, h)| h)
    }
}

impl fmt::Debug for EntityMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("fields", &self.fields.len())
            .field("flush_order", &self.flush_order)
            .finish_non_exhaustive()
    }
}

/// Declares one entity type; frozen by the registry builder.
pub struct EntityBuilder {
    pub(crate) name: &'static str,
    pub(crate) tag: &'static str,
    pub(crate) table: &'static str,
    pub(crate) fields: Vec<FieldDef>,
    pub(crate) reactive_fields: Vec<(&'static str, LoadHint, ReactiveFn)>,
    pub(crate) reactive_rules: Vec<ReactiveRule>,
    pub(crate) derived_fields: Vec<(&'static str, DerivedFn)>,
    pub(crate) computed: Vec<ComputedProperty>,
    pub(crate) rules: Vec<ValidationRule>,
    pub(crate) hooks: Vec<(HookPoint, Hook)>,
}

impl EntityBuilder {
    pub fn new(name: &'static str, tag: &'static str, table: &'static str) -> Self {
        Self {
            name,
            tag,
            table,
            fields: Vec::new(),
            reactive_fields: Vec::new(),
            reactive_rules: Vec::new(),
            derived_fields: Vec::new(),
            computed: Vec::new(),
            rules: Vec::new(),
            hooks: Vec::new(),
        }
    }

    /// Declare the primary key. Must come first so it gets `FieldId(0)`.
    pub fn primary_key(mut self, column: &'static str) -> Self {
        let id = FieldId(self.fields.len());
        self.fields.push(FieldDef {
            id,
            name: column,
            kind: FieldKind::PrimaryKey { column },
            cascade_delete: false,
            derived: false,
        });
        self
    }

    pub fn field(mut self, field: Field) -> Self {
        let id = FieldId(self.fields.len());
        self.fields.push(FieldDef {
            id,
            name: field.name,
            kind: field.kind,
            cascade_delete: field.cascade_delete,
            derived: false,
        });
        self
    }

    /// Persisted field recomputed when anything reachable through `hint` changes.
    pub fn reactive_field<F>(mut self, field: &'static str, hint: impl Into<LoadHint>, f: F) -> Self
    where
        F: Fn(&EntityRef) -> Result<Value> + Send + Sync + 'static,
    {
        self.reactive_fields.push((field, hint.into(), Arc::new(f)));
        self
    }

    pub fn reactive_rule<F>(mut self, name: &'static str, hint: impl Into<LoadHint>, f: F) -> Self
    where
        F: Fn(&EntityRef) -> RuleResult + Send + Sync + 'static,
    {
        self.reactive_rules.push(ReactiveRule {
            name,
            hint: hint.into(),
            check: Arc::new(f),
        });
        self
    }

    /// Persisted field computed from the entity's own columns during the hook loop.
    pub fn derived_field<F>(mut self, field: &'static str, f: F) -> Self
    where
        F: Fn(&EntityRef) -> Result<Value> + Send + Sync + 'static,
    {
        self.derived_fields.push((field, Arc::new(f)));
        self
    }

    pub fn computed<F>(mut self, name: &'static str, hint: impl Into<LoadHint>, f: F) -> Self
    where
        F: Fn(&EntityRef) -> Result<Value> + Send + Sync + 'static,
    {
        self.computed.push(ComputedProperty {
            name,
            hint: hint.into(),
            compute: Arc::new(f),
        });
        self
    }

    pub fn rule<F>(mut self, name: &'static str, f: F) -> Self
    where
        F: Fn(&EntityRef) -> RuleResult + Send + Sync + 'static,
    {
        self.rules.push(ValidationRule {
            name,
            check: Arc::new(f),
        });
        self
    }

    pub fn hook<F>(mut self, point: HookPoint, f: F) -> Self
    where
        F: Fn(&EntityRef, &HookContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.push((point, Hook::Sync(Arc::new(f))));
        self
    }

    pub fn async_hook(mut self, point: HookPoint, hook: impl AsyncHook + 'static) -> Self {
        self.hooks.push((point, Hook::Async(Arc::new(hook))));
        self
    }

    pub(crate) fn field_id(&self, name: &str) -> Option<FieldId> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.id)
    }

    /// Freeze into metadata; reactive and derived names are resolved here.
    pub(crate) fn finish(self, flush_order: usize) -> Result<EntityMetadata> {
        let missing = |name: &str| {
            Error::Custom(format!("{} declares unknown field '{}'", self.name, name))
        };
        let mut fields = self.fields.clone();
        let primary_key = fields
            .iter()
            .find(|f| matches!(f.kind, FieldKind::PrimaryKey { .. }))
            .map(|f| f.id)
            .ok_or_else(|| Error::Custom(format!("{} has no primary key", self.name)))?;

        let mut reactive_fields = Vec::new();
        for (name, hint, compute) in &self.reactive_fields {
            let field = self.field_id(name).ok_or_else(|| missing(name))?;
            fields[field.0].derived = true;
            reactive_fields.push(ReactiveField {
                field,
                hint: hint.clone(),
                compute: Arc::clone(compute),
            });
        }
        let mut derived_fields = Vec::new();
        for (name, compute) in &self.derived_fields {
            let field = self.field_id(name).ok_or_else(|| missing(name))?;
            fields[field.0].derived = true;
            derived_fields.push(DerivedField {
                field,
                compute: Arc::clone(compute),
            });
        }

        let by_name = fields.iter().map(|f| (f.name, f.id)).collect();
        Ok(EntityMetadata {
            name: self.name,
            tag: self.tag,
            table: self.table,
            fields,
            primary_key,
            flush_order,
            reactive_fields,
            reactive_rules: self.reactive_rules,
            derived_fields,
            computed: self.computed,
            rules: self.rules,
            hooks: self.hooks,
            by_name,
        })
    }
}
