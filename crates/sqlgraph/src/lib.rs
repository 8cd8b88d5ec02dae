//! sqlgraph - unit-of-work entity graphs over relational databases.
//!
//! sqlgraph loads, mutates and persists graphs of related entities while
//! keeping database round trips low:
//!
//! - One instance per entity id within a unit of work
//! - Loads issued together coalesce into one query per entity type
//! - Relations stay consistent on both sides in memory
//! - Cascade deletes and reactive derived fields settle before every flush
//! - Hooks and validation run before anything is written; all failures are
//!   reported together
//! - One transaction per flush, rows written in foreign-key order
//!
//! # Quick Start
//!
//! ```ignore
//! use sqlgraph::prelude::*;
//!
//! let registry = MetadataRegistry::builder()
//!     .entity(
//!         EntityBuilder::new("Author", "a", "authors")
//!             .primary_key("id")
//!             .field(Field::primitive("first_name").required())
//!             .field(Field::one_to_many("books", "Book", "author")),
//!     )
//!     .entity(
//!         EntityBuilder::new("Book", "b", "books")
//!             .primary_key("id")
//!             .field(Field::primitive("title").required())
//!             .field(Field::many_to_one("author", "author_id", "Author", "books").required()),
//!     )
//!     .build()?;
//!
//! let em = EntityManager::new(registry, SqlDriver::new(executor));
//! let author = em.load(&cx, "Author", "a:1").await?;
//! let books = author.one_to_many(author.field_id("books")?).load(&cx).await?;
//! books[0].set_by_name("title", "b2")?;
//! em.flush(&cx, FlushOptions::default()).await?;
//! ```

pub use sqlgraph_core::{
    // asupersync re-exports
    Budget,
    Condition,
    Cx,
    // Driver contract
    Driver,
    DriverFuture,
    EntityTodo,
    EntityValidationError,
    Error,
    FindQuery,
    IdValue,
    IsolationLevel,
    JoinTableTodo,
    NotFoundError,
    OrderBy,
    Outcome,
    Page,
    QueryError,
    QueryErrorKind,
    RegionId,
    Result,
    Row,
    RowChange,
    SqlDriver,
    SqlExecutor,
    TaskId,
    ValidationErrorKind,
    ValidationErrors,
    Value,
    try_outcome,
    try_result,
};

pub use sqlgraph_session::{
    AsyncHook, DataLoader, DeletedState, EntityBuilder, EntityManager, EntityManagerConfig,
    EntityMetadata, EntityRef, Field, FieldId, FieldKind, FieldSerde, Filter, FilterValue,
    FlushOptions, FlushSecret, Hook, HookContext, HookPoint, LoadHint, ManyToMany, ManyToOne,
    MetadataRegistry, OneToMany, OneToOne, Polymorphic, RegistryBuilder, Relation, RuleResult,
};

/// Everything needed to declare entities and run a unit of work.
///
/// ```ignore
/// use sqlgraph::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AsyncHook, Cx, Driver, EntityBuilder, EntityManager, EntityManagerConfig, EntityRef,
        Error, Field, FieldId, Filter, FlushOptions, HookContext, HookPoint, IdValue,
        IsolationLevel, LoadHint, MetadataRegistry, Outcome, Page, Relation, Result, Row,
        SqlDriver, Value,
    };
}
