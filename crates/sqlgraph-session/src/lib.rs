//! Unit of work for sqlgraph.
//!
//! `sqlgraph-session` turns in-memory mutations of an entity graph into one
//! transactional flush while keeping the number of database round trips low.
//!
//! # Role In The Architecture
//!
//! - **Metadata**: [`MetadataRegistry`] describes entity types, their fields
//!   and relations, hooks, rules and reactive fields. It is built once and
//!   shared.
//! - **Entity manager**: [`EntityManager`] is one unit of work. It owns the
//!   identity map (one [`EntityRef`] per id), batched loaders, many-to-many
//!   join rows and the reactive queue.
//! - **Relations**: [`ManyToOne`], [`OneToMany`], [`ManyToMany`],
//!   [`OneToOne`] and [`Polymorphic`] handles keep both sides of a relation
//!   consistent in memory.
//! - **Flush**: cascade deletes and reactive fields settle to a fixed point,
//!   hooks run, validation aggregates every failure, then rows are written
//!   in flush order inside one transaction.
//!
//! # Design Philosophy
//!
//! - **Batch by default**: loads issued together coalesce into one query per
//!   entity type; `populate` walks a [`LoadHint`] level by level.
//! - **Fail loudly**: reading an unloaded relation is [`Error::NotLoaded`],
//!   never a silent default.
//! - **Single-threaded**: handles are `Rc`-based and futures are `!Send`.
//! - **Cancel-correct**: every I/O-bound operation takes a `Cx` and returns
//!   an `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let em = EntityManager::new(registry, driver);
//! let author = em.create_with("Author", [("first_name", Value::from("a1"))])?;
//! let book = em.create_with("Book", [("title", Value::from("b1"))])?;
//! book.many_to_one(book.field_id("author")?).set(Some(&author))?;
//!
//! // INSERT authors, then INSERT books, in one transaction.
//! em.flush(&cx, FlushOptions::default()).await?;
//! ```
//!
//! [`Error::NotLoaded`]: sqlgraph_core::Error::NotLoaded

mod cascade;
mod entity;
mod field_index;
mod filter;
mod flush;
mod hint;
pub mod hooks;
mod identity_map;
mod join_rows;
mod loader;
mod manager;
pub mod metadata;
mod reactive;
pub mod registry;
pub mod relations;
mod validation;

pub use entity::{DeletedState, EntityRef};
pub use filter::{Filter, FilterValue};
pub use hint::LoadHint;
pub use hooks::{AsyncHook, FlushSecret, Hook, HookContext, HookPoint, SyncHookFn};
pub use identity_map::ObjectKey;
pub use loader::{BatchFuture, DataLoader};
pub use manager::{EntityManager, EntityManagerConfig, FlushOptions};
pub use metadata::{
    ComputedProperty, DerivedField, EntityBuilder, EntityMetadata, Field, FieldDef, FieldId,
    FieldKind, FieldSerde, PolyComponent, ReactiveField, ReactiveRule, RuleResult,
    ValidationRule,
};
pub use registry::{MetadataRegistry, ReactiveKind, RegistryBuilder};
pub use relations::{ManyToMany, ManyToOne, OneToMany, OneToOne, Polymorphic, Relation};
