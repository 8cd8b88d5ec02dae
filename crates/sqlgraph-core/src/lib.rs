//! Core types and traits for sqlgraph.
//!
//! This crate provides the foundations the unit of work is built on:
//!
//! - `Value`, `IdValue` and `Row` for dynamically-typed column data
//! - `Error` taxonomy shared by every layer
//! - `Driver` trait and the wire types a flush hands to it
//! - `SqlDriver`, a SQL-rendering `Driver` over any `SqlExecutor`
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod driver;
pub mod error;
pub mod row;
pub mod sql;
pub mod value;

pub use driver::{
    Condition, Driver, DriverFuture, EntityTodo, FindQuery, IsolationLevel, JoinTableTodo,
    OrderBy, Page, RowChange,
};
pub use error::{
    ConfigError, EntityValidationError, Error, MetadataError, MetadataErrorKind, NotFoundError,
    QueryError, QueryErrorKind, Result, TransactionError, TransactionErrorKind, TypeError,
    ValidationErrorKind, ValidationErrors,
};
pub use row::{ColumnInfo, Row};
pub use sql::{SqlDriver, SqlExecutor, render_find};
pub use value::{IdValue, Value};

/// Unwrap an `Outcome::Ok`, returning early from the enclosing async fn on
/// `Err`, `Cancelled` or `Panicked`.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(v) => v,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Like [`try_outcome!`] for a synchronous `Result` inside an `Outcome`-returning fn.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => return $crate::Outcome::Err(e.into()),
        }
    };
}
