//! Error types for sqlgraph operations.

use std::fmt;

/// The primary error type for all sqlgraph operations.
#[derive(Debug)]
pub enum Error {
    /// Query execution errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Configuration errors
    Config(ConfigError),
    /// Entity metadata is inconsistent (unknown targets, FK or reactive cycles)
    Metadata(MetadataError),
    /// Aggregated validation failures from one flush
    Validation(ValidationErrors),
    /// `load`/`load_all` target missing
    NotFound(NotFoundError),
    /// A find expected at most one row but got more
    TooMany {
        entity: &'static str,
        count: usize,
    },
    /// An entity with the same tagged id is already registered
    DuplicateEntity { tagged_id: String },
    /// The managed-entity ceiling was reached
    TooManyEntities { limit: usize },
    /// `flush()` was called while another flush on the same unit of work was running
    ConcurrentFlush,
    /// A relation was read synchronously before being loaded
    NotLoaded {
        entity: String,
        relation: &'static str,
    },
    /// A mutation was rejected (flush in progress, or the entity is deleted)
    ReadOnly { entity: String, reason: String },
    /// A lifecycle hook failed
    Hook { hook: &'static str, message: String },
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    /// Name of the violated constraint, when the database reports one
    pub constraint: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already open on this unit of work
    AlreadyOpen,
    /// Commit or rollback without an open transaction
    NotOpen,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone)]
pub struct MetadataError {
    pub kind: MetadataErrorKind,
    pub message: String,
    /// Path through the offending types/fields, for cycle errors
    pub path: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataErrorKind {
    /// Entity type is registered twice
    DuplicateEntity,
    /// A relation points at an unknown entity type or field
    UnknownTarget,
    /// Required foreign keys form a cycle, no flush order exists
    ForeignKeyCycle,
    /// A reactive field depends on itself
    ReactiveCycle,
    /// A load hint names a field that does not exist
    InvalidHint,
}

#[derive(Debug, Clone)]
pub struct NotFoundError {
    pub entity: &'static str,
    /// Tagged ids that were requested but not found
    pub ids: Vec<String>,
}

/// Aggregated validation failures raised by a flush.
#[derive(Debug, Clone, Default)]
pub struct ValidationErrors {
    pub errors: Vec<EntityValidationError>,
}

/// One failed rule on one entity.
#[derive(Debug, Clone)]
pub struct EntityValidationError {
    /// Display form of the entity, e.g. `Author#a:1` or `Author#new`
    pub entity: String,
    /// Offending field, or `None` for entity-level rules
    pub field: Option<String>,
    pub kind: ValidationErrorKind,
    pub message: String,
}

/// The type of validation constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Required field is missing/null
    Required,
    /// String is longer than maximum length
    MaxLength,
    /// Value doesn't match regex pattern
    Pattern,
    /// Custom entity rule failed
    Custom,
    /// Reactive rule failed
    Reactive,
    /// Database constraint mapped through the constraint message table
    Constraint,
}

impl ValidationErrors {
    /// Create a new empty validation error container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Add a validation error.
    pub fn add(
        &mut self,
        entity: impl Into<String>,
        field: Option<&str>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(EntityValidationError {
            entity: entity.into(),
            field: field.map(str::to_string),
            kind,
            message: message.into(),
        });
    }

    /// Add a required field error.
    pub fn add_required(&mut self, entity: impl Into<String>, field: &str) {
        self.add(
            entity,
            Some(field),
            ValidationErrorKind::Required,
            format!("{field} is required"),
        );
    }

    /// Add a max length error.
    pub fn add_max_length(
        &mut self,
        entity: impl Into<String>,
        field: &str,
        max: usize,
        actual: usize,
    ) {
        self.add(
            entity,
            Some(field),
            ValidationErrorKind::MaxLength,
            format!("{field} must be at most {max} characters, got {actual}"),
        );
    }

    /// Add a pattern match error.
    pub fn add_pattern(&mut self, entity: impl Into<String>, field: &str, pattern: &str) {
        self.add(
            entity,
            Some(field),
            ValidationErrorKind::Pattern,
            format!("{field} must match pattern '{pattern}'"),
        );
    }

    pub fn extend(&mut self, other: ValidationErrors) {
        self.errors.extend(other.errors);
    }

    /// Messages in insertion order.
    pub fn messages(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.message.as_str()).collect()
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Error {
    /// Is this a retryable error (deadlock, serialization, statement timeout)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the violated constraint name, if the driver reported one.
    pub fn constraint(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.constraint.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    pub fn validation(&self) -> Option<&ValidationErrors> {
        match self {
            Error::Validation(v) => Some(v),
            _ => None,
        }
    }

    pub fn metadata(
        kind: MetadataErrorKind,
        message: impl Into<String>,
        path: Vec<String>,
    ) -> Self {
        Error::Metadata(MetadataError {
            kind,
            message: message.into(),
            path,
        })
    }
}

impl QueryError {
    /// Shorthand for a database-reported error without SQL context.
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            sqlstate: None,
            constraint: None,
            message: message.into(),
            detail: None,
            source: None,
        }
    }
}

impl MetadataError {
    pub fn new(kind: MetadataErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: Vec::new(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Metadata(e) => write!(f, "Metadata error: {}", e),
            Error::Validation(e) => write!(f, "{}", e),
            Error::NotFound(e) => write!(f, "{}", e),
            Error::TooMany { entity, count } => {
                write!(f, "Expected at most one {}, found {}", entity, count)
            }
            Error::DuplicateEntity { tagged_id } => {
                write!(f, "Entity {} is already registered", tagged_id)
            }
            Error::TooManyEntities { limit } => {
                write!(f, "More than {} entities have been instantiated", limit)
            }
            Error::ConcurrentFlush => write!(f, "Cannot flush while another flush is already in progress"),
            Error::NotLoaded { entity, relation } => {
                write!(f, "{}.{} was not loaded", entity, relation)
            }
            Error::ReadOnly { entity, reason } => write!(f, "Cannot mutate {}: {}", entity, reason),
            Error::Hook { hook, message } => write!(f, "{} hook failed: {}", hook, message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.message, self.path.join(" -> "))
        }
    }
}

impl fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} was not found", self.entity, self.ids.join(", "))
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "Validation error: {} {}", err.entity, err.message)
        } else {
            writeln!(f, "Validation errors ({}):", self.errors.len())?;
            for err in &self.errors {
                writeln!(f, "  - {} {}", err.entity, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationErrors {}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<MetadataError> for Error {
    fn from(err: MetadataError) -> Self {
        Error::Metadata(err)
    }
}

impl From<ValidationErrors> for Error {
    fn from(err: ValidationErrors) -> Self {
        Error::Validation(err)
    }
}

impl From<NotFoundError> for Error {
    fn from(err: NotFoundError) -> Self {
        Error::NotFound(err)
    }
}

/// Result type alias for sqlgraph operations.
pub type Result<T> = std::result::Result<T, Error>;
