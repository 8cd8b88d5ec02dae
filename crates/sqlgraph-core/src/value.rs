//! Dynamic SQL values and primary-key ids.

use crate::error::{Error, TypeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A dynamically-typed SQL value.
///
/// Used for entity field storage, parameter binding and result fetching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::BigInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(f64::from(*v)),
            Value::BigInt(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Structural equality that treats `Int`/`BigInt` of the same number as equal.
    ///
    /// Rows coming back from a driver may widen integers, so dirty checks and
    /// field-index lookups compare with this instead of `==`.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self.as_i64(), other.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::BigInt(v) | Value::Timestamp(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Decimal(s) | Value::Text(s) => write!(f, "{s}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Uuid(u) => {
                for byte in u {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            Value::Json(j) => write!(f, "{j}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<IdValue> for Value {
    fn from(id: IdValue) -> Self {
        match id {
            IdValue::Int(v) => Value::BigInt(v),
            IdValue::Text(s) => Value::Text(s),
        }
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_i64().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "i64",
                actual: value.type_name().to_string(),
                column: None,
            })
        })
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(s) | Value::Decimal(s) => Ok(s),
            other => Err(Error::Type(TypeError {
                expected: "String",
                actual: other.type_name().to_string(),
                column: None,
            })),
        }
    }
}

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_bool().ok_or_else(|| {
            Error::Type(TypeError {
                expected: "bool",
                actual: value.type_name().to_string(),
                column: None,
            })
        })
    }
}

/// A primary-key value, hashable so it can key the identity map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdValue {
    Int(i64),
    Text(String),
}

impl IdValue {
    /// Read an id out of a column value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(IdValue::Int(i64::from(*v))),
            Value::BigInt(v) => Some(IdValue::Int(*v)),
            Value::Text(s) => Some(IdValue::Text(s.clone())),
            _ => None,
        }
    }

    /// Parse either a tagged (`a:1`) or an untagged (`1`) id for the given tag.
    ///
    /// Returns `None` when the input carries a different tag.
    pub fn parse_tagged(input: &str, tag: &str) -> Option<Self> {
        let raw = match input.split_once(':') {
            Some((t, rest)) if t == tag => rest,
            Some(_) => return None,
            None => input,
        };
        Some(match raw.parse::<i64>() {
            Ok(n) => IdValue::Int(n),
            Err(_) => IdValue::Text(raw.to_string()),
        })
    }

    /// Render as `tag:id`.
    pub fn tagged(&self, tag: &str) -> String {
        format!("{tag}:{self}")
    }

    pub fn to_value(&self) -> Value {
        self.clone().into()
    }
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Int(v) => write!(f, "{v}"),
            IdValue::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for IdValue {
    fn from(v: i64) -> Self {
        IdValue::Int(v)
    }
}

impl From<i32> for IdValue {
    fn from(v: i32) -> Self {
        IdValue::Int(i64::from(v))
    }
}

impl From<&str> for IdValue {
    /// Numeric strings become `Int`; a leading `tag:` is kept and resolved later.
    fn from(v: &str) -> Self {
        match v.parse::<i64>() {
            Ok(n) => IdValue::Int(n),
            Err(_) => IdValue::Text(v.to_string()),
        }
    }
}

impl From<String> for IdValue {
    fn from(v: String) -> Self {
        IdValue::from(v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_primitives() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(7_i32), Value::Int(7));
        assert_eq!(Value::from(7_i64), Value::BigInt(7));
        assert_eq!(Value::from("a1"), Value::Text("a1".to_string()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn test_same_as_widens_integers() {
        assert!(Value::Int(3).same_as(&Value::BigInt(3)));
        assert!(!Value::Int(3).same_as(&Value::BigInt(4)));
        assert!(Value::Null.same_as(&Value::Null));
        assert!(!Value::Text("3".into()).same_as(&Value::BigInt(3)));
    }

    #[test]
    fn test_try_from_errors_name_type() {
        let err = i64::try_from(Value::Text("x".into())).unwrap_err();
        assert_eq!(err.to_string(), "Type error: expected i64, found TEXT");
        assert_eq!(String::try_from(Value::Text("b1".into())).unwrap(), "b1");
    }

    #[test]
    fn test_id_parse_tagged() {
        assert_eq!(IdValue::parse_tagged("a:1", "a"), Some(IdValue::Int(1)));
        assert_eq!(IdValue::parse_tagged("1", "a"), Some(IdValue::Int(1)));
        assert_eq!(IdValue::parse_tagged("b:1", "a"), None);
        assert_eq!(
            IdValue::parse_tagged("a:xyz", "a"),
            Some(IdValue::Text("xyz".into()))
        );
    }

    #[test]
    fn test_id_round_trips_through_value() {
        let id = IdValue::Int(42);
        assert_eq!(id.tagged("a"), "a:42");
        assert_eq!(IdValue::from_value(&id.to_value()), Some(id));
        assert_eq!(IdValue::from_value(&Value::Int(5)), Some(IdValue::Int(5)));
        assert_eq!(IdValue::from_value(&Value::Null), None);
    }
}
