//! Row values
//!
//! Source rows are decoded into a closed set of semantic value kinds. Each
//! kind has one fixed JSON encoding, used for the `payload` column of the
//! target table:
//!
//! | Kind      | JSON                                        |
//! |-----------|---------------------------------------------|
//! | String    | string                                      |
//! | Integer   | number                                      |
//! | Decimal   | string holding the exact decimal text       |
//! | Timestamp | RFC 3339 string, microseconds, `Z` suffix   |
//! | Boolean   | `true` / `false`                            |
//! | Null      | `null`                                      |
//!
//! Source column types outside this set are rejected by the source's type
//! mapper with a decode error.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Semantic kind of a [`SqlValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    String,
    Integer,
    Decimal,
    Timestamp,
    Boolean,
    Null,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::Integer => "integer",
            ValueKind::Decimal => "decimal",
            ValueKind::Timestamp => "timestamp",
            ValueKind::Boolean => "boolean",
            ValueKind::Null => "null",
        };
        f.write_str(name)
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    String(String),
    Integer(i64),
    Decimal(Decimal),
    Timestamp(DateTime<Utc>),
    Boolean(bool),
    Null,
}

impl SqlValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            SqlValue::String(_) => ValueKind::String,
            SqlValue::Integer(_) => ValueKind::Integer,
            SqlValue::Decimal(_) => ValueKind::Decimal,
            SqlValue::Timestamp(_) => ValueKind::Timestamp,
            SqlValue::Boolean(_) => ValueKind::Boolean,
            SqlValue::Null => ValueKind::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Encode this value as JSON.
    pub fn to_json(&self) -> JsonValue {
        match self {
            SqlValue::String(s) => JsonValue::String(s.clone()),
            SqlValue::Integer(i) => JsonValue::from(*i),
            SqlValue::Decimal(d) => JsonValue::String(d.to_string()),
            SqlValue::Timestamp(ts) => {
                JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            SqlValue::Boolean(b) => JsonValue::Bool(*b),
            SqlValue::Null => JsonValue::Null,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::String(s) => f.write_str(s),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Decimal(d) => write!(f, "{d}"),
            SqlValue::Timestamp(ts) => {
                f.write_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            SqlValue::Boolean(b) => write!(f, "{b}"),
            SqlValue::Null => f.write_str("NULL"),
        }
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::String(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::String(v.to_string())
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Boolean(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Column name → value map for one row, in source column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowImage {
    columns: Vec<(String, SqlValue)>,
}

impl RowImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            columns: Vec::with_capacity(capacity),
        }
    }

    /// Append a column (builder pattern).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.push(name, value);
        self
    }

    /// Append a column. A repeated name replaces the earlier value.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<SqlValue>) {
        let name = name.into();
        let value = value.into();
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = value,
            None => self.columns.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SqlValue)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Encode the row as a JSON object.
    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::with_capacity(self.columns.len());
        for (name, value) in &self.columns {
            map.insert(name.clone(), value.to_json());
        }
        JsonValue::Object(map)
    }
}

impl<K: Into<String>, V: Into<SqlValue>> FromIterator<(K, V)> for RowImage {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = RowImage::new();
        for (k, v) in iter {
            row.push(k, v);
        }
        row
    }
}
