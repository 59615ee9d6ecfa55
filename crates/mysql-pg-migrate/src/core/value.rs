//! SQL value types for streaming rows from the source to the record encoder.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

/// One column value read from the source.
///
/// Character data stays as raw bytes in the source session's character set,
/// so that the bytes written to COPY match the declared encoding without a
/// re-decode.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Decimal(Decimal),
    /// Character data in the session encoding.
    Text(Vec<u8>),
    /// Binary data, written as bytea hex.
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Text value from a string slice.
    #[must_use]
    pub fn text(s: &str) -> Self {
        SqlValue::Text(s.as_bytes().to_vec())
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A batch of rows streamed from the source.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub rows: Vec<Vec<SqlValue>>,
}

impl Batch {
    pub fn new(rows: Vec<Vec<SqlValue>>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
