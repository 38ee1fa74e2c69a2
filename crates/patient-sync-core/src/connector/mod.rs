//! I/O boundary to the sources and the consolidated store.
//!
//! Relational stores implement [`Connector`]; the snapshot source only
//! offers a full pull and implements [`SnapshotFetcher`].

mod http;
mod sqlite;

pub use http::*;
pub use sqlite::*;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Connector errors.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    Connection(String),

    /// Lock wait, deadlock victim or busy database.
    #[error("lock conflict: {0}")]
    LockConflict(String),

    #[error("query failed: {0}")]
    Query(String),
}

impl ConnectorError {
    /// Whether the statement lost a lock race and may succeed on retry.
    pub fn is_lock_conflict(&self) -> bool {
        match self {
            ConnectorError::LockConflict(_) => true,
            ConnectorError::Query(msg) => looks_like_lock_conflict(msg),
            _ => false,
        }
    }
}

/// Driver-agnostic message check for lock contention.
pub(crate) fn looks_like_lock_conflict(message: &str) -> bool {
    let msg = message.to_lowercase();
    msg.contains("deadlock")
        || msg.contains("lock conflict")
        || msg.contains("lock wait")
        || msg.contains("database is locked")
        || msg.contains("database is busy")
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// A parameter or column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Date(NaiveDate),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Coerce to trimmed, non-empty text.
    pub fn as_text(&self) -> Option<String> {
        let text = match self {
            SqlValue::Null => return None,
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Real(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
            SqlValue::Real(f) => f.to_string(),
            SqlValue::Text(s) => s.trim().to_string(),
            SqlValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        };
        Some(text).filter(|t| !t.is_empty())
    }

    /// Coerce to an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Real(f) if f.fract() == 0.0 => Some(*f as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// Rows returned by a row-producing statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Lowercased column names
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl QueryResult {
    /// First column of the first row, if any.
    pub fn scalar(&self) -> Option<&SqlValue> {
        self.rows.first().and_then(|row| row.first())
    }
}

/// A relational store the engine reads from or writes to.
pub trait Connector: Send {
    /// Open the connection. Returns `false` and logs on failure.
    fn connect(&mut self) -> bool;

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Run one statement. Returns `None` for statements without a result set.
    fn execute(&mut self, query: &str, params: &[SqlValue]) -> ConnectorResult<Option<QueryResult>>;

    /// Commit an open transaction, if the driver keeps one.
    fn commit(&mut self) -> ConnectorResult<()>;
}

/// A source that can only hand over its whole population as text lines.
pub trait SnapshotFetcher: Send {
    /// Pull every line. An exhausted retry budget yields an empty vector.
    fn fetch_all(&mut self) -> Vec<String>;
}
