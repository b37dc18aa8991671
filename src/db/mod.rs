// Database module - the queryable store the collectors read from
//
// This module defines:
// 1. The row/value model that query results are decoded into
// 2. The `Store` trait collectors issue aggregation queries through
// 3. The `Connection` and `ConnectionManager` traits the pool is built on
//
// The PostgreSQL implementation lives in `postgres`; the SQL text for each
// aggregation lives in `queries`.

use async_trait::async_trait;
use thiserror::Error;

pub mod pool;
pub mod postgres;
pub mod queries;

pub use pool::{Pool, PoolError, PoolOptions};
pub use queries::Query;

/// Errors raised while talking to the backing store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Column {column}: expected {expected}, found {found}")]
    Decode {
        column: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Column {column} is missing from the result row")]
    MissingColumn { column: usize },

    #[error("Unsupported column type '{type_name}' in column {column}")]
    UnsupportedType { column: usize, type_name: String },

    #[error("Invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(serde_json::Value),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Json(_) => "json",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One result row, columns in SELECT order
///
/// Accessors are strict about types except where a numeric widening is
/// lossless for metric purposes (`float` accepts integers).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Row { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns the raw value at `column`
    pub fn get(&self, column: usize) -> Result<&Value, StoreError> {
        self.values
            .get(column)
            .ok_or(StoreError::MissingColumn { column })
    }

    fn mismatch(&self, column: usize, expected: &'static str) -> StoreError {
        let found = self.values.get(column).map(Value::kind).unwrap_or("nothing");
        StoreError::Decode {
            column,
            expected,
            found,
        }
    }

    /// Integer column where NULL reads as `None`
    pub fn opt_int(&self, column: usize) -> Result<Option<i64>, StoreError> {
        match self.get(column)? {
            Value::Null => Ok(None),
            Value::Int(v) => Ok(Some(*v)),
            _ => Err(self.mismatch(column, "integer")),
        }
    }

    pub fn float(&self, column: usize) -> Result<f64, StoreError> {
        match self.get(column)? {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            _ => Err(self.mismatch(column, "number")),
        }
    }

    pub fn opt_float(&self, column: usize) -> Result<Option<f64>, StoreError> {
        match self.get(column)? {
            Value::Null => Ok(None),
            _ => self.float(column).map(Some),
        }
    }

    pub fn bool(&self, column: usize) -> Result<bool, StoreError> {
        match self.get(column)? {
            Value::Bool(v) => Ok(*v),
            _ => Err(self.mismatch(column, "bool")),
        }
    }

    /// Boolean column where NULL reads as `false`
    pub fn flag(&self, column: usize) -> Result<bool, StoreError> {
        match self.get(column)? {
            Value::Null => Ok(false),
            _ => self.bool(column),
        }
    }

    pub fn text(&self, column: usize) -> Result<&str, StoreError> {
        match self.get(column)? {
            Value::Text(v) => Ok(v),
            _ => Err(self.mismatch(column, "text")),
        }
    }

    pub fn opt_text(&self, column: usize) -> Result<Option<&str>, StoreError> {
        match self.get(column)? {
            Value::Null => Ok(None),
            Value::Text(v) => Ok(Some(v)),
            _ => Err(self.mismatch(column, "text")),
        }
    }

    /// Text column rendered as a label value, NULL becoming `fallback`
    pub fn label(&self, column: usize, fallback: &str) -> Result<String, StoreError> {
        Ok(self.opt_text(column)?.unwrap_or(fallback).to_string())
    }

    /// JSON column; JSON stored in a text column is parsed on the fly
    pub fn json(&self, column: usize) -> Result<Option<serde_json::Value>, StoreError> {
        match self.get(column)? {
            Value::Null => Ok(None),
            Value::Json(v) => Ok(Some(v.clone())),
            Value::Text(v) => Ok(Some(serde_json::from_str(v)?)),
            _ => Err(self.mismatch(column, "json")),
        }
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Row::new(values)
    }
}

/// A source of rows for named aggregation queries
///
/// This is the only view of the database the collectors get: they name
/// a `Query` and receive decoded rows back.
#[async_trait]
pub trait Store: Send {
    /// Runs `query` and returns every result row
    async fn fetch(&mut self, query: &Query) -> Result<Vec<Row>, StoreError>;

    /// Runs a single-value query such as `COUNT(*)`
    ///
    /// An empty result reads as zero.
    async fn fetch_count(&mut self, query: &Query) -> Result<i64, StoreError> {
        let rows = self.fetch(query).await?;
        match rows.first() {
            Some(row) => Ok(row.opt_int(0)?.unwrap_or(0)),
            None => Ok(0),
        }
    }
}

/// A physical connection the pool can lend out
///
/// Besides answering queries, a connection supports the transaction and
/// savepoint control the pool and the collector manager rely on.
#[async_trait]
pub trait Connection: Store + Sized + 'static {
    async fn begin(&mut self) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    /// Cheap liveness check used before an idle connection is reused
    async fn ping(&mut self) -> Result<(), StoreError>;

    async fn close(self) -> Result<(), StoreError>;
}

/// Opens new physical connections for the pool
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self) -> Result<Self::Connection, StoreError>;
}
