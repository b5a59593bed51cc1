//! Storage trait definitions
//!
//! The vault only talks to its relational store through these traits. Queries
//! are always parameterized; values never get interpolated into SQL text.

use async_trait::async_trait;

use crate::error::StorageError;

/// A single bound parameter or column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Self::Blob(value.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// One result row, columns in select order
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    fn column(&self, idx: usize) -> Result<&Value, StorageError> {
        self.values
            .get(idx)
            .ok_or_else(|| StorageError::RowShape(format!("missing column {idx}")))
    }

    pub fn text(&self, idx: usize) -> Result<&str, StorageError> {
        match self.column(idx)? {
            Value::Text(s) => Ok(s),
            other => Err(StorageError::RowShape(format!(
                "column {idx}: expected text, got {other:?}"
            ))),
        }
    }

    pub fn opt_text(&self, idx: usize) -> Result<Option<&str>, StorageError> {
        match self.column(idx)? {
            Value::Null => Ok(None),
            Value::Text(s) => Ok(Some(s)),
            other => Err(StorageError::RowShape(format!(
                "column {idx}: expected text or null, got {other:?}"
            ))),
        }
    }

    pub fn integer(&self, idx: usize) -> Result<i64, StorageError> {
        match self.column(idx)? {
            Value::Integer(i) => Ok(*i),
            other => Err(StorageError::RowShape(format!(
                "column {idx}: expected integer, got {other:?}"
            ))),
        }
    }

    pub fn blob(&self, idx: usize) -> Result<&[u8], StorageError> {
        match self.column(idx)? {
            Value::Blob(b) => Ok(b),
            other => Err(StorageError::RowShape(format!(
                "column {idx}: expected blob, got {other:?}"
            ))),
        }
    }
}

/// Relational storage collaborator
#[async_trait]
pub trait Storage: Send + Sync {
    /// Run one parameterized statement outside any explicit transaction
    async fn execute(&self, query: &str, params: &[Value]) -> Result<Vec<Row>, StorageError>;

    /// Start a transaction. The returned handle has exclusive use of the store
    /// until it is committed, rolled back or dropped; dropping rolls back.
    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>, StorageError>;

    /// Get a human-readable name for this storage backend
    fn backend_name(&self) -> &'static str;
}

/// An open transaction
#[async_trait]
pub trait Transaction: Send {
    /// Run one parameterized statement inside the transaction
    async fn execute(&mut self, query: &str, params: &[Value]) -> Result<Vec<Row>, StorageError>;

    /// Make every statement of the transaction durable
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discard every statement of the transaction
    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}
