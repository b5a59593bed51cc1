//! SQLite storage backend
//!
//! rusqlite is blocking, so every statement runs on tokio's blocking pool.
//! Ownership of the connection is tracked by an async gate: a plain statement
//! holds it for one call, a transaction holds it until it commits, rolls back
//! or is dropped, so nothing else can interleave with an open transaction.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use directories::ProjectDirs;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, ToSql};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::{Row, Storage, Transaction, Value};
use crate::error::StorageError;

const DATABASE_FILE: &str = "vault.db";

type SharedConnection = Arc<Mutex<Connection>>;

/// SQLite storage backend
pub struct SqliteStorage {
    conn: SharedConnection,
    gate: Arc<AsyncMutex<()>>,
    path: Option<PathBuf>,
}

impl SqliteStorage {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(StorageError::backend)?;
        Self::configure(&conn)?;

        debug!("SQLite storage opened at: {:?}", path);

        Ok(Self::with_connection(conn, Some(path.to_path_buf())))
    }

    /// Open a private in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(StorageError::backend)?;
        Self::configure(&conn)?;

        Ok(Self::with_connection(conn, None))
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            gate: Arc::new(AsyncMutex::new(())),
            path,
        }
    }

    /// Get the default database location in the user's data directory
    pub fn default_path() -> Result<PathBuf, StorageError> {
        ProjectDirs::from("com", "symbia-labs", "secret-vault")
            .map(|dirs| dirs.data_dir().join(DATABASE_FILE))
            .ok_or_else(|| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "could not determine data directory",
                ))
            })
    }

    /// Path of the database file, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn configure(conn: &Connection) -> Result<(), StorageError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(StorageError::backend)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(StorageError::backend)?;
        Ok(())
    }
}

/// Run `f` against the connection on the blocking pool
async fn blocking<T, F>(conn: &SharedConnection, f: F) -> Result<T, StorageError>
where
    F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    })
    .await
    .map_err(StorageError::backend)?
}

fn batch(conn: &Connection, sql: &str) -> Result<(), StorageError> {
    conn.execute_batch(sql).map_err(StorageError::backend)
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

fn run(conn: &Connection, query: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
    let mut stmt = conn.prepare(query).map_err(StorageError::backend)?;
    let column_count = stmt.column_count();
    let mut rows = stmt
        .query(rusqlite::params_from_iter(params.iter()))
        .map_err(StorageError::backend)?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(StorageError::backend)? {
        let mut values = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            let value = match row.get_ref(idx).map_err(StorageError::backend)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(i) => Value::Integer(i),
                ValueRef::Real(f) => Value::Real(f),
                ValueRef::Text(t) => Value::Text(
                    String::from_utf8(t.to_vec()).map_err(StorageError::backend)?,
                ),
                ValueRef::Blob(b) => Value::Blob(b.to_vec()),
            };
            values.push(value);
        }
        out.push(Row::new(values));
    }

    Ok(out)
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn execute(&self, query: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
        let _gate = self.gate.lock().await;
        let (query, params) = (query.to_string(), params.to_vec());
        blocking(&self.conn, move |conn| run(conn, &query, &params)).await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>, StorageError> {
        let gate = self.gate.clone().lock_owned().await;
        blocking(&self.conn, |conn| batch(conn, "BEGIN IMMEDIATE")).await?;

        Ok(Box::new(SqliteTransaction {
            conn: self.conn.clone(),
            gate: Some(gate),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "SQLite"
    }
}

/// Open SQLite transaction; owns the connection until finished
pub struct SqliteTransaction {
    conn: SharedConnection,
    /// `None` once committed or rolled back
    gate: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn execute(&mut self, query: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
        let (query, params) = (query.to_string(), params.to_vec());
        blocking(&self.conn, move |conn| run(conn, &query, &params)).await
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        // On failure the gate stays held and Drop rolls back
        blocking(&self.conn, |conn| batch(conn, "COMMIT")).await?;
        self.gate = None;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        let result = blocking(&self.conn, |conn| batch(conn, "ROLLBACK")).await;
        self.gate = None;
        result
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        let Some(gate) = self.gate.take() else {
            return;
        };
        let conn = self.conn.clone();
        // The gate is released only after the rollback ran
        let rollback = move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            match batch(&conn, "ROLLBACK") {
                Ok(()) => debug!("Rolled back unfinished transaction"),
                Err(e) => warn!("Failed to roll back unfinished transaction: {}", e),
            }
            drop(gate);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(rollback);
            }
            Err(_) => rollback(),
        }
    }
}
