//! Schema migrations
//!
//! Migrations are applied in ascending version order, one storage transaction
//! per migration. The version bump is written inside the same transaction, so
//! a failed step leaves both the schema and `schema_version` untouched.

use tracing::{debug, info, warn};

use crate::error::{MigrationError, StorageError};
use crate::storage::{Storage, Transaction, Value};

/// Schema version this build of the core operates against
pub const SCHEMA_VERSION: u32 = 3;

const CREATE_VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    current_version INTEGER NOT NULL
)";

const VERSION_TABLE_EXISTS: &str =
    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'";

const SELECT_VERSION: &str = "SELECT current_version FROM schema_version WHERE id = 1";

const UPSERT_VERSION: &str = "INSERT INTO schema_version (id, current_version) VALUES (1, ?1)
    ON CONFLICT(id) DO UPDATE SET current_version = excluded.current_version";

/// One schema step
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Version the schema is at once this migration has run
    pub version: u32,
    pub name: &'static str,
    /// Statements executed in order inside one transaction
    pub statements: &'static [&'static str],
}

static BUILTIN_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_principals_and_secrets",
        statements: &[
            "CREATE TABLE principals (
                principal_id TEXT PRIMARY KEY,
                identifier TEXT NOT NULL UNIQUE,
                salt BLOB NOT NULL,
                verification_hash BLOB NOT NULL,
                hash_parameters TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE secrets (
                secret_id TEXT PRIMARY KEY,
                principal_id TEXT NOT NULL REFERENCES principals (principal_id) ON DELETE CASCADE,
                label TEXT NOT NULL,
                account_identifier TEXT NOT NULL,
                ciphertext TEXT NOT NULL,
                note_ciphertext TEXT,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL
            )",
        ],
    },
    Migration {
        version: 2,
        name: "index_secrets_by_principal",
        statements: &[
            "CREATE INDEX idx_secrets_principal_label ON secrets (principal_id, label COLLATE NOCASE)",
        ],
    },
    Migration {
        version: 3,
        name: "track_verification_rotation",
        statements: &["ALTER TABLE principals ADD COLUMN rotated_at TEXT"],
    },
];

/// Where a store stands relative to the migrations this build knows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current: u32,
    pub latest: u32,
    /// `(version, name)` of every migration still to run
    pub pending: Vec<(u32, &'static str)>,
}

impl SchemaStatus {
    pub fn is_ready(&self) -> bool {
        self.current == self.latest
    }
}

/// Brings storage to the latest schema version
#[derive(Debug, Clone)]
pub struct SchemaMigrator {
    migrations: Vec<Migration>,
}

impl Default for SchemaMigrator {
    fn default() -> Self {
        Self {
            migrations: BUILTIN_MIGRATIONS.to_vec(),
        }
    }
}

impl SchemaMigrator {
    /// Build a migrator over a custom plan. Versions must start above zero and
    /// be strictly ascending.
    pub fn new(migrations: Vec<Migration>) -> Result<Self, MigrationError> {
        let mut previous = 0;
        for migration in &migrations {
            if migration.version <= previous {
                return Err(MigrationError::InvalidPlan(format!(
                    "migration {} ({}) does not follow version {}",
                    migration.version, migration.name, previous
                )));
            }
            previous = migration.version;
        }
        Ok(Self { migrations })
    }

    /// The migrations shipped with the vault
    pub fn builtin_migrations() -> &'static [Migration] {
        BUILTIN_MIGRATIONS
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Highest version this migrator can produce
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map_or(0, |m| m.version)
    }

    /// Read the persisted schema version (0 for a fresh store). Never
    /// writes to the store.
    pub async fn current_version(&self, storage: &dyn Storage) -> Result<u32, MigrationError> {
        if storage.execute(VERSION_TABLE_EXISTS, &[]).await?.is_empty() {
            return Ok(0);
        }
        let rows = storage.execute(SELECT_VERSION, &[]).await?;
        Ok(parse_version(rows.first().map(|r| r.integer(0)).transpose()?)?)
    }

    pub async fn status(&self, storage: &dyn Storage) -> Result<SchemaStatus, MigrationError> {
        let current = self.current_version(storage).await?;
        let pending = self
            .migrations
            .iter()
            .filter(|m| m.version > current)
            .map(|m| (m.version, m.name))
            .collect();

        Ok(SchemaStatus {
            current,
            latest: self.latest_version(),
            pending,
        })
    }

    /// Apply every migration above the current version, in order
    ///
    /// Returns the version the store ends at. Running it again once the store
    /// is current does nothing.
    pub async fn migrate_to_latest(&self, storage: &dyn Storage) -> Result<u32, MigrationError> {
        let mut applied = self.current_version(storage).await?;
        let latest = self.latest_version();

        if applied > latest {
            return Err(MigrationError::StorageAhead {
                found: applied,
                latest,
            });
        }
        if applied == latest {
            debug!("Schema already at version {}", applied);
            return Ok(applied);
        }

        let start = applied;
        for migration in self.migrations.iter().filter(|m| m.version > start) {
            info!(
                "Applying migration {} ({})",
                migration.version, migration.name
            );
            if let Err(source) = apply(storage, migration).await {
                warn!(
                    "Migration {} failed, schema remains at version {}: {}",
                    migration.version, applied, source
                );
                return Err(MigrationError::StepFailed {
                    version: migration.version,
                    applied,
                    source,
                });
            }
            applied = migration.version;
        }

        info!("Schema migrated to version {}", applied);
        Ok(applied)
    }
}

fn parse_version(raw: Option<i64>) -> Result<u32, StorageError> {
    match raw {
        None => Ok(0),
        Some(v) => u32::try_from(v)
            .map_err(|_| StorageError::RowShape(format!("invalid schema version {v}"))),
    }
}

async fn apply(storage: &dyn Storage, migration: &Migration) -> Result<(), StorageError> {
    let mut tx = storage.begin_transaction().await?;
    match run_steps(tx.as_mut(), migration).await {
        Ok(()) => tx.commit().await,
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!("Rollback of migration {} failed: {}", migration.version, rollback);
            }
            Err(e)
        }
    }
}

async fn run_steps(tx: &mut dyn Transaction, migration: &Migration) -> Result<(), StorageError> {
    tx.execute(CREATE_VERSION_TABLE, &[]).await?;

    // Another process may have applied it since we read the version
    let rows = tx.execute(SELECT_VERSION, &[]).await?;
    let current = parse_version(rows.first().map(|r| r.integer(0)).transpose()?)?;
    if current >= migration.version {
        debug!("Migration {} already applied elsewhere", migration.version);
        return Ok(());
    }

    for statement in migration.statements {
        tx.execute(statement, &[]).await?;
    }
    tx.execute(UPSERT_VERSION, &[Value::from(migration.version)])
        .await?;
    Ok(())
}
