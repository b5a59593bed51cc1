//! Schema migration against file-backed storage.

use std::sync::Arc;

use tempfile::TempDir;
use vault_core::migrations::Migration;
use vault_core::{
    MigrationError, SchemaMigrator, SqliteStorage, Storage, Vault, VaultConfig, VaultError,
    SCHEMA_VERSION,
};

fn db_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("vault.db")
}

async fn table_names(storage: &dyn Storage) -> Vec<String> {
    storage
        .execute(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
            &[],
        )
        .await
        .unwrap()
        .iter()
        .map(|row| row.text(0).unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn fresh_database_migrates_to_latest() {
    let dir = TempDir::new().unwrap();
    let storage = SqliteStorage::open(db_path(&dir)).unwrap();
    let migrator = SchemaMigrator::default();

    assert_eq!(migrator.migrate_to_latest(&storage).await.unwrap(), SCHEMA_VERSION);

    assert_eq!(
        table_names(&storage).await,
        ["principals", "schema_version", "secrets"]
    );
}

#[tokio::test]
async fn version_persists_across_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let storage = SqliteStorage::open(db_path(&dir)).unwrap();
        SchemaMigrator::default()
            .migrate_to_latest(&storage)
            .await
            .unwrap();
    }

    let storage = SqliteStorage::open(db_path(&dir)).unwrap();
    let status = SchemaMigrator::default().status(&storage).await.unwrap();
    assert!(status.is_ready());
    assert!(status.pending.is_empty());
    assert_eq!(status.current, SCHEMA_VERSION);
}

#[tokio::test]
async fn attach_to_fresh_storage_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(db_path(&dir)).unwrap());

    assert!(matches!(
        Vault::attach(storage.clone(), VaultConfig::minimal()).await,
        Err(VaultError::SchemaNotReady { found: 0, expected: SCHEMA_VERSION })
    ));
    assert!(table_names(storage.as_ref()).await.is_empty());
}

#[tokio::test]
async fn vault_refuses_storage_behind_and_ahead() {
    let dir = TempDir::new().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open(db_path(&dir)).unwrap());

    let partial = SchemaMigrator::new(SchemaMigrator::builtin_migrations()[..1].to_vec()).unwrap();
    partial.migrate_to_latest(storage.as_ref()).await.unwrap();

    assert!(matches!(
        Vault::attach(storage.clone(), VaultConfig::minimal()).await,
        Err(VaultError::SchemaNotReady { found: 1, expected: SCHEMA_VERSION })
    ));

    let mut plan = SchemaMigrator::builtin_migrations().to_vec();
    plan.push(Migration {
        version: SCHEMA_VERSION + 1,
        name: "add_favourites",
        statements: &["ALTER TABLE secrets ADD COLUMN favourite INTEGER NOT NULL DEFAULT 0"],
    });
    SchemaMigrator::new(plan)
        .unwrap()
        .migrate_to_latest(storage.as_ref())
        .await
        .unwrap();

    assert!(matches!(
        Vault::attach(storage.clone(), VaultConfig::minimal()).await,
        Err(VaultError::Migration(MigrationError::StorageAhead { .. }))
    ));
    assert!(matches!(
        Vault::open(storage, VaultConfig::minimal()).await,
        Err(VaultError::Migration(MigrationError::StorageAhead { .. }))
    ));
}

#[tokio::test]
async fn failed_step_keeps_data_and_version() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(SqliteStorage::open(db_path(&dir)).unwrap());

    let id = {
        let vault = Vault::open(storage.clone(), VaultConfig::minimal())
            .await
            .unwrap();
        vault.create_principal("alice", "Tr0ub4dor&3").await.unwrap();
        let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
        vault
            .create_secret(session, "github.com", "alice", "s3cr3t!", None)
            .await
            .unwrap()
    };

    let mut plan = SchemaMigrator::builtin_migrations().to_vec();
    plan.push(Migration {
        version: SCHEMA_VERSION + 1,
        name: "broken_backfill",
        statements: &[
            "ALTER TABLE secrets ADD COLUMN favourite INTEGER",
            "UPDATE secrets SET favourite = 1",
            "UPDATE no_such_table SET x = 1",
        ],
    });
    let result = SchemaMigrator::new(plan)
        .unwrap()
        .migrate_to_latest(storage.as_ref())
        .await;
    assert!(matches!(
        result,
        Err(MigrationError::StepFailed { applied, .. }) if applied == SCHEMA_VERSION
    ));

    let columns = storage
        .execute("SELECT name FROM pragma_table_info('secrets')", &[])
        .await
        .unwrap();
    assert!(columns.iter().all(|row| row.text(0).unwrap() != "favourite"));

    let vault = Vault::attach(storage, VaultConfig::minimal()).await.unwrap();
    let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
    assert_eq!(vault.read_secret(session, id).await.unwrap().expose(), "s3cr3t!");
}
