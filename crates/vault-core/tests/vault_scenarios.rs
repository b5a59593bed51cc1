//! End-to-end tests for the vault API over file-backed SQLite storage.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;
use vault_core::storage::{Row, Value};
use vault_core::{
    SqliteStorage, Storage, StorageError, Transaction, Vault, VaultConfig, VaultError,
};

async fn open_vault(dir: &TempDir) -> (Vault, Arc<SqliteStorage>) {
    let storage = Arc::new(SqliteStorage::open(dir.path().join("vault.db")).unwrap());
    let vault = Vault::open(storage.clone(), VaultConfig::minimal())
        .await
        .expect("open vault");
    (vault, storage)
}

// ---------------------------------------------------------------------------
// The alice scenario
// ---------------------------------------------------------------------------

#[tokio::test]
async fn alice_full_lifecycle() {
    let dir = TempDir::new().unwrap();
    let (vault, _storage) = open_vault(&dir).await;

    vault.create_principal("alice", "Tr0ub4dor&3").await.unwrap();
    let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();

    assert!(matches!(
        vault.authenticate("alice", "wrong").await,
        Err(VaultError::AuthenticationFailed)
    ));

    let id = vault
        .create_secret(session, "github.com", "alice", "s3cr3t!", None)
        .await
        .unwrap();
    assert_eq!(vault.read_secret(session, id).await.unwrap().expose(), "s3cr3t!");

    vault
        .change_master_secret(session, "correct horse battery staple")
        .await
        .unwrap();
    vault.logout(session).await.unwrap();

    let session = vault
        .authenticate("alice", "correct horse battery staple")
        .await
        .unwrap();
    assert_eq!(vault.read_secret(session, id).await.unwrap().expose(), "s3cr3t!");
}

#[tokio::test]
async fn secrets_survive_reopen() {
    let dir = TempDir::new().unwrap();

    let id = {
        let (vault, _storage) = open_vault(&dir).await;
        vault.create_principal("alice", "Tr0ub4dor&3").await.unwrap();
        let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
        let id = vault
            .create_secret(session, "github.com", "alice", "s3cr3t!", Some("recovery codes in safe"))
            .await
            .unwrap();
        vault.shutdown().await;
        id
    };

    let (vault, _storage) = open_vault(&dir).await;
    let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();

    let entry = vault.read_entry(session, id).await.unwrap();
    assert_eq!(entry.secret.expose(), "s3cr3t!");
    assert_eq!(
        entry.note.as_ref().map(|n| n.expose()),
        Some("recovery codes in safe")
    );
    assert_eq!(entry.summary.label, "github.com");
}

#[tokio::test]
async fn plaintext_never_reaches_storage() {
    let dir = TempDir::new().unwrap();
    let (vault, storage) = open_vault(&dir).await;

    vault.create_principal("alice", "Tr0ub4dor&3").await.unwrap();
    let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
    vault
        .create_secret(session, "github.com", "alice", "s3cr3t!", Some("hidden note"))
        .await
        .unwrap();

    let rows = storage
        .execute("SELECT ciphertext, note_ciphertext FROM secrets", &[])
        .await
        .unwrap();
    let ciphertext = rows[0].text(0).unwrap();
    let note = rows[0].text(1).unwrap();
    assert!(!ciphertext.contains("s3cr3t!"));
    assert!(!note.contains("hidden note"));
    assert_eq!(ciphertext.split(':').count(), 3);
}

// ---------------------------------------------------------------------------
// change_master_secret atomicity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn change_master_secret_rolls_back_on_tampered_row() {
    let dir = TempDir::new().unwrap();
    let (vault, storage) = open_vault(&dir).await;

    vault.create_principal("alice", "Tr0ub4dor&3").await.unwrap();
    let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();

    let intact = vault
        .create_secret(session, "a.example", "alice", "first", None)
        .await
        .unwrap();
    let tampered = vault
        .create_secret(session, "b.example", "alice", "second", None)
        .await
        .unwrap();

    let before = storage
        .execute(
            "SELECT ciphertext FROM secrets WHERE secret_id = ?1",
            &[Value::from(intact.to_string())],
        )
        .await
        .unwrap()[0]
        .text(0)
        .unwrap()
        .to_string();

    // Flip the last hex digit of the ciphertext
    storage
        .execute(
            "UPDATE secrets SET ciphertext = substr(ciphertext, 1, length(ciphertext) - 1) ||
                 CASE substr(ciphertext, -1) WHEN '0' THEN '1' ELSE '0' END
             WHERE secret_id = ?1",
            &[Value::from(tampered.to_string())],
        )
        .await
        .unwrap();

    let err = vault
        .change_master_secret(session, "new master secret")
        .await
        .unwrap_err();
    assert!(err.is_integrity_failure());

    let after = storage
        .execute(
            "SELECT ciphertext FROM secrets WHERE secret_id = ?1",
            &[Value::from(intact.to_string())],
        )
        .await
        .unwrap()[0]
        .text(0)
        .unwrap()
        .to_string();
    assert_eq!(before, after);

    // Still the old secret and the old key
    assert_eq!(vault.read_secret(session, intact).await.unwrap().expose(), "first");
    vault.logout(session).await.unwrap();
    assert!(vault.authenticate("alice", "Tr0ub4dor&3").await.is_ok());
    assert!(matches!(
        vault.authenticate("alice", "new master secret").await,
        Err(VaultError::AuthenticationFailed)
    ));
}

/// Storage wrapper whose transactions fail the n-th `UPDATE secrets`
struct FlakyStorage {
    inner: SqliteStorage,
    fail_at: Arc<AtomicUsize>,
}

struct FlakyTransaction {
    inner: Box<dyn Transaction>,
    fail_at: Arc<AtomicUsize>,
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn execute(&self, query: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
        self.inner.execute(query, params).await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>, StorageError> {
        Ok(Box::new(FlakyTransaction {
            inner: self.inner.begin_transaction().await?,
            fail_at: self.fail_at.clone(),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

#[async_trait]
impl Transaction for FlakyTransaction {
    async fn execute(&mut self, query: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
        if query.trim_start().starts_with("UPDATE secrets")
            && self.fail_at.fetch_sub(1, Ordering::SeqCst) == 1
        {
            return Err(StorageError::RowShape("injected write failure".into()));
        }
        self.inner.execute(query, params).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.rollback().await
    }
}

#[tokio::test]
async fn change_master_secret_rolls_back_mid_batch_write_failure() {
    let fail_at = Arc::new(AtomicUsize::new(usize::MAX));
    let storage = Arc::new(FlakyStorage {
        inner: SqliteStorage::open_in_memory().unwrap(),
        fail_at: fail_at.clone(),
    });
    let vault = Vault::open(storage.clone(), VaultConfig::minimal())
        .await
        .unwrap();

    vault.create_principal("alice", "Tr0ub4dor&3").await.unwrap();
    let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            vault
                .create_secret(session, &format!("site{i}.example"), "alice", &format!("pw-{i}"), None)
                .await
                .unwrap(),
        );
    }

    // Third re-encrypted row fails to write
    fail_at.store(3, Ordering::SeqCst);
    let err = vault
        .change_master_secret(session, "new master secret")
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Storage(_)));
    fail_at.store(usize::MAX, Ordering::SeqCst);

    // Every row is still readable under the key the session holds
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(
            vault.read_secret(session, *id).await.unwrap().expose(),
            format!("pw-{i}")
        );
    }

    vault.logout(session).await.unwrap();
    let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
    assert_eq!(vault.list_secrets(session).await.unwrap().len(), 5);
}

// ---------------------------------------------------------------------------
// Operations racing a master secret change
// ---------------------------------------------------------------------------

/// Storage wrapper that can hold the next transaction before it starts, or
/// stall the next commit after it lands
#[derive(Default)]
struct Hooks {
    hold_next_begin: AtomicBool,
    begin_entered: Notify,
    begin_released: Notify,
    slow_next_commit: AtomicBool,
}

struct HookedStorage {
    inner: SqliteStorage,
    hooks: Arc<Hooks>,
}

struct HookedTransaction {
    inner: Box<dyn Transaction>,
    hooks: Arc<Hooks>,
}

#[async_trait]
impl Storage for HookedStorage {
    async fn execute(&self, query: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
        self.inner.execute(query, params).await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn Transaction>, StorageError> {
        if self.hooks.hold_next_begin.swap(false, Ordering::SeqCst) {
            self.hooks.begin_entered.notify_one();
            self.hooks.begin_released.notified().await;
        }
        Ok(Box::new(HookedTransaction {
            inner: self.inner.begin_transaction().await?,
            hooks: self.hooks.clone(),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "hooked"
    }
}

#[async_trait]
impl Transaction for HookedTransaction {
    async fn execute(&mut self, query: &str, params: &[Value]) -> Result<Vec<Row>, StorageError> {
        self.inner.execute(query, params).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.commit().await?;
        if self.hooks.slow_next_commit.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1_100)).await;
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        self.inner.rollback().await
    }
}

async fn hooked_vault(config: VaultConfig) -> (Arc<Vault>, Arc<Hooks>) {
    let hooks = Arc::new(Hooks::default());
    let storage = Arc::new(HookedStorage {
        inner: SqliteStorage::open_in_memory().unwrap(),
        hooks: hooks.clone(),
    });
    let vault = Vault::open(storage, config).await.unwrap();
    (Arc::new(vault), hooks)
}

#[tokio::test]
async fn secret_created_during_master_secret_change_stays_readable() {
    let (vault, hooks) = hooked_vault(VaultConfig::minimal()).await;
    vault.create_principal("alice", "Tr0ub4dor&3").await.unwrap();
    let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
    let other = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
    let before = vault
        .create_secret(session, "github.com", "alice", "s3cr3t!", None)
        .await
        .unwrap();

    // The write has validated its session and waits to open its transaction
    hooks.hold_next_begin.store(true, Ordering::SeqCst);
    let writer = tokio::spawn({
        let vault = vault.clone();
        async move {
            vault
                .create_secret(session, "late.example", "alice", "written meanwhile", Some("n"))
                .await
        }
    });
    hooks.begin_entered.notified().await;

    vault
        .change_master_secret(session, "correct horse battery staple")
        .await
        .unwrap();
    hooks.begin_released.notify_one();
    let late = writer.await.unwrap().unwrap();

    let entry = vault.read_entry(session, late).await.unwrap();
    assert_eq!(entry.secret.expose(), "written meanwhile");
    assert_eq!(entry.note.as_ref().map(|n| n.expose()), Some("n"));
    assert!(matches!(
        vault.read_secret(other, late).await,
        Err(VaultError::Session(_))
    ));

    vault.logout(session).await.unwrap();
    let session = vault
        .authenticate("alice", "correct horse battery staple")
        .await
        .unwrap();
    assert_eq!(vault.read_secret(session, before).await.unwrap().expose(), "s3cr3t!");
    assert_eq!(
        vault.read_secret(session, late).await.unwrap().expose(),
        "written meanwhile"
    );
}

#[tokio::test]
async fn login_racing_master_secret_change_is_refused() {
    let (vault, hooks) = hooked_vault(VaultConfig::minimal()).await;
    vault.create_principal("alice", "Tr0ub4dor&3").await.unwrap();
    let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
    let id = vault
        .create_secret(session, "github.com", "alice", "s3cr3t!", None)
        .await
        .unwrap();

    // The login has verified the old secret and waits to register its session
    hooks.hold_next_begin.store(true, Ordering::SeqCst);
    let login = tokio::spawn({
        let vault = vault.clone();
        async move { vault.authenticate("alice", "Tr0ub4dor&3").await }
    });
    hooks.begin_entered.notified().await;

    vault
        .change_master_secret(session, "correct horse battery staple")
        .await
        .unwrap();
    hooks.begin_released.notify_one();

    assert!(matches!(
        login.await.unwrap(),
        Err(VaultError::AuthenticationFailed)
    ));
    assert_eq!(vault.active_sessions().await, 1);
    assert_eq!(vault.read_secret(session, id).await.unwrap().expose(), "s3cr3t!");
}

#[tokio::test]
async fn master_secret_change_succeeds_when_session_ends_after_commit() {
    let config = VaultConfig {
        session_timeout_secs: 1,
        ..VaultConfig::minimal()
    };
    let (vault, hooks) = hooked_vault(config).await;
    vault.create_principal("alice", "Tr0ub4dor&3").await.unwrap();
    let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
    let other = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
    let id = vault
        .create_secret(session, "github.com", "alice", "s3cr3t!", None)
        .await
        .unwrap();

    // The session times out between the commit and the bookkeeping after it
    hooks.slow_next_commit.store(true, Ordering::SeqCst);
    vault
        .change_master_secret(session, "correct horse battery staple")
        .await
        .unwrap();

    assert!(vault.read_secret(other, id).await.is_err());
    assert!(matches!(
        vault.authenticate("alice", "Tr0ub4dor&3").await,
        Err(VaultError::AuthenticationFailed)
    ));
    let session = vault
        .authenticate("alice", "correct horse battery staple")
        .await
        .unwrap();
    assert_eq!(vault.read_secret(session, id).await.unwrap().expose(), "s3cr3t!");
}
