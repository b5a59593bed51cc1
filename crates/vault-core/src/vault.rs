//! Main vault orchestration

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStats, ResultCache};
use crate::config::VaultConfig;
use crate::crypto::{
    decrypt_string, derive, encrypt_string, generate_salt, DerivedKeys, HashParameters,
    MasterSecret, SecretString, SessionKey, SALT_LEN,
};
use crate::error::{
    CipherError, ConfigurationError, DerivationError, MigrationError, Result, StorageError,
    VaultError,
};
use crate::migrations::{SchemaMigrator, SchemaStatus, SCHEMA_VERSION};
use crate::principal::{PrincipalId, VerificationRecord};
use crate::secret::{SecretEntry, SecretId, SecretRecord, SecretStore, SecretSummary, SecretUpdate};
use crate::session::{SessionId, SessionInfo, SessionRegistry};
use crate::storage::{Storage, Transaction};

/// Salt for the decoy derivation run for unknown principals
const DECOY_SALT: [u8; SALT_LEN] = [0x5a; SALT_LEN];

/// Logins retried when the verification record changes under them
const LOGIN_ATTEMPTS: usize = 3;

type Listing = Arc<Vec<SecretSummary>>;

/// Fresh verification material for a principal
struct Enrollment {
    salt: Vec<u8>,
    params: HashParameters,
    keys: DerivedKeys,
}

fn enroll(
    secret: &MasterSecret,
    params: HashParameters,
) -> std::result::Result<Enrollment, DerivationError> {
    let salt = generate_salt().to_vec();
    let keys = derive(secret, &salt, &params)?;
    Ok(Enrollment { salt, params, keys })
}

/// Run CPU-heavy derivation work off the async executor
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> std::result::Result<T, DerivationError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DerivationError::Failed(format!("derivation task failed: {e}")))?
        .map_err(VaultError::from)
}

/// Commit on success, roll back on failure
async fn finish<T>(tx: Box<dyn Transaction>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!("Rollback failed: {}", rollback);
            }
            Err(e)
        }
    }
}

/// Decrypt every record with `old_key` and encrypt it again under `new_key`
fn reencrypt(
    records: &[SecretRecord],
    old_key: &SessionKey,
    new_key: &SessionKey,
) -> std::result::Result<Vec<SecretRecord>, CipherError> {
    records
        .iter()
        .map(|record| {
            let secret = decrypt_string(&record.ciphertext, old_key, &record.id.aad())?;
            let note = record
                .note_ciphertext
                .as_deref()
                .map(|note| decrypt_string(note, old_key, &record.id.note_aad()))
                .transpose()?;

            let mut rewritten = record.clone();
            rewritten.ciphertext = encrypt_string(secret.expose(), new_key, &record.id.aad())?;
            rewritten.note_ciphertext = note
                .map(|note| encrypt_string(note.expose(), new_key, &record.id.note_aad()))
                .transpose()?;
            Ok(rewritten)
        })
        .collect()
}

/// Where the key currently protecting a principal's records comes from
enum CurrentKey<'a> {
    /// Just derived during authentication, not registered yet
    Derived(&'a SessionKey),
    /// Held by the registry for this session
    Session(SessionId),
}

fn non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ConfigurationError::Invalid(format!("{field} must not be empty")).into());
    }
    Ok(())
}

/// Main vault struct that orchestrates all functionality
pub struct Vault {
    storage: Arc<dyn Storage>,
    config: VaultConfig,
    sessions: SessionRegistry,
    cache: ResultCache<Listing>,
}

impl Vault {
    /// Bring storage to the latest schema, then attach to it
    pub async fn open(storage: Arc<dyn Storage>, config: VaultConfig) -> Result<Self> {
        config.validate()?;
        SchemaMigrator::default()
            .migrate_to_latest(storage.as_ref())
            .await?;
        Self::attach(storage, config).await
    }

    /// Attach to storage without migrating. Storage that is not exactly at
    /// the schema version this build expects is refused.
    pub async fn attach(storage: Arc<dyn Storage>, config: VaultConfig) -> Result<Self> {
        config.validate()?;
        let current = SchemaMigrator::default()
            .current_version(storage.as_ref())
            .await?;

        if current < SCHEMA_VERSION {
            return Err(VaultError::SchemaNotReady {
                found: current,
                expected: SCHEMA_VERSION,
            });
        }
        if current > SCHEMA_VERSION {
            return Err(MigrationError::StorageAhead {
                found: current,
                latest: SCHEMA_VERSION,
            }
            .into());
        }

        info!(
            "Vault attached to {} storage at schema version {}",
            storage.backend_name(),
            current
        );

        Ok(Self {
            cache: ResultCache::new(config.cache_config()),
            sessions: SessionRegistry::new(),
            storage,
            config,
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub async fn schema_status(&self) -> Result<SchemaStatus> {
        Ok(SchemaMigrator::default().status(self.storage.as_ref()).await?)
    }

    /// Enroll a new principal under `identifier`
    pub async fn create_principal(
        &self,
        identifier: &str,
        master_secret: impl Into<MasterSecret>,
    ) -> Result<PrincipalId> {
        non_empty("identifier", identifier)?;
        let master_secret = master_secret.into();
        let params = self.config.hash_parameters();
        let enrollment = blocking(move || enroll(&master_secret, params)).await?;

        let record = VerificationRecord {
            principal_id: PrincipalId::new(),
            identifier: identifier.to_string(),
            salt: enrollment.salt,
            verification_hash: enrollment.keys.verification_hash.as_bytes().to_vec(),
            hash_parameters: enrollment.params,
            created_at: Utc::now(),
            rotated_at: None,
        };

        let mut tx = self.storage.begin_transaction().await?;
        let result: Result<()> = async {
            if VerificationRecord::identifier_taken(tx.as_mut(), identifier).await? {
                return Err(VaultError::PrincipalExists);
            }
            record.insert(tx.as_mut()).await
        }
        .await;
        finish(tx, result).await?;

        info!("Created principal {}", record.principal_id);
        Ok(record.principal_id)
    }

    /// Verify a master secret and open a session
    ///
    /// Unknown principals and wrong secrets fail identically, and both pay
    /// for a full derivation.
    pub async fn authenticate(
        &self,
        identifier: &str,
        master_secret: impl Into<MasterSecret>,
    ) -> Result<SessionId> {
        let master_secret = Arc::new(master_secret.into());
        let target = self.config.hash_parameters();
        let mut allow_upgrade = self.config.rehash_on_login;

        for _ in 0..LOGIN_ATTEMPTS {
            let Some(record) =
                VerificationRecord::find_by_identifier(self.storage.as_ref(), identifier).await?
            else {
                let _ = blocking(move || derive(&master_secret, &DECOY_SALT, &target)).await;
                info!("Authentication failed");
                return Err(VaultError::AuthenticationFailed);
            };

            let upgrade = allow_upgrade && record.hash_parameters.needs_rehash(&target);
            let secret = master_secret.clone();
            let salt = record.salt.clone();
            let stored_params = record.hash_parameters;
            let expected = record.verification_hash.clone();

            let verified = blocking(move || {
                let keys = derive(&secret, &salt, &stored_params)?;
                if !keys.verification_hash.matches(&expected) {
                    return Ok(None);
                }
                let enrollment = if upgrade {
                    match enroll(&secret, target) {
                        Ok(enrollment) => Some(enrollment),
                        Err(e) => {
                            warn!("Parameter upgrade skipped: {}", e);
                            None
                        }
                    }
                } else {
                    None
                };
                Ok(Some((keys, enrollment)))
            })
            .await?;

            let Some((keys, enrollment)) = verified else {
                info!("Authentication failed");
                return Err(VaultError::AuthenticationFailed);
            };

            if let Some(session) = self.open_session(&record, keys, enrollment).await? {
                info!("Principal {} authenticated", record.principal_id);
                return Ok(session);
            }
            allow_upgrade = false;
        }

        warn!("Authentication gave up after the verification record kept changing");
        Err(VaultError::AuthenticationFailed)
    }

    /// Register a session for a principal verified against `verified`
    ///
    /// Runs in one transaction that first checks the verification record is
    /// still the one the secret was checked against, so the session never
    /// holds a key the stored secrets are no longer encrypted under. Returns
    /// `None` when the caller has to start over: the record changed, or the
    /// parameter upgrade failed and was rolled back.
    async fn open_session(
        &self,
        verified: &VerificationRecord,
        keys: DerivedKeys,
        upgrade: Option<Enrollment>,
    ) -> Result<Option<SessionId>> {
        let principal_id = verified.principal_id;
        let mut tx = self.storage.begin_transaction().await?;

        let current = match VerificationRecord::find_in(tx.as_mut(), principal_id).await {
            Ok(current) => current,
            Err(e) => return finish(tx, Err(e)).await,
        };
        let unchanged = current.is_some_and(|current| {
            current.salt == verified.salt
                && current.verification_hash == verified.verification_hash
        });
        if !unchanged {
            finish(tx, Ok(())).await?;
            debug!("Verification record of principal {} changed during login", principal_id);
            return Ok(None);
        }

        let mut session_key = keys.encryption_key;
        let mut previous = None;
        if let Some(enrollment) = upgrade {
            let current = CurrentKey::Derived(&session_key);
            let rekeyed = self
                .rekey_in(tx.as_mut(), principal_id, &enrollment, current)
                .await;
            match rekeyed {
                Ok(count) => {
                    previous = Some(
                        self.sessions
                            .replace_principal_key(principal_id, &enrollment.keys.encryption_key)
                            .await,
                    );
                    session_key = enrollment.keys.encryption_key;
                    info!(
                        "Upgraded hash parameters for principal {} ({} secrets re-encrypted)",
                        principal_id, count
                    );
                }
                Err(e) => {
                    warn!(
                        "Parameter upgrade for principal {} failed, keeping old parameters: {}",
                        principal_id, e
                    );
                    if let Err(rollback) = tx.rollback().await {
                        warn!("Rollback failed: {}", rollback);
                    }
                    return Ok(None);
                }
            }
        }

        let info = self
            .sessions
            .create(principal_id, session_key, self.config.session_timeout())
            .await;

        if let Err(e) = tx.commit().await {
            self.sessions.terminate(info.session_id()).await;
            if let Some(previous) = previous {
                self.sessions.restore_keys(previous).await;
            }
            return Err(e.into());
        }
        if previous.is_some() {
            self.cache.invalidate_principal(principal_id).await;
        }
        Ok(Some(info.session_id()))
    }

    /// Metadata of a live session
    pub async fn session_info(&self, session: SessionId) -> Result<SessionInfo> {
        Ok(self.sessions.validate(session).await?)
    }

    /// Store a new secret
    pub async fn create_secret(
        &self,
        session: SessionId,
        label: &str,
        account_identifier: &str,
        secret: &str,
        note: Option<&str>,
    ) -> Result<SecretId> {
        non_empty("label", label)?;
        let info = self.sessions.validate(session).await?;
        let id = SecretId::new();

        // The key is taken inside the transaction, which a rekey excludes
        let mut tx = self.storage.begin_transaction().await?;
        let result: Result<()> = async {
            let (ciphertext, note_ciphertext) = self
                .sessions
                .with_key(session, |key| -> std::result::Result<_, CipherError> {
                    let ciphertext = encrypt_string(secret, key, &id.aad())?;
                    let note = note
                        .map(|note| encrypt_string(note, key, &id.note_aad()))
                        .transpose()?;
                    Ok((ciphertext, note))
                })
                .await??;

            let now = Utc::now();
            let record = SecretRecord {
                id,
                principal_id: info.principal_id(),
                label: label.to_string(),
                account_identifier: account_identifier.to_string(),
                ciphertext,
                note_ciphertext,
                created_at: now,
                modified_at: now,
            };
            SecretStore::insert(tx.as_mut(), &record).await
        }
        .await;
        finish(tx, result).await?;

        self.after_write(&info).await;
        info!("Created secret {} for principal {}", id, info.principal_id());
        Ok(id)
    }

    /// Load a record and decrypt it with the session key in one transaction,
    /// so a concurrent rekey cannot land between the two
    async fn open_record<T, F>(
        &self,
        info: &SessionInfo,
        id: SecretId,
        f: F,
    ) -> Result<(SecretRecord, T)>
    where
        F: FnOnce(&SecretRecord, &SessionKey) -> std::result::Result<T, CipherError> + Send,
        T: Send,
    {
        let mut tx = self.storage.begin_transaction().await?;
        let result: Result<(SecretRecord, T)> = async {
            let record = SecretStore::find_in(tx.as_mut(), info.principal_id(), id)
                .await?
                .ok_or(VaultError::SecretNotFound(id))?;
            let opened = self
                .sessions
                .with_key(info.session_id(), |key| f(&record, key))
                .await?
                .inspect_err(|e| Self::integrity_warning(id, e))?;
            Ok((record, opened))
        }
        .await;
        finish(tx, result).await
    }

    fn integrity_warning(id: SecretId, e: &CipherError) {
        if matches!(e, CipherError::Integrity) {
            warn!("Integrity check failed for secret {}", id);
        }
    }

    /// Decrypt a secret's value
    pub async fn read_secret(&self, session: SessionId, id: SecretId) -> Result<SecretString> {
        let info = self.sessions.validate(session).await?;
        let (_, secret) = self
            .open_record(&info, id, |record, key| {
                decrypt_string(&record.ciphertext, key, &id.aad())
            })
            .await?;

        self.touch(session).await;
        debug!("Read secret {}", id);
        Ok(secret)
    }

    /// Decrypt a secret together with its note and metadata
    pub async fn read_entry(&self, session: SessionId, id: SecretId) -> Result<SecretEntry> {
        let info = self.sessions.validate(session).await?;
        let (record, (secret, note)) = self
            .open_record(&info, id, |record, key| {
                let secret = decrypt_string(&record.ciphertext, key, &id.aad())?;
                let note = record
                    .note_ciphertext
                    .as_deref()
                    .map(|note| decrypt_string(note, key, &id.note_aad()))
                    .transpose()?;
                Ok((secret, note))
            })
            .await?;

        self.touch(session).await;
        Ok(SecretEntry {
            summary: record.summary(),
            secret,
            note,
        })
    }

    /// Change any subset of a secret's fields
    pub async fn update_secret(
        &self,
        session: SessionId,
        id: SecretId,
        update: SecretUpdate,
    ) -> Result<()> {
        let info = self.sessions.validate(session).await?;
        if let Some(label) = &update.label {
            non_empty("label", label)?;
        }
        if update.is_empty() {
            self.touch(session).await;
            return Ok(());
        }

        let SecretUpdate {
            label,
            account_identifier,
            secret,
            note,
        } = update;

        let mut tx = self.storage.begin_transaction().await?;
        let result: Result<()> = async {
            let (ciphertext, note_ciphertext) = self
                .sessions
                .with_key(session, |key| -> std::result::Result<_, CipherError> {
                    let ciphertext = secret
                        .as_ref()
                        .map(|s| encrypt_string(s.expose(), key, &id.aad()))
                        .transpose()?;
                    let note = match &note {
                        Some(Some(n)) => {
                            Some(Some(encrypt_string(n.expose(), key, &id.note_aad())?))
                        }
                        Some(None) => Some(None),
                        None => None,
                    };
                    Ok((ciphertext, note))
                })
                .await??;

            let mut record = SecretStore::find_in(tx.as_mut(), info.principal_id(), id)
                .await?
                .ok_or(VaultError::SecretNotFound(id))?;

            if let Some(label) = label {
                record.label = label;
            }
            if let Some(account) = account_identifier {
                record.account_identifier = account;
            }
            if let Some(ciphertext) = ciphertext {
                record.ciphertext = ciphertext;
            }
            if let Some(note) = note_ciphertext {
                record.note_ciphertext = note;
            }
            record.modified_at = Utc::now();

            if !SecretStore::update(tx.as_mut(), &record).await? {
                return Err(VaultError::SecretNotFound(id));
            }
            Ok(())
        }
        .await;
        finish(tx, result).await?;

        self.after_write(&info).await;
        info!("Updated secret {}", id);
        Ok(())
    }

    pub async fn delete_secret(&self, session: SessionId, id: SecretId) -> Result<()> {
        let info = self.sessions.validate(session).await?;

        let mut tx = self.storage.begin_transaction().await?;
        let result = SecretStore::delete(tx.as_mut(), info.principal_id(), id).await;
        let deleted = finish(tx, result).await?;
        if !deleted {
            return Err(VaultError::SecretNotFound(id));
        }

        self.after_write(&info).await;
        info!("Deleted secret {}", id);
        Ok(())
    }

    /// Summaries whose label or account contains `query` (case-insensitive)
    ///
    /// Results are cached per principal and query until the next write.
    pub async fn search_secrets(&self, session: SessionId, query: &str) -> Result<Vec<SecretSummary>> {
        let info = self.sessions.validate(session).await?;
        let key = CacheKey::search(&info, query);

        if let Some(hit) = self.cache.get(&key).await {
            self.touch(session).await;
            debug!("Search served from cache");
            return Ok(hit.to_vec());
        }

        let ticket = self.cache.ticket(&key).await;
        let summaries =
            SecretStore::search(self.storage.as_ref(), info.principal_id(), query.trim()).await?;
        self.cache
            .insert(ticket, key, Arc::new(summaries.clone()))
            .await;

        self.touch(session).await;
        Ok(summaries)
    }

    /// Every secret of the session's principal, ordered by label
    pub async fn list_secrets(&self, session: SessionId) -> Result<Vec<SecretSummary>> {
        self.search_secrets(session, "").await
    }

    /// Replace the master secret and re-encrypt every secret under the new key
    ///
    /// Everything happens in one transaction: if any record fails to
    /// re-encrypt, the verification record and all ciphertexts stay as they
    /// were. Other sessions of the principal are terminated; this session
    /// continues under the new key. Once the change is committed this
    /// returns `Ok` even if the session ended in the meantime.
    pub async fn change_master_secret(
        &self,
        session: SessionId,
        new_master_secret: impl Into<MasterSecret>,
    ) -> Result<()> {
        let info = self.sessions.validate(session).await?;
        let new_master_secret = new_master_secret.into();
        let params = self.config.hash_parameters();
        let enrollment = blocking(move || enroll(&new_master_secret, params)).await?;

        let count = self
            .rekey(info.principal_id(), &enrollment, CurrentKey::Session(session))
            .await?;

        self.sessions
            .terminate_principal(info.principal_id(), Some(session))
            .await;
        self.after_write(&info).await;

        info!(
            "Master secret changed for principal {} ({} secrets re-encrypted)",
            info.principal_id(),
            count
        );
        Ok(())
    }

    /// Swap a principal's verification record and re-encrypt its secrets,
    /// atomically
    ///
    /// The principal's sessions get the new key before the commit, while the
    /// transaction still keeps writers out, and get the old one back if the
    /// commit fails.
    async fn rekey(
        &self,
        principal_id: PrincipalId,
        enrollment: &Enrollment,
        current: CurrentKey<'_>,
    ) -> Result<usize> {
        let mut tx = self.storage.begin_transaction().await?;
        let count = match self
            .rekey_in(tx.as_mut(), principal_id, enrollment, current)
            .await
        {
            Ok(count) => count,
            Err(e) => return finish(tx, Err(e)).await,
        };

        let previous = self
            .sessions
            .replace_principal_key(principal_id, &enrollment.keys.encryption_key)
            .await;
        if let Err(e) = tx.commit().await {
            self.sessions.restore_keys(previous).await;
            return Err(e.into());
        }
        Ok(count)
    }

    async fn rekey_in(
        &self,
        tx: &mut dyn Transaction,
        principal_id: PrincipalId,
        enrollment: &Enrollment,
        current: CurrentKey<'_>,
    ) -> Result<usize> {
        let mut record = VerificationRecord::find_in(tx, principal_id)
            .await?
            .ok_or(VaultError::AuthenticationFailed)?;
        let secrets = SecretStore::all_for_principal(tx, principal_id).await?;

        let new_key = &enrollment.keys.encryption_key;
        let rewritten = match current {
            CurrentKey::Derived(old_key) => reencrypt(&secrets, old_key, new_key)?,
            CurrentKey::Session(session) => {
                self.sessions
                    .with_key(session, |old_key| reencrypt(&secrets, old_key, new_key))
                    .await??
            }
        };

        for secret in &rewritten {
            if !SecretStore::update(tx, secret).await? {
                return Err(VaultError::SecretNotFound(secret.id));
            }
        }

        record.salt = enrollment.salt.clone();
        record.verification_hash = enrollment.keys.verification_hash.as_bytes().to_vec();
        record.hash_parameters = enrollment.params;
        record.rotated_at = Some(Utc::now());
        if !record.replace(tx).await? {
            return Err(StorageError::RowShape(format!(
                "principal {principal_id} disappeared during rekey"
            ))
            .into());
        }

        Ok(rewritten.len())
    }

    /// End a session. Unknown or expired sessions are ignored.
    pub async fn logout(&self, session: SessionId) -> Result<()> {
        let info = self.sessions.validate(session).await.ok();
        if self.sessions.terminate(session).await {
            if let Some(info) = info {
                self.cache.invalidate_principal(info.principal_id()).await;
            }
        }
        Ok(())
    }

    /// Evict timed-out sessions; returns how many were removed
    pub async fn purge_expired_sessions(&self) -> usize {
        self.sessions.purge_expired().await
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.active_count().await
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop every session and cached result
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
        self.cache.clear().await;
        info!("Vault shut down");
    }

    /// Runs after a committed write: cached listings for the principal no
    /// longer reflect storage
    async fn after_write(&self, info: &SessionInfo) {
        self.cache.invalidate_principal(info.principal_id()).await;
        self.touch(info.session_id()).await;
    }

    async fn touch(&self, session: SessionId) {
        if let Err(e) = self.sessions.touch(session).await {
            debug!("Session {} not touched: {}", session, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyDerivationParams;
    use crate::error::SessionError;
    use crate::storage::{SqliteStorage, Value};

    async fn test_vault() -> (Vault, Arc<SqliteStorage>) {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let vault = Vault::open(storage.clone(), VaultConfig::minimal())
            .await
            .unwrap();
        (vault, storage)
    }

    async fn alice(vault: &Vault) -> SessionId {
        vault.create_principal("alice", "Tr0ub4dor&3").await.unwrap();
        vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap()
    }

    #[tokio::test]
    async fn test_create_principal_and_authenticate() {
        let (vault, _storage) = test_vault().await;

        let principal = vault.create_principal("alice", "Tr0ub4dor&3").await.unwrap();
        let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();

        let info = vault.session_info(session).await.unwrap();
        assert_eq!(info.principal_id(), principal);
    }

    #[tokio::test]
    async fn test_wrong_secret_and_unknown_principal_look_alike() {
        let (vault, _storage) = test_vault().await;
        vault.create_principal("alice", "Tr0ub4dor&3").await.unwrap();

        let wrong = vault.authenticate("alice", "wrong").await.unwrap_err();
        let unknown = vault.authenticate("mallory", "Tr0ub4dor&3").await.unwrap_err();

        assert!(matches!(wrong, VaultError::AuthenticationFailed));
        assert!(matches!(unknown, VaultError::AuthenticationFailed));
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[tokio::test]
    async fn test_duplicate_principal() {
        let (vault, _storage) = test_vault().await;
        vault.create_principal("alice", "one").await.unwrap();

        let result = vault.create_principal("alice", "two").await;
        assert!(matches!(result, Err(VaultError::PrincipalExists)));
    }

    #[tokio::test]
    async fn test_secret_crud() {
        let (vault, _storage) = test_vault().await;
        let session = alice(&vault).await;

        let id = vault
            .create_secret(session, "github.com", "alice", "s3cr3t!", Some("2fa on phone"))
            .await
            .unwrap();
        assert_eq!(vault.read_secret(session, id).await.unwrap().expose(), "s3cr3t!");

        vault
            .update_secret(
                session,
                id,
                SecretUpdate::new().secret("n3w-s3cr3t").account_identifier("alice2"),
            )
            .await
            .unwrap();

        let entry = vault.read_entry(session, id).await.unwrap();
        assert_eq!(entry.secret.expose(), "n3w-s3cr3t");
        assert_eq!(entry.summary.account_identifier, "alice2");
        assert_eq!(entry.note.as_ref().map(|n| n.expose()), Some("2fa on phone"));

        vault
            .update_secret(session, id, SecretUpdate::new().clear_note())
            .await
            .unwrap();
        assert!(vault.read_entry(session, id).await.unwrap().note.is_none());

        vault.delete_secret(session, id).await.unwrap();
        assert!(matches!(
            vault.read_secret(session, id).await,
            Err(VaultError::SecretNotFound(_))
        ));
        assert!(matches!(
            vault.delete_secret(session, id).await,
            Err(VaultError::SecretNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_search_reflects_writes() {
        let (vault, _storage) = test_vault().await;
        let session = alice(&vault).await;

        vault
            .create_secret(session, "github.com", "alice", "a", None)
            .await
            .unwrap();
        assert_eq!(vault.search_secrets(session, "GIT").await.unwrap().len(), 1);
        assert_eq!(vault.search_secrets(session, "git").await.unwrap().len(), 1);
        assert!(vault.cache_stats().hits >= 1);

        vault
            .create_secret(session, "gitlab.com", "alice", "b", None)
            .await
            .unwrap();

        let results = vault.search_secrets(session, "git").await.unwrap();
        let labels: Vec<_> = results.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, ["github.com", "gitlab.com"]);
    }

    #[tokio::test]
    async fn test_search_folds_non_ascii_case() {
        let (vault, _storage) = test_vault().await;
        let session = alice(&vault).await;

        vault
            .create_secret(session, "École.fr", "Zoë", "a", None)
            .await
            .unwrap();
        vault
            .create_secret(session, "ecole.org", "zoe", "b", None)
            .await
            .unwrap();

        for query in ["École.fr", "école", "ÉCOLE", "ZOË"] {
            let results = vault.search_secrets(session, query).await.unwrap();
            assert_eq!(results.len(), 1, "query {query:?}");
            assert_eq!(results[0].label, "École.fr");
        }
        assert_eq!(vault.search_secrets(session, "cole").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_principals_are_isolated() {
        let (vault, _storage) = test_vault().await;
        let alice = alice(&vault).await;
        vault.create_principal("bob", "hunter2-but-longer").await.unwrap();
        let bob = vault.authenticate("bob", "hunter2-but-longer").await.unwrap();

        let id = vault
            .create_secret(alice, "github.com", "alice", "s3cr3t!", None)
            .await
            .unwrap();
        assert_eq!(vault.list_secrets(alice).await.unwrap().len(), 1);

        assert!(vault.list_secrets(bob).await.unwrap().is_empty());
        assert!(matches!(
            vault.read_secret(bob, id).await,
            Err(VaultError::SecretNotFound(_))
        ));
        assert!(matches!(
            vault.delete_secret(bob, id).await,
            Err(VaultError::SecretNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_swapped_ciphertext_fails_integrity() {
        let (vault, storage) = test_vault().await;
        let session = alice(&vault).await;

        let first = vault
            .create_secret(session, "a.example", "alice", "first", None)
            .await
            .unwrap();
        let second = vault
            .create_secret(session, "b.example", "alice", "second", None)
            .await
            .unwrap();

        storage
            .execute(
                "UPDATE secrets SET ciphertext = (SELECT ciphertext FROM secrets WHERE secret_id = ?2)
                 WHERE secret_id = ?1",
                &[Value::from(first.to_string()), Value::from(second.to_string())],
            )
            .await
            .unwrap();

        let err = vault.read_secret(session, first).await.unwrap_err();
        assert!(err.is_integrity_failure());
        assert!(!err.is_session_expired());
    }

    #[tokio::test]
    async fn test_change_master_secret() {
        let (vault, _storage) = test_vault().await;
        let session = alice(&vault).await;
        let other = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
        let id = vault
            .create_secret(session, "github.com", "alice", "s3cr3t!", Some("note"))
            .await
            .unwrap();

        vault
            .change_master_secret(session, "correct horse battery staple")
            .await
            .unwrap();

        // Current session keeps working under the new key
        assert_eq!(vault.read_secret(session, id).await.unwrap().expose(), "s3cr3t!");
        // Other sessions are gone
        assert!(matches!(
            vault.read_secret(other, id).await,
            Err(VaultError::Session(SessionError::NotFound))
        ));

        vault.logout(session).await.unwrap();
        assert!(matches!(
            vault.authenticate("alice", "Tr0ub4dor&3").await,
            Err(VaultError::AuthenticationFailed)
        ));

        let session = vault
            .authenticate("alice", "correct horse battery staple")
            .await
            .unwrap();
        let entry = vault.read_entry(session, id).await.unwrap();
        assert_eq!(entry.secret.expose(), "s3cr3t!");
        assert_eq!(entry.note.as_ref().map(|n| n.expose()), Some("note"));
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let (vault, _storage) = test_vault().await;
        let session = alice(&vault).await;

        vault.logout(session).await.unwrap();
        vault.logout(session).await.unwrap();

        let err = vault.list_secrets(session).await.unwrap_err();
        assert!(err.is_session_expired());
    }

    #[tokio::test]
    async fn test_attach_refuses_unmigrated_storage() {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open_in_memory().unwrap());

        let result = Vault::attach(storage.clone(), VaultConfig::minimal()).await;
        assert!(matches!(
            result,
            Err(VaultError::SchemaNotReady { found: 0, expected: SCHEMA_VERSION })
        ));

        SchemaMigrator::default()
            .migrate_to_latest(storage.as_ref())
            .await
            .unwrap();
        assert!(Vault::attach(storage, VaultConfig::minimal()).await.is_ok());
    }

    #[tokio::test]
    async fn test_parameter_upgrade_on_login() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let id = {
            let vault = Vault::open(storage.clone(), VaultConfig::minimal())
                .await
                .unwrap();
            let session = alice(&vault).await;
            vault
                .create_secret(session, "github.com", "alice", "s3cr3t!", None)
                .await
                .unwrap()
        };

        let stronger = KeyDerivationParams {
            memory_cost: 16_384,
            ..KeyDerivationParams::minimum()
        };
        let config = VaultConfig {
            kdf: stronger,
            ..VaultConfig::minimal()
        };
        let vault = Vault::open(storage.clone(), config).await.unwrap();

        let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
        assert_eq!(vault.read_secret(session, id).await.unwrap().expose(), "s3cr3t!");

        let record = VerificationRecord::find_by_identifier(storage.as_ref(), "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.hash_parameters.cost, stronger);
        assert!(record.rotated_at.is_some());

        // The upgraded record verifies on the next login too
        vault.logout(session).await.unwrap();
        let session = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
        assert_eq!(vault.read_secret(session, id).await.unwrap().expose(), "s3cr3t!");
    }

    #[tokio::test]
    async fn test_parameter_upgrade_rekeys_live_sessions() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let config = VaultConfig {
            kdf: KeyDerivationParams {
                memory_cost: 16_384,
                ..KeyDerivationParams::minimum()
            },
            rehash_on_login: false,
            ..VaultConfig::minimal()
        };
        let mut vault = Vault::open(storage.clone(), VaultConfig::minimal())
            .await
            .unwrap();
        let early = alice(&vault).await;
        let id = vault
            .create_secret(early, "github.com", "alice", "s3cr3t!", None)
            .await
            .unwrap();

        // A session opened under the old parameters, then a login that upgrades them
        vault.config = config;
        let before_upgrade = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();
        vault.config.rehash_on_login = true;
        let upgraded = vault.authenticate("alice", "Tr0ub4dor&3").await.unwrap();

        let record = VerificationRecord::find_by_identifier(storage.as_ref(), "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.hash_parameters.cost.memory_cost, 16_384);

        let written = vault
            .create_secret(before_upgrade, "gitlab.com", "alice", "written after", None)
            .await
            .unwrap();
        for session in [early, before_upgrade, upgraded] {
            assert_eq!(vault.read_secret(session, id).await.unwrap().expose(), "s3cr3t!");
            assert_eq!(
                vault.read_secret(session, written).await.unwrap().expose(),
                "written after"
            );
        }
    }

    #[tokio::test]
    async fn test_shutdown_ends_sessions() {
        let (vault, _storage) = test_vault().await;
        let session = alice(&vault).await;

        vault.shutdown().await;

        assert_eq!(vault.active_sessions().await, 0);
        assert!(vault.read_secret(session, SecretId::new()).await.is_err());
    }
}
