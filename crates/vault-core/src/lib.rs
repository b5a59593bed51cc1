//! # vault-core
//!
//! Security core of a local secrets vault:
//! - Argon2id + HKDF derivation of verification hashes and session keys
//! - AES-256-GCM encryption of individual secret records
//! - In-memory session registry, the sole owner of session keys
//! - Per-principal result cache with TTL + LRU eviction
//! - Transactional schema migrations over a narrow storage interface
//! - Secret generation and strength scoring

pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod generator;
pub mod migrations;
pub mod principal;
pub mod secret;
pub mod session;
pub mod storage;
mod vault;

pub use cache::{CacheConfig, CacheKey, CacheStats, ResultCache};
pub use config::{ConfigManager, VaultConfig};
pub use crypto::{MasterSecret, SecretString, SessionKey};
pub use error::{
    CipherError, ConfigurationError, DerivationError, MigrationError, Result, SessionError,
    StorageError, VaultError,
};
pub use generator::{CharacterClass, StrengthLabel};
pub use migrations::{SchemaMigrator, SchemaStatus, SCHEMA_VERSION};
pub use principal::PrincipalId;
pub use secret::{SecretEntry, SecretId, SecretSummary, SecretUpdate};
pub use session::{PreviousKeys, SessionId, SessionInfo, SessionRegistry, SessionState};
pub use storage::{SqliteStorage, Storage, Transaction};
pub use vault::Vault;
