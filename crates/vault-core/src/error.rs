//! Error types for vault-core
//!
//! Every component owns a closed error enum. `VaultError` wraps them for the
//! operations exposed to collaborators.

use thiserror::Error;

use crate::secret::SecretId;

/// Result type alias for vault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Key derivation failures
#[derive(Error, Debug)]
pub enum DerivationError {
    #[error("Invalid key derivation parameters: {0}")]
    InvalidParameters(String),

    #[error("Salt must be at least {min} bytes (got {actual})")]
    SaltTooShort { min: usize, actual: usize },

    #[error("Could not allocate {kib} KiB for key derivation")]
    ResourceExhausted { kib: u32 },

    #[error("Unsupported hash parameters version {0}")]
    UnsupportedParameters(u32),

    #[error("Key derivation failed: {0}")]
    Failed(String),
}

/// Authenticated encryption failures
#[derive(Error, Debug)]
pub enum CipherError {
    /// Ciphertext was tampered with, malformed, or encrypted under another key
    #[error("Integrity check failed - ciphertext was modified or the key does not match")]
    Integrity,

    #[error("Encryption failed: {0}")]
    Encryption(String),
}

/// Session lookup failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("Session expired - authenticate again")]
    Expired,
}

/// Schema migration failures
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Invalid migration plan: {0}")]
    InvalidPlan(String),

    #[error("Storage is at schema version {found}, newer than the latest known version {latest}")]
    StorageAhead { found: u32, latest: u32 },

    #[error("Migration to version {version} failed, schema left at version {applied}: {source}")]
    StepFailed {
        version: u32,
        applied: u32,
        #[source]
        source: StorageError,
    },

    #[error("Storage error during migration: {0}")]
    Storage(#[from] StorageError),
}

/// Invalid generator, strength or configuration input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("At least one character class is required")]
    NoCharacterClasses,

    #[error("Length {length} is shorter than the {required} mandatory character classes")]
    LengthTooShort { length: usize, required: usize },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Opaque wrapper around failures of the storage collaborator
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Unexpected row shape: {0}")]
    RowShape(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Wrap any backend error
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(err))
    }
}

/// Vault error types
#[derive(Error, Debug)]
pub enum VaultError {
    /// Unknown principal and wrong master secret share this variant
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Principal already exists")]
    PrincipalExists,

    #[error("Secret not found: {0}")]
    SecretNotFound(SecretId),

    #[error("Storage schema is at version {found}, expected {expected} - run migrations first")]
    SchemaNotReady { found: u32, expected: u32 },

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl VaultError {
    /// True when the ciphertext failed authentication. Callers should treat
    /// this as likely tampering, not as a wrong password or an expired session.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Cipher(CipherError::Integrity))
    }

    /// True when the session has to be re-established by authenticating again
    pub fn is_session_expired(&self) -> bool {
        matches!(
            self,
            Self::Session(SessionError::Expired) | Self::Session(SessionError::NotFound)
        )
    }
}
