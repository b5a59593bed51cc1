//! Secret type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::SecretString;
use crate::principal::PrincipalId;

/// Unique identifier of a stored secret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretId(Uuid);

impl SecretId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Bytes bound into the record's ciphertext as associated data
    pub(crate) fn aad(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    /// Associated data for the note, distinct from the secret's so the two
    /// ciphertexts of a row cannot be swapped
    pub(crate) fn note_aad(&self) -> [u8; 20] {
        let mut aad = [0u8; 20];
        aad[..16].copy_from_slice(self.0.as_bytes());
        aad[16..].copy_from_slice(b"note");
        aad
    }
}

impl Default for SecretId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SecretId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SecretId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Persisted secret - plaintext never appears here
#[derive(Debug, Clone)]
pub struct SecretRecord {
    pub id: SecretId,
    pub principal_id: PrincipalId,
    pub label: String,
    pub account_identifier: String,
    /// Encrypted value (iv:tag:ciphertext format)
    pub ciphertext: String,
    /// Encrypted note, same format
    pub note_ciphertext: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl SecretRecord {
    pub fn summary(&self) -> SecretSummary {
        SecretSummary {
            id: self.id,
            label: self.label.clone(),
            account_identifier: self.account_identifier.clone(),
            has_note: self.note_ciphertext.is_some(),
            created_at: self.created_at,
            modified_at: self.modified_at,
        }
    }
}

/// Secret metadata (safe to display)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSummary {
    pub id: SecretId,
    /// Site or service name, e.g. "github.com"
    pub label: String,
    /// Username or account on that service
    pub account_identifier: String,
    pub has_note: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// A fully decrypted secret
#[derive(Debug)]
pub struct SecretEntry {
    pub summary: SecretSummary,
    pub secret: SecretString,
    pub note: Option<SecretString>,
}

/// Fields to change on an existing secret; `None` leaves a field as is
#[derive(Debug, Default)]
pub struct SecretUpdate {
    pub label: Option<String>,
    pub account_identifier: Option<String>,
    pub secret: Option<SecretString>,
    /// `Some(None)` removes the note
    pub note: Option<Option<SecretString>>,
}

impl SecretUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn account_identifier(mut self, account: impl Into<String>) -> Self {
        self.account_identifier = Some(account.into());
        self
    }

    pub fn secret(mut self, secret: &str) -> Self {
        self.secret = Some(SecretString::from(secret));
        self
    }

    pub fn note(mut self, note: &str) -> Self {
        self.note = Some(Some(SecretString::from(note)));
        self
    }

    pub fn clear_note(mut self) -> Self {
        self.note = Some(None);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.label.is_none()
            && self.account_identifier.is_none()
            && self.secret.is_none()
            && self.note.is_none()
    }
}
