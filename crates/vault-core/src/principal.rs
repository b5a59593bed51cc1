//! Principals and their verification records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::HashParameters;
use crate::error::{Result, StorageError};
use crate::storage::{Row, Storage, Transaction, Value};

/// Identity owning a set of secrets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(Uuid);

impl PrincipalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for PrincipalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Persisted proof of a principal's master secret
///
/// Created on enrollment and replaced as a whole when the master secret
/// changes; never updated field by field.
#[derive(Debug, Clone)]
pub struct VerificationRecord {
    pub principal_id: PrincipalId,
    /// Login name the principal authenticates with
    pub identifier: String,
    pub salt: Vec<u8>,
    pub verification_hash: Vec<u8>,
    pub hash_parameters: HashParameters,
    pub created_at: DateTime<Utc>,
    /// Last time the record was replaced
    pub rotated_at: Option<DateTime<Utc>>,
}

const COLUMNS: &str =
    "principal_id, identifier, salt, verification_hash, hash_parameters, created_at, rotated_at";

pub(crate) fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::RowShape(format!("invalid timestamp {raw:?}: {e}")))
}

pub(crate) fn parse_uuid<T: std::str::FromStr>(raw: &str) -> std::result::Result<T, StorageError> {
    raw.parse()
        .map_err(|_| StorageError::RowShape(format!("invalid identifier {raw:?}")))
}

impl VerificationRecord {
    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            principal_id: parse_uuid(row.text(0)?)?,
            identifier: row.text(1)?.to_string(),
            salt: row.blob(2)?.to_vec(),
            verification_hash: row.blob(3)?.to_vec(),
            hash_parameters: HashParameters::from_json(row.text(4)?)?,
            created_at: parse_timestamp(row.text(5)?)?,
            rotated_at: row.opt_text(6)?.map(parse_timestamp).transpose()?,
        })
    }

    pub(crate) async fn find_by_identifier(
        storage: &dyn Storage,
        identifier: &str,
    ) -> Result<Option<Self>> {
        let query = format!("SELECT {COLUMNS} FROM principals WHERE identifier = ?1");
        let rows = storage.execute(&query, &[Value::from(identifier)]).await?;
        rows.first().map(Self::from_row).transpose()
    }

    pub(crate) async fn find_in(
        tx: &mut dyn Transaction,
        principal_id: PrincipalId,
    ) -> Result<Option<Self>> {
        let query = format!("SELECT {COLUMNS} FROM principals WHERE principal_id = ?1");
        let rows = tx
            .execute(&query, &[Value::from(principal_id.to_string())])
            .await?;
        rows.first().map(Self::from_row).transpose()
    }

    pub(crate) async fn identifier_taken(tx: &mut dyn Transaction, identifier: &str) -> Result<bool> {
        let rows = tx
            .execute(
                "SELECT 1 FROM principals WHERE identifier = ?1",
                &[Value::from(identifier)],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    pub(crate) async fn insert(&self, tx: &mut dyn Transaction) -> Result<()> {
        let query = format!(
            "INSERT INTO principals ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        );
        tx.execute(
            &query,
            &[
                Value::from(self.principal_id.to_string()),
                Value::from(self.identifier.as_str()),
                Value::from(self.salt.as_slice()),
                Value::from(self.verification_hash.as_slice()),
                Value::from(self.hash_parameters.to_json()?),
                Value::from(self.created_at.to_rfc3339()),
                Value::from(self.rotated_at.map(|t| t.to_rfc3339())),
            ],
        )
        .await?;
        Ok(())
    }

    /// Swap in a new salt, hash and parameter set
    pub(crate) async fn replace(&self, tx: &mut dyn Transaction) -> Result<bool> {
        let rows = tx
            .execute(
                "UPDATE principals
                 SET salt = ?2, verification_hash = ?3, hash_parameters = ?4, rotated_at = ?5
                 WHERE principal_id = ?1
                 RETURNING principal_id",
                &[
                    Value::from(self.principal_id.to_string()),
                    Value::from(self.salt.as_slice()),
                    Value::from(self.verification_hash.as_slice()),
                    Value::from(self.hash_parameters.to_json()?),
                    Value::from(self.rotated_at.map(|t| t.to_rfc3339())),
                ],
            )
            .await?;
        Ok(!rows.is_empty())
    }
}
