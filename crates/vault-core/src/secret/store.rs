//! SQL access to the `secrets` table
//!
//! Every query is scoped by `principal_id`, so a caller can only ever reach
//! rows of the principal its session belongs to.

use crate::error::Result;
use crate::principal::{parse_timestamp, parse_uuid, PrincipalId};
use crate::storage::{Row, Storage, Transaction, Value};

use super::{SecretId, SecretRecord, SecretSummary};

const COLUMNS: &str = "secret_id, principal_id, label, account_identifier, ciphertext, \
                       note_ciphertext, created_at, modified_at";

const SUMMARY_COLUMNS: &str = "secret_id, label, account_identifier, \
                               note_ciphertext IS NOT NULL, created_at, modified_at";

pub(crate) struct SecretStore;

fn record_from_row(row: &Row) -> Result<SecretRecord> {
    Ok(SecretRecord {
        id: parse_uuid(row.text(0)?)?,
        principal_id: parse_uuid(row.text(1)?)?,
        label: row.text(2)?.to_string(),
        account_identifier: row.text(3)?.to_string(),
        ciphertext: row.text(4)?.to_string(),
        note_ciphertext: row.opt_text(5)?.map(str::to_string),
        created_at: parse_timestamp(row.text(6)?)?,
        modified_at: parse_timestamp(row.text(7)?)?,
    })
}

fn summary_from_row(row: &Row) -> Result<SecretSummary> {
    Ok(SecretSummary {
        id: parse_uuid(row.text(0)?)?,
        label: row.text(1)?.to_string(),
        account_identifier: row.text(2)?.to_string(),
        has_note: row.integer(3)? != 0,
        created_at: parse_timestamp(row.text(4)?)?,
        modified_at: parse_timestamp(row.text(5)?)?,
    })
}

/// Case folding shared by search matching and search cache keys. Applied in
/// Rust rather than SQL, where `lower()` only folds ASCII.
pub(crate) fn fold_case(text: &str) -> String {
    text.to_lowercase()
}

fn scope(principal_id: PrincipalId, secret_id: SecretId) -> [Value; 2] {
    [
        Value::from(secret_id.to_string()),
        Value::from(principal_id.to_string()),
    ]
}

impl SecretStore {
    pub(crate) async fn insert(tx: &mut dyn Transaction, record: &SecretRecord) -> Result<()> {
        let query = format!("INSERT INTO secrets ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)");
        tx.execute(
            &query,
            &[
                Value::from(record.id.to_string()),
                Value::from(record.principal_id.to_string()),
                Value::from(record.label.as_str()),
                Value::from(record.account_identifier.as_str()),
                Value::from(record.ciphertext.as_str()),
                Value::from(record.note_ciphertext.clone()),
                Value::from(record.created_at.to_rfc3339()),
                Value::from(record.modified_at.to_rfc3339()),
            ],
        )
        .await?;
        Ok(())
    }

    pub(crate) async fn find_in(
        tx: &mut dyn Transaction,
        principal_id: PrincipalId,
        secret_id: SecretId,
    ) -> Result<Option<SecretRecord>> {
        let query = format!("SELECT {COLUMNS} FROM secrets WHERE secret_id = ?1 AND principal_id = ?2");
        let rows = tx.execute(&query, &scope(principal_id, secret_id)).await?;
        rows.first().map(record_from_row).transpose()
    }

    pub(crate) async fn all_for_principal(
        tx: &mut dyn Transaction,
        principal_id: PrincipalId,
    ) -> Result<Vec<SecretRecord>> {
        let query = format!("SELECT {COLUMNS} FROM secrets WHERE principal_id = ?1");
        let rows = tx
            .execute(&query, &[Value::from(principal_id.to_string())])
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Summaries whose label or account contains `query`, case-insensitively,
    /// ordered by label then account. An empty query lists everything.
    pub(crate) async fn search(
        storage: &dyn Storage,
        principal_id: PrincipalId,
        query: &str,
    ) -> Result<Vec<SecretSummary>> {
        let sql = format!("SELECT {SUMMARY_COLUMNS} FROM secrets WHERE principal_id = ?1");
        let rows = storage
            .execute(&sql, &[Value::from(principal_id.to_string())])
            .await?;

        let needle = fold_case(query);
        let mut matches = Vec::new();
        for row in &rows {
            let summary = summary_from_row(row)?;
            let label = fold_case(&summary.label);
            let account = fold_case(&summary.account_identifier);
            if label.contains(&needle) || account.contains(&needle) {
                matches.push(((label, account), summary));
            }
        }
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(matches.into_iter().map(|(_, summary)| summary).collect())
    }

    /// Overwrite every mutable column of an existing record
    pub(crate) async fn update(tx: &mut dyn Transaction, record: &SecretRecord) -> Result<bool> {
        let rows = tx
            .execute(
                "UPDATE secrets
                 SET label = ?3, account_identifier = ?4, ciphertext = ?5,
                     note_ciphertext = ?6, modified_at = ?7
                 WHERE secret_id = ?1 AND principal_id = ?2
                 RETURNING secret_id",
                &[
                    Value::from(record.id.to_string()),
                    Value::from(record.principal_id.to_string()),
                    Value::from(record.label.as_str()),
                    Value::from(record.account_identifier.as_str()),
                    Value::from(record.ciphertext.as_str()),
                    Value::from(record.note_ciphertext.clone()),
                    Value::from(record.modified_at.to_rfc3339()),
                ],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    pub(crate) async fn delete(
        tx: &mut dyn Transaction,
        principal_id: PrincipalId,
        secret_id: SecretId,
    ) -> Result<bool> {
        let rows = tx
            .execute(
                "DELETE FROM secrets WHERE secret_id = ?1 AND principal_id = ?2 RETURNING secret_id",
                &scope(principal_id, secret_id),
            )
            .await?;
        Ok(!rows.is_empty())
    }
}
