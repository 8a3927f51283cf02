//! CRUD operations for [`Identity`] records and bans.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use whisper_shared::types::IdentityStatus;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Identity;
use crate::time::{bad_enum, from_sql, to_sql};

const IDENTITY_COLUMNS: &str =
    "whisper_id, enc_public_key, sign_public_key, status, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new identity. Fails with [`StoreError::Conflict`] if the id or
    /// the key pair is already registered.
    pub fn insert_identity(&self, identity: &Identity) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO identities
                 (whisper_id, enc_public_key, sign_public_key, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    identity.whisper_id,
                    hex::encode(identity.enc_public_key),
                    hex::encode(identity.sign_public_key),
                    identity.status.as_str(),
                    to_sql(&identity.created_at),
                    to_sql(&identity.updated_at),
                ],
            )
            .map_err(StoreError::from_write)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_identity(&self, whisper_id: &str) -> Result<Identity> {
        self.conn()
            .query_row(
                &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE whisper_id = ?1"),
                params![whisper_id],
                row_to_identity,
            )
            .map_err(StoreError::from_query)
    }

    pub fn find_identity(&self, whisper_id: &str) -> Result<Option<Identity>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE whisper_id = ?1"),
                params![whisper_id],
                row_to_identity,
            )
            .optional()?)
    }

    /// Look up an identity by its exact key pair (deterministic recovery).
    pub fn find_identity_by_keys(
        &self,
        enc_public_key: &[u8; 32],
        sign_public_key: &[u8; 32],
    ) -> Result<Option<Identity>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {IDENTITY_COLUMNS} FROM identities
                     WHERE enc_public_key = ?1 AND sign_public_key = ?2"
                ),
                params![hex::encode(enc_public_key), hex::encode(sign_public_key)],
                row_to_identity,
            )
            .optional()?)
    }

    /// Whether every id in `ids` names an active identity.
    pub fn all_active(&self, ids: &[String]) -> Result<bool> {
        for id in ids {
            match self.find_identity(id)? {
                Some(identity) if !identity.is_banned() => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Bans
    // ------------------------------------------------------------------

    /// Ban an identity: records the ban and flips the status in one
    /// transaction. Returns `false` if the identity does not exist.
    pub fn ban_identity(&mut self, whisper_id: &str, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        let updated = tx.execute(
            "UPDATE identities SET status = ?2, updated_at = ?3 WHERE whisper_id = ?1",
            params![whisper_id, IdentityStatus::Banned.as_str(), to_sql(&now)],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO bans (whisper_id, reason, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(whisper_id) DO UPDATE SET reason = excluded.reason",
            params![whisper_id, reason, to_sql(&now)],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Lift a ban. Returns `false` if the identity does not exist.
    pub fn unban_identity(&mut self, whisper_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        let updated = tx.execute(
            "UPDATE identities SET status = ?2, updated_at = ?3 WHERE whisper_id = ?1",
            params![whisper_id, IdentityStatus::Active.as_str(), to_sql(&now)],
        )?;
        tx.execute("DELETE FROM bans WHERE whisper_id = ?1", params![whisper_id])?;
        tx.commit()?;
        Ok(updated > 0)
    }

    pub fn count_identities(&self) -> Result<i64> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn decode_key(idx: usize, value: &str) -> rusqlite::Result<[u8; 32]> {
    let bytes = hex::decode(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })?;
    bytes
        .try_into()
        .map_err(|_| bad_enum(idx, value))
}

fn row_to_identity(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identity> {
    let whisper_id: String = row.get(0)?;
    let enc_hex: String = row.get(1)?;
    let sign_hex: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let created_str: String = row.get(4)?;
    let updated_str: String = row.get(5)?;

    let status = IdentityStatus::parse(&status_str).ok_or_else(|| bad_enum(3, &status_str))?;

    Ok(Identity {
        whisper_id,
        enc_public_key: decode_key(1, &enc_hex)?,
        sign_public_key: decode_key(2, &sign_hex)?,
        status,
        created_at: from_sql(4, &created_str)?,
        updated_at: from_sql(5, &updated_str)?,
    })
}
