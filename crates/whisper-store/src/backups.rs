//! Opaque contact backups, one per identity.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::ContactBackup;
use crate::time::{from_sql, to_sql};

impl Database {
    /// Replace the stored backup.
    pub fn put_backup(&self, whisper_id: &str, data: &[u8], now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO contact_backups (whisper_id, data, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(whisper_id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at",
            params![whisper_id, data, to_sql(&now)],
        )?;
        Ok(())
    }

    pub fn get_backup(&self, whisper_id: &str) -> Result<Option<ContactBackup>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT whisper_id, data, updated_at FROM contact_backups WHERE whisper_id = ?1",
                params![whisper_id],
                |row| {
                    let updated_str: String = row.get(2)?;
                    Ok(ContactBackup {
                        whisper_id: row.get(0)?,
                        data: row.get(1)?,
                        updated_at: from_sql(2, &updated_str)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn delete_backup(&self, whisper_id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM contact_backups WHERE whisper_id = ?1",
            params![whisper_id],
        )?;
        Ok(affected > 0)
    }
}
