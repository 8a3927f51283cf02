//! Attachment metadata and per-recipient access grants.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::AttachmentRecord;
use crate::time::{from_sql, to_sql};

impl Database {
    pub fn insert_attachment(&self, record: &AttachmentRecord) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO attachments (object_key, owner_id, content_type, size, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.object_key,
                    record.owner_id,
                    record.content_type,
                    record.size,
                    to_sql(&record.created_at),
                ],
            )
            .map_err(StoreError::from_write)?;
        Ok(())
    }

    pub fn get_attachment(&self, object_key: &str) -> Result<Option<AttachmentRecord>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT object_key, owner_id, content_type, size, created_at
                 FROM attachments WHERE object_key = ?1",
                params![object_key],
                |row| {
                    let created_str: String = row.get(4)?;
                    Ok(AttachmentRecord {
                        object_key: row.get(0)?,
                        owner_id: row.get(1)?,
                        content_type: row.get(2)?,
                        size: row.get(3)?,
                        created_at: from_sql(4, &created_str)?,
                    })
                },
            )
            .optional()?)
    }

    /// Record that `grantee_id` may download `object_key`. Idempotent.
    pub fn grant_attachment(&self, object_key: &str, grantee_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO attachment_grants (object_key, grantee_id, granted_at)
             VALUES (?1, ?2, ?3)",
            params![object_key, grantee_id, to_sql(&now)],
        )?;
        Ok(())
    }

    /// The owner always has access; everyone else needs a grant.
    pub fn can_access_attachment(&self, object_key: &str, whisper_id: &str) -> Result<bool> {
        let allowed: i64 = self.conn().query_row(
            "SELECT EXISTS(
                SELECT 1 FROM attachments WHERE object_key = ?1 AND owner_id = ?2
                UNION ALL
                SELECT 1 FROM attachment_grants WHERE object_key = ?1 AND grantee_id = ?2
             )",
            params![object_key, whisper_id],
            |row| row.get(0),
        )?;
        Ok(allowed != 0)
    }
}
