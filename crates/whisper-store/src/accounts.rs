//! Account deletion.

use rusqlite::params;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Remove every durable trace of an identity in one transaction.
    ///
    /// Groups owned by the identity are dissolved, its memberships elsewhere
    /// are dropped, and its audit rows are kept but detached from the id.
    /// Returns the object keys of the attachments it owned so the caller can
    /// delete the blobs. Returns `None` if the identity does not exist.
    pub fn delete_account(&mut self, whisper_id: &str) -> Result<Option<Vec<String>>> {
        let tx = self.conn_mut().transaction()?;

        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM identities WHERE whisper_id = ?1",
            params![whisper_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Ok(None);
        }

        let object_keys = {
            let mut stmt =
                tx.prepare("SELECT object_key FROM attachments WHERE owner_id = ?1 ORDER BY object_key")?;
            let rows = stmt.query_map(params![whisper_id], |row| row.get::<_, String>(0))?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            keys
        };

        tx.execute(
            "DELETE FROM attachment_grants
             WHERE grantee_id = ?1
                OR object_key IN (SELECT object_key FROM attachments WHERE owner_id = ?1)",
            params![whisper_id],
        )?;
        tx.execute("DELETE FROM attachments WHERE owner_id = ?1", params![whisper_id])?;

        tx.execute(
            "DELETE FROM group_members
             WHERE group_id IN (SELECT group_id FROM chat_groups WHERE owner_id = ?1)",
            params![whisper_id],
        )?;
        tx.execute("DELETE FROM chat_groups WHERE owner_id = ?1", params![whisper_id])?;
        tx.execute("DELETE FROM group_members WHERE whisper_id = ?1", params![whisper_id])?;

        tx.execute("DELETE FROM contact_backups WHERE whisper_id = ?1", params![whisper_id])?;
        tx.execute("DELETE FROM devices WHERE whisper_id = ?1", params![whisper_id])?;
        tx.execute("DELETE FROM bans WHERE whisper_id = ?1", params![whisper_id])?;
        tx.execute(
            "UPDATE audit_events SET whisper_id = NULL WHERE whisper_id = ?1",
            params![whisper_id],
        )?;
        tx.execute("DELETE FROM identities WHERE whisper_id = ?1", params![whisper_id])?;

        tx.commit()?;

        tracing::info!(whisper_id, attachments = object_keys.len(), "account deleted");
        Ok(Some(object_keys))
    }
}
