//! Append-only audit trail.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;
use crate::models::AuditEvent;
use crate::time::{from_sql, to_sql};

impl Database {
    pub fn insert_audit(
        &self,
        event_type: &str,
        whisper_id: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO audit_events (event_type, whisper_id, reason, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![event_type, whisper_id, reason, to_sql(&now)],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Most recent events first.
    pub fn list_audit(&self, limit: u32) -> Result<Vec<AuditEvent>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, event_type, whisper_id, reason, created_at
             FROM audit_events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_event)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn list_audit_for(&self, whisper_id: &str) -> Result<Vec<AuditEvent>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, event_type, whisper_id, reason, created_at
             FROM audit_events WHERE whisper_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![whisper_id], row_to_event)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEvent> {
    let created_str: String = row.get(4)?;
    Ok(AuditEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        whisper_id: row.get(2)?,
        reason: row.get(3)?,
        created_at: from_sql(4, &created_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_listed_newest_first() {
        let db = Database::open_in_memory().unwrap();
        db.insert_audit("register", Some("WSP-AAAA-AAAA-AAAA"), "new identity", Utc::now())
            .unwrap();
        db.insert_audit("auth_failed", None, "bad signature", Utc::now())
            .unwrap();

        let all = db.list_audit(10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event_type, "auth_failed");
        assert!(all[0].whisper_id.is_none());

        let mine = db.list_audit_for("WSP-AAAA-AAAA-AAAA").unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].reason, "new identity");
    }
}
