//! Device records and push tokens.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use whisper_shared::types::Platform;

use crate::database::Database;
use crate::error::Result;
use crate::models::Device;
use crate::time::{bad_enum, from_sql, to_sql};

impl Database {
    /// Insert or replace the active device of an identity.
    ///
    /// Tokens that are `None` in `device` keep their stored value when the
    /// device id is unchanged, and are cleared when a different device takes
    /// over.
    pub fn upsert_device(&self, device: &Device) -> Result<()> {
        self.conn().execute(
            "INSERT INTO devices (whisper_id, device_id, platform, push_token, voip_token, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(whisper_id) DO UPDATE SET
                push_token = CASE
                    WHEN excluded.push_token IS NOT NULL THEN excluded.push_token
                    WHEN devices.device_id = excluded.device_id THEN devices.push_token
                    ELSE NULL END,
                voip_token = CASE
                    WHEN excluded.voip_token IS NOT NULL THEN excluded.voip_token
                    WHEN devices.device_id = excluded.device_id THEN devices.voip_token
                    ELSE NULL END,
                device_id  = excluded.device_id,
                platform   = excluded.platform,
                updated_at = excluded.updated_at",
            params![
                device.whisper_id,
                device.device_id,
                device.platform.as_str(),
                device.push_token,
                device.voip_token,
                to_sql(&device.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_device(&self, whisper_id: &str) -> Result<Option<Device>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT whisper_id, device_id, platform, push_token, voip_token, updated_at
                 FROM devices WHERE whisper_id = ?1",
                params![whisper_id],
                row_to_device,
            )
            .optional()?)
    }

    /// Update the tokens that are `Some`; returns `false` if no device row
    /// exists for the identity.
    pub fn update_push_tokens(
        &self,
        whisper_id: &str,
        push_token: Option<&str>,
        voip_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE devices SET
                push_token = COALESCE(?2, push_token),
                voip_token = COALESCE(?3, voip_token),
                updated_at = ?4
             WHERE whisper_id = ?1",
            params![whisper_id, push_token, voip_token, to_sql(&now)],
        )?;
        Ok(updated > 0)
    }

    /// Clear a token the push provider reported as invalid. Only clears it if
    /// it is still the stored value, so a freshly registered token survives.
    pub fn clear_invalid_token(&self, whisper_id: &str, token: &str) -> Result<bool> {
        let push = self.conn().execute(
            "UPDATE devices SET push_token = NULL WHERE whisper_id = ?1 AND push_token = ?2",
            params![whisper_id, token],
        )?;
        let voip = self.conn().execute(
            "UPDATE devices SET voip_token = NULL WHERE whisper_id = ?1 AND voip_token = ?2",
            params![whisper_id, token],
        )?;
        Ok(push + voip > 0)
    }

    /// Drop both tokens (logout).
    pub fn clear_push_tokens(&self, whisper_id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE devices SET push_token = NULL, voip_token = NULL WHERE whisper_id = ?1",
            params![whisper_id],
        )?;
        Ok(())
    }
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    let platform_str: String = row.get(2)?;
    let updated_str: String = row.get(5)?;
    Ok(Device {
        whisper_id: row.get(0)?,
        device_id: row.get(1)?,
        platform: Platform::parse(&platform_str).ok_or_else(|| bad_enum(2, &platform_str))?,
        push_token: row.get(3)?,
        voip_token: row.get(4)?,
        updated_at: from_sql(5, &updated_str)?,
    })
}
