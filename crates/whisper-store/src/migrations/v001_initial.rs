//! v001 -- Initial schema creation.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Identities
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS identities (
    whisper_id      TEXT PRIMARY KEY NOT NULL,   -- WSP-XXXX-XXXX-XXXX
    enc_public_key  TEXT NOT NULL,               -- hex-encoded X25519 key
    sign_public_key TEXT NOT NULL,               -- hex-encoded Ed25519 key
    status          TEXT NOT NULL DEFAULT 'active',
    created_at      TEXT NOT NULL,               -- RFC-3339
    updated_at      TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_identities_keys
    ON identities(enc_public_key, sign_public_key);

-- ----------------------------------------------------------------
-- Devices (one active device per identity)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS devices (
    whisper_id TEXT PRIMARY KEY NOT NULL,
    device_id  TEXT NOT NULL,
    platform   TEXT NOT NULL,
    push_token TEXT,
    voip_token TEXT,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (whisper_id) REFERENCES identities(whisper_id)
);

-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chat_groups (
    group_id   TEXT PRIMARY KEY NOT NULL,      -- UUID v4
    title      TEXT NOT NULL,
    owner_id   TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (owner_id) REFERENCES identities(whisper_id)
);

CREATE INDEX IF NOT EXISTS idx_groups_owner ON chat_groups(owner_id);

CREATE TABLE IF NOT EXISTS group_members (
    group_id   TEXT NOT NULL,
    whisper_id TEXT NOT NULL,
    role       TEXT NOT NULL,                  -- owner | admin | member
    joined_at  TEXT NOT NULL,
    removed_at TEXT,                           -- tombstone

    PRIMARY KEY (group_id, whisper_id),
    FOREIGN KEY (group_id) REFERENCES chat_groups(group_id),
    FOREIGN KEY (whisper_id) REFERENCES identities(whisper_id)
);

CREATE INDEX IF NOT EXISTS idx_group_members_member ON group_members(whisper_id);

-- ----------------------------------------------------------------
-- Audit trail
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS audit_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    whisper_id TEXT,                           -- nulled on account deletion
    reason     TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_whisper_id ON audit_events(whisper_id);

-- ----------------------------------------------------------------
-- Contact backups (opaque ciphertext)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contact_backups (
    whisper_id TEXT PRIMARY KEY NOT NULL,
    data       BLOB NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (whisper_id) REFERENCES identities(whisper_id)
);

-- ----------------------------------------------------------------
-- Attachments
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS attachments (
    object_key   TEXT PRIMARY KEY NOT NULL,
    owner_id     TEXT NOT NULL,
    content_type TEXT NOT NULL,
    size         INTEGER NOT NULL,
    created_at   TEXT NOT NULL,

    FOREIGN KEY (owner_id) REFERENCES identities(whisper_id)
);

CREATE INDEX IF NOT EXISTS idx_attachments_owner ON attachments(owner_id);

CREATE TABLE IF NOT EXISTS attachment_grants (
    object_key TEXT NOT NULL,
    grantee_id TEXT NOT NULL,
    granted_at TEXT NOT NULL,

    PRIMARY KEY (object_key, grantee_id),
    FOREIGN KEY (object_key) REFERENCES attachments(object_key),
    FOREIGN KEY (grantee_id) REFERENCES identities(whisper_id)
);

CREATE INDEX IF NOT EXISTS idx_attachment_grants_grantee ON attachment_grants(grantee_id);

-- ----------------------------------------------------------------
-- Bans
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS bans (
    whisper_id TEXT PRIMARY KEY NOT NULL,
    reason     TEXT NOT NULL,
    created_at TEXT NOT NULL,

    FOREIGN KEY (whisper_id) REFERENCES identities(whisper_id)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
