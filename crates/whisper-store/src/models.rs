//! Domain model structs persisted in the server database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use whisper_shared::types::{IdentityStatus, Platform, Role};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A registered key pair and its server-assigned id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub whisper_id: String,
    /// X25519 public key (32 bytes), stored as hex.
    pub enc_public_key: [u8; 32],
    /// Ed25519 public key (32 bytes), stored as hex. Immutable.
    pub sign_public_key: [u8; 32],
    pub status: IdentityStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    pub fn is_banned(&self) -> bool {
        self.status == IdentityStatus::Banned
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// The single active device of an identity and its push tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub whisper_id: String,
    pub device_id: String,
    pub platform: Platform,
    pub push_token: Option<String>,
    /// iOS PushKit token, used for time-sensitive wakes.
    pub voip_token: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub group_id: String,
    pub title: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A roster row. Removed members keep their row with `removed_at` set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMember {
    pub group_id: String,
    pub whisper_id: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl GroupMember {
    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// A security-relevant event. Never carries secret material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEvent {
    pub id: i64,
    pub event_type: String,
    pub whisper_id: Option<String>,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Contact backup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactBackup {
    pub whisper_id: String,
    /// Opaque client-encrypted blob.
    pub data: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

/// Metadata for an encrypted blob held by the attachment service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub object_key: String,
    pub owner_id: String,
    pub content_type: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}
