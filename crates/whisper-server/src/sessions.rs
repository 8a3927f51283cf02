//! Session tokens with single-active-device enforcement.
//!
//! `session:{token}` holds the session record and `active_session:{id}` names
//! the one token currently valid for an identity. A token is only valid while
//! both exist and agree.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use whisper_shared::crypto::generate_session_token;
use whisper_shared::types::Platform;

use crate::ephemeral::{keys, EphemeralStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_token: String,
    pub whisper_id: String,
    pub device_id: String,
    pub platform: Platform,
    /// Unix ms
    pub created_at: i64,
    /// Unix ms
    pub expires_at: i64,
}

pub struct SessionStore {
    kv: Arc<EphemeralStore>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(kv: Arc<EphemeralStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Mint a session and make it the only valid one for the identity.
    /// Returns the new session and the token it superseded, if any.
    pub fn issue(
        &self,
        whisper_id: &str,
        device_id: &str,
        platform: Platform,
    ) -> (Session, Option<String>) {
        let now = Utc::now().timestamp_millis();
        let session = Session {
            session_token: generate_session_token(),
            whisper_id: whisper_id.to_string(),
            device_id: device_id.to_string(),
            platform,
            created_at: now,
            expires_at: now + self.ttl.as_millis() as i64,
        };

        let previous = self.kv.take(&keys::active_session(whisper_id));
        if let Some(old) = &previous {
            self.kv.delete(&keys::session(old));
        }
        self.kv
            .set_json(&keys::session(&session.session_token), &session, self.ttl);
        self.kv.set(
            &keys::active_session(whisper_id),
            session.session_token.clone(),
            self.ttl,
        );

        (session, previous)
    }

    pub fn validate(&self, token: &str) -> Option<Session> {
        let session: Session = self.kv.get_json(&keys::session(token))?;
        let active = self.kv.get(&keys::active_session(&session.whisper_id));
        if active.as_deref() != Some(token) {
            self.kv.delete(&keys::session(token));
            return None;
        }
        Some(session)
    }

    /// Delete a session and, if it is still the active one, the index entry.
    pub fn revoke(&self, token: &str) -> Option<Session> {
        let session: Session = self.kv.take_json(&keys::session(token))?;
        self.kv
            .delete_if(&keys::active_session(&session.whisper_id), |v| v == token);
        Some(session)
    }

    /// Revoke whatever session the identity currently holds.
    pub fn revoke_user(&self, whisper_id: &str) -> Option<String> {
        let token = self.kv.take(&keys::active_session(whisper_id))?;
        self.kv.delete(&keys::session(&token));
        Some(token)
    }
}
