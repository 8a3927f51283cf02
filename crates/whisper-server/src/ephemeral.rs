//! In-process key/value store with per-entry expiry.
//!
//! Holds everything that may be lost on restart: challenges, sessions, the
//! active-session index, pending queues, dedup markers, presence and push
//! suppression markers. Expired entries are invisible to reads and are
//! dropped lazily on access or by [`EphemeralStore::purge_expired`].
//!
//! Values are JSON text so typed records round-trip through `serde`.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

enum Stored {
    Text(String),
    List(Vec<String>),
}

struct Entry {
    value: Stored,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
pub struct EphemeralStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Scalar values
    // ------------------------------------------------------------------

    pub fn set(&self, key: &str, value: String, ttl: Duration) {
        self.write().insert(
            key.to_string(),
            Entry {
                value: Stored::Text(value),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Set only if no live entry exists. Returns `true` if the value was set.
    pub fn set_nx(&self, key: &str, value: String, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.write();
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return false;
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Text(value),
                expires_at: now + ttl,
            },
        );
        true
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        {
            let entries = self.read();
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => {
                    return match &entry.value {
                        Stored::Text(v) => Some(v.clone()),
                        Stored::List(_) => None,
                    };
                }
                None => return None,
                Some(_) => {}
            }
        }
        self.evict_if_expired(key, now);
        None
    }

    /// Atomic read-and-delete.
    pub fn take(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        match self.write().remove(key) {
            Some(Entry {
                value: Stored::Text(v),
                expires_at,
            }) if now < expires_at => Some(v),
            _ => None,
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.write().remove(key).is_some()
    }

    /// Delete the entry only if `matches` accepts its current value.
    pub fn delete_if(&self, key: &str, matches: impl FnOnce(&str) -> bool) -> bool {
        let mut entries = self.write();
        let hit = match entries.get(key) {
            Some(Entry {
                value: Stored::Text(v),
                ..
            }) => matches(v),
            _ => false,
        };
        if hit {
            entries.remove(key);
        }
        hit
    }

    // ------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------

    /// Append to a list and refresh its expiry. Returns the new length, so a
    /// result of 1 means the list went from empty to non-empty.
    pub fn push(&self, key: &str, value: String, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.write();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Stored::List(Vec::new()),
            expires_at: now + ttl,
        });
        if !entry.is_live(now) || !matches!(entry.value, Stored::List(_)) {
            entry.value = Stored::List(Vec::new());
        }
        entry.expires_at = now + ttl;
        match &mut entry.value {
            Stored::List(items) => {
                items.push(value);
                items.len()
            }
            Stored::Text(_) => 0,
        }
    }

    /// Snapshot of a list, oldest first.
    pub fn range(&self, key: &str) -> Vec<String> {
        let now = Instant::now();
        match self.read().get(key) {
            Some(Entry {
                value: Stored::List(items),
                expires_at,
            }) if now < *expires_at => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Remove the first list item accepted by `matches`. Drops the list once
    /// it is empty.
    pub fn remove_first(&self, key: &str, matches: impl Fn(&str) -> bool) -> bool {
        let mut entries = self.write();
        let Some(Entry {
            value: Stored::List(items),
            ..
        }) = entries.get_mut(key)
        else {
            return false;
        };
        let Some(pos) = items.iter().position(|item| matches(item)) else {
            return false;
        };
        items.remove(pos);
        if items.is_empty() {
            entries.remove(key);
        }
        true
    }

    // ------------------------------------------------------------------
    // Typed helpers
    // ------------------------------------------------------------------

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(text) => self.set(key, text, ttl),
            Err(e) => tracing::error!(key, error = %e, "Failed to encode ephemeral value"),
        }
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        decode(key, &self.get(key)?)
    }

    pub fn take_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        decode(key, &self.take(key)?)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    fn evict_if_expired(&self, key: &str, now: Instant) {
        let mut entries = self.write();
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, text: &str) -> Option<T> {
    match serde_json::from_str(text) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(key, error = %e, "Discarding undecodable ephemeral value");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Key layout
// ---------------------------------------------------------------------------

pub mod keys {
    use whisper_shared::types::PushReason;

    pub fn challenge(challenge_id: &str) -> String {
        format!("challenge:{challenge_id}")
    }

    pub fn session(token: &str) -> String {
        format!("session:{token}")
    }

    pub fn active_session(whisper_id: &str) -> String {
        format!("active_session:{whisper_id}")
    }

    pub fn pending(whisper_id: &str) -> String {
        format!("pending:{whisper_id}")
    }

    pub fn dedup(sender: &str, message_id: &str) -> String {
        format!("dedup:{sender}:{message_id}")
    }

    pub fn presence(whisper_id: &str) -> String {
        format!("presence:{whisper_id}")
    }

    pub fn last_seen(whisper_id: &str) -> String {
        format!("last_seen:{whisper_id}")
    }

    pub fn push_suppress(whisper_id: &str, reason: PushReason) -> String {
        format!("push_suppress:{whisper_id}:{}", reason.as_str())
    }
}
