//! Registry of live client connections.
//!
//! Each WebSocket gets a connection id and a bounded outbound channel. Once
//! authenticated, the connection is also indexed by whisper id; an identity
//! has at most one indexed connection. Both maps live under one lock so
//! authenticate/remove update them together.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use whisper_shared::constants::HEARTBEAT_TIMEOUT_FACTOR;
use whisper_shared::protocol::{PresenceEntry, ServerMessage};
use whisper_shared::types::Platform;
use whisper_shared::ErrorCode;

use crate::ephemeral::{keys, EphemeralStore};
use crate::sessions::Session;

/// Capacity of each connection's outbound queue.
pub const OUTBOUND_BUFFER: usize = 256;

/// Last-seen markers outlive the connection by this much.
const LAST_SEEN_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub const SUPERSEDED_NOTICE: &str = "session terminated: signed in on another device";

/// What the writer task should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(String),
    Ping,
    Close,
}

/// Identity bound to a connection after a successful proof.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub whisper_id: String,
    pub device_id: String,
    pub platform: Platform,
    pub session_token: String,
    pub authenticated_at: DateTime<Utc>,
}

struct Connection {
    tx: mpsc::Sender<Outbound>,
    shutdown: Arc<Notify>,
    ip: Option<IpAddr>,
    auth: Option<AuthInfo>,
    last_activity: Instant,
}

impl Connection {
    /// Queue an optional final frame, then the close, and wake the reader.
    /// The reader is woken even when the queue is full.
    fn close(&self, notice: Option<String>) {
        if let Some(frame) = notice {
            if let Err(e) = self.tx.try_send(Outbound::Frame(frame)) {
                debug!(error = %e, "Closing notice not queued");
            }
        }
        if self.tx.try_send(Outbound::Close).is_err() {
            debug!("Close not queued, relying on shutdown signal");
        }
        self.shutdown.notify_one();
    }
}

#[derive(Default)]
struct Registry {
    conns: HashMap<Uuid, Connection>,
    by_user: HashMap<String, Uuid>,
}

impl Registry {
    /// Detach a connection from both maps.
    fn detach(&mut self, conn_id: &Uuid) -> Option<Connection> {
        let conn = self.conns.remove(conn_id)?;
        if let Some(auth) = &conn.auth {
            if self.by_user.get(&auth.whisper_id) == Some(conn_id) {
                self.by_user.remove(&auth.whisper_id);
            }
        }
        Some(conn)
    }
}

/// Presence mirror record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresenceRecord {
    conn_id: Uuid,
    platform: Platform,
    last_seen: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub pinged: usize,
    pub evicted: usize,
}

pub struct ConnectionManager {
    inner: RwLock<Registry>,
    kv: Arc<EphemeralStore>,
    heartbeat_interval: Duration,
}

impl ConnectionManager {
    pub fn new(kv: Arc<EphemeralStore>, heartbeat_interval: Duration) -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
            kv,
            heartbeat_interval,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Register a new, unauthenticated connection. The returned `Notify` fires
    /// when the server closes it.
    pub async fn create(
        &self,
        tx: mpsc::Sender<Outbound>,
        ip: Option<IpAddr>,
    ) -> (Uuid, Arc<Notify>) {
        let conn_id = Uuid::new_v4();
        let shutdown = Arc::new(Notify::new());
        self.inner.write().await.conns.insert(
            conn_id,
            Connection {
                tx,
                shutdown: shutdown.clone(),
                ip,
                auth: None,
                last_activity: Instant::now(),
            },
        );
        debug!(conn = %conn_id, ip = ?ip, "Connection opened");
        (conn_id, shutdown)
    }

    /// Bind a connection to the session's identity.
    ///
    /// A different connection already bound to the identity is closed: silently
    /// if it is the same device reconnecting, with an `AUTH_FAILED` notice
    /// otherwise. Returns `false` if `conn_id` is no longer registered.
    pub async fn authenticate(&self, conn_id: Uuid, session: &Session) -> bool {
        let displaced = {
            let mut registry = self.inner.write().await;
            if !registry.conns.contains_key(&conn_id) {
                return false;
            }

            let displaced = match registry.by_user.get(&session.whisper_id).copied() {
                Some(old_id) if old_id != conn_id => registry.detach(&old_id),
                _ => None,
            };

            // Re-authenticating as someone else releases the old binding.
            let previous_user = registry
                .conns
                .get(&conn_id)
                .and_then(|c| c.auth.as_ref())
                .map(|a| a.whisper_id.clone())
                .filter(|id| *id != session.whisper_id);
            if let Some(previous_user) = previous_user {
                if registry.by_user.get(&previous_user) == Some(&conn_id) {
                    registry.by_user.remove(&previous_user);
                }
            }

            if let Some(conn) = registry.conns.get_mut(&conn_id) {
                conn.auth = Some(AuthInfo {
                    whisper_id: session.whisper_id.clone(),
                    device_id: session.device_id.clone(),
                    platform: session.platform,
                    session_token: session.session_token.clone(),
                    authenticated_at: Utc::now(),
                });
                conn.last_activity = Instant::now();
            }
            registry
                .by_user
                .insert(session.whisper_id.clone(), conn_id);
            // Under the write guard so racing binds publish in registry order.
            self.publish_presence(&session.whisper_id, conn_id, session.platform);
            displaced
        };

        if let Some(old) = displaced {
            let same_device = old
                .auth
                .as_ref()
                .is_some_and(|a| a.device_id == session.device_id);
            if same_device {
                old.close(None);
            } else {
                let notice = ServerMessage::error(ErrorCode::AuthFailed, SUPERSEDED_NOTICE);
                old.close(Some(notice.to_frame(None)));
            }
            info!(
                whisper_id = %session.whisper_id,
                same_device,
                "Superseded connection closed"
            );
        }

        info!(conn = %conn_id, whisper_id = %session.whisper_id, "Connection authenticated");
        true
    }

    /// Point an authenticated connection at a refreshed session token.
    pub async fn rebind_token(&self, conn_id: Uuid, session_token: &str) {
        if let Some(auth) = self
            .inner
            .write()
            .await
            .conns
            .get_mut(&conn_id)
            .and_then(|c| c.auth.as_mut())
        {
            auth.session_token = session_token.to_string();
        }
    }

    /// Remove a connection. Unknown ids are a no-op.
    pub async fn remove(&self, conn_id: Uuid, reason: &str) -> bool {
        let conn = {
            let mut registry = self.inner.write().await;
            let Some(conn) = registry.detach(&conn_id) else {
                return false;
            };
            if let Some(auth) = &conn.auth {
                self.clear_presence(&auth.whisper_id, conn_id);
            }
            conn
        };
        conn.shutdown.notify_one();
        debug!(conn = %conn_id, reason, "Connection removed");
        true
    }

    /// Close and remove the identity's live connection, sending `notice`
    /// (an encoded frame) first.
    pub async fn kick_user(&self, whisper_id: &str, notice: Option<String>) -> bool {
        let conn = {
            let mut registry = self.inner.write().await;
            let found = match registry.by_user.get(whisper_id).copied() {
                Some(conn_id) => registry.detach(&conn_id).map(|c| (conn_id, c)),
                None => None,
            };
            if let Some((conn_id, _)) = &found {
                self.clear_presence(whisper_id, *conn_id);
            }
            found
        };
        let Some((conn_id, conn)) = conn else {
            return false;
        };
        conn.close(notice);
        info!(conn = %conn_id, whisper_id, "Connection kicked");
        true
    }

    /// Best-effort, non-blocking delivery. `false` means the caller should
    /// queue the message.
    pub async fn send_to_user(&self, whisper_id: &str, message: &ServerMessage) -> bool {
        let registry = self.inner.read().await;
        let Some(conn) = registry
            .by_user
            .get(whisper_id)
            .and_then(|id| registry.conns.get(id))
        else {
            return false;
        };
        match conn.tx.try_send(Outbound::Frame(message.to_frame(None))) {
            Ok(()) => true,
            Err(_) => {
                debug!(whisper_id, "Outbound queue full or closed");
                false
            }
        }
    }

    pub async fn touch(&self, conn_id: Uuid) {
        if let Some(conn) = self.inner.write().await.conns.get_mut(&conn_id) {
            conn.last_activity = Instant::now();
        }
    }

    pub async fn auth_info(&self, conn_id: Uuid) -> Option<AuthInfo> {
        self.inner
            .read()
            .await
            .conns
            .get(&conn_id)
            .and_then(|c| c.auth.clone())
    }

    pub async fn peer_ip(&self, conn_id: Uuid) -> Option<IpAddr> {
        self.inner.read().await.conns.get(&conn_id).and_then(|c| c.ip)
    }

    pub async fn is_online(&self, whisper_id: &str) -> bool {
        self.inner.read().await.by_user.contains_key(whisper_id)
    }

    /// `(open, authenticated)` connection counts.
    pub async fn count(&self) -> (usize, usize) {
        let registry = self.inner.read().await;
        (registry.conns.len(), registry.by_user.len())
    }

    pub async fn presence(&self, whisper_ids: &[String]) -> Vec<PresenceEntry> {
        let online: Vec<bool> = {
            let registry = self.inner.read().await;
            whisper_ids
                .iter()
                .map(|id| registry.by_user.contains_key(id))
                .collect()
        };

        whisper_ids
            .iter()
            .zip(online)
            .map(|(id, online)| {
                let last_seen = if online {
                    self.kv
                        .get_json::<PresenceRecord>(&keys::presence(id))
                        .map(|p| p.last_seen)
                } else {
                    self.kv.get(&keys::last_seen(id)).and_then(|v| v.parse().ok())
                };
                PresenceEntry {
                    whisper_id: id.clone(),
                    online,
                    last_seen,
                }
            })
            .collect()
    }

    /// Ping every connection and evict the silent ones.
    pub async fn heartbeat(&self) -> HeartbeatReport {
        let timeout = self.heartbeat_interval * HEARTBEAT_TIMEOUT_FACTOR;
        let now = Instant::now();

        let (evicted, alive, pinged) = {
            let mut registry = self.inner.write().await;
            let mut stale = Vec::new();
            let mut alive = Vec::new();
            let mut pinged = 0;
            for (conn_id, conn) in &registry.conns {
                let silent = now.duration_since(conn.last_activity) > timeout;
                if silent || conn.tx.try_send(Outbound::Ping).is_err() {
                    stale.push(*conn_id);
                    continue;
                }
                pinged += 1;
                if let Some(auth) = &conn.auth {
                    alive.push((auth.whisper_id.clone(), *conn_id, auth.platform));
                }
            }
            let evicted: Vec<(Uuid, Connection)> = stale
                .into_iter()
                .filter_map(|id| registry.detach(&id).map(|c| (id, c)))
                .collect();
            (evicted, alive, pinged)
        };

        for (conn_id, conn) in &evicted {
            conn.close(None);
            if let Some(auth) = &conn.auth {
                self.clear_presence(&auth.whisper_id, *conn_id);
            }
            debug!(conn = %conn_id, "Evicted unresponsive connection");
        }
        for (whisper_id, conn_id, platform) in &alive {
            self.publish_presence(whisper_id, *conn_id, *platform);
        }

        HeartbeatReport {
            pinged,
            evicted: evicted.len(),
        }
    }

    fn presence_ttl(&self) -> Duration {
        self.heartbeat_interval * (HEARTBEAT_TIMEOUT_FACTOR + 1)
    }

    fn publish_presence(&self, whisper_id: &str, conn_id: Uuid, platform: Platform) {
        let record = PresenceRecord {
            conn_id,
            platform,
            last_seen: Utc::now().timestamp_millis(),
        };
        self.kv
            .set_json(&keys::presence(whisper_id), &record, self.presence_ttl());
    }

    /// Clear the presence mirror only if it still names `conn_id`.
    fn clear_presence(&self, whisper_id: &str, conn_id: Uuid) {
        let cleared = self.kv.delete_if(&keys::presence(whisper_id), |raw| {
            serde_json::from_str::<PresenceRecord>(raw).is_ok_and(|p| p.conn_id == conn_id)
        });
        if cleared {
            self.kv.set(
                &keys::last_seen(whisper_id),
                Utc::now().timestamp_millis().to_string(),
                LAST_SEEN_TTL,
            );
        }
    }
}
