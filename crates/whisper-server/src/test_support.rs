//! Fixtures shared by the unit tests of every service.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

use whisper_shared::crypto::{decode_b64, encode_b64};
use whisper_shared::identity::ClientIdentity;
use whisper_shared::protocol::{
    AttachmentPointer, FileKeyBox, RegisterBeginPayload, RegisterChallengePayload,
    RegisterProofPayload, SendMessagePayload, ServerMessage,
};
use whisper_shared::types::{IdentityStatus, MsgType, Platform};
use whisper_store::{Database, Identity, StoreError};

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::connections::{Outbound, OUTBOUND_BUFFER};
use crate::push::{PushNotification, PushOutcome, PushProvider};
use crate::sessions::Session;

/// Push provider that records every notification instead of sending it.
pub struct RecordingProvider {
    sent: Mutex<Vec<PushNotification>>,
    outcome: Mutex<PushOutcome>,
}

impl Default for RecordingProvider {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            outcome: Mutex::new(PushOutcome::Delivered),
        }
    }
}

impl RecordingProvider {
    pub fn sent(&self) -> Vec<PushNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn respond_with(&self, outcome: PushOutcome) {
        *self.outcome.lock().unwrap() = outcome;
    }
}

impl PushProvider for RecordingProvider {
    fn send(&self, notification: PushNotification) -> BoxFuture<'_, PushOutcome> {
        self.sent.lock().unwrap().push(notification);
        let outcome = self.outcome.lock().unwrap().clone();
        Box::pin(async move { outcome })
    }
}

/// Insert an active identity with keys derived from `seed`.
pub fn insert_identity(db: &Database, whisper_id: &str, seed: u8) {
    let now = Utc::now();
    db.insert_identity(&Identity {
        whisper_id: whisper_id.to_string(),
        enc_public_key: [seed; 32],
        sign_public_key: [seed.wrapping_add(1); 32],
        status: IdentityStatus::Active,
        created_at: now,
        updated_at: now,
    })
    .unwrap();
}

pub struct TestUser {
    pub keys: ClientIdentity,
    pub whisper_id: String,
    pub session: Session,
}

/// Fully wired services over an in-memory database and a temp blob dir.
pub struct TestServer {
    pub state: AppState,
    pub provider: Arc<RecordingProvider>,
    _dir: TempDir,
}

impl TestServer {
    pub const ADMIN_TOKEN: &'static str = "test-admin-token";

    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            blob_storage_path: dir.path().join("blobs"),
            admin_token: Some(Self::ADMIN_TOKEN.to_string()),
            max_attachment_size: 64 * 1024,
            ..ServerConfig::default()
        };
        let provider = Arc::new(RecordingProvider::default());
        let state = AppState::build(config, Database::open_in_memory().unwrap(), provider.clone())
            .await
            .unwrap();
        Self {
            state,
            provider,
            _dir: dir,
        }
    }

    /// Register a fresh identity on its own device.
    pub async fn register(&self) -> TestUser {
        let keys = ClientIdentity::generate();
        let device = format!("dev-{}", Uuid::new_v4().simple());
        let challenge = self
            .state
            .auth
            .register_begin(&begin_payload(&device, None))
            .await
            .unwrap();
        let (session, ack) = self
            .state
            .auth
            .register_proof(&proof_payload(&keys, &challenge, &device, None))
            .await
            .unwrap();
        TestUser {
            keys,
            whisper_id: ack.whisper_id,
            session,
        }
    }

    /// Make every insert or update on `table` abort until
    /// [`TestServer::allow_writes`] is called.
    pub async fn refuse_writes(&self, table: &'static str) {
        let sql = format!(
            "CREATE TRIGGER refuse_insert_{table} BEFORE INSERT ON {table}
                 BEGIN SELECT RAISE(ABORT, 'write refused'); END;
             CREATE TRIGGER refuse_update_{table} BEFORE UPDATE ON {table}
                 BEGIN SELECT RAISE(ABORT, 'write refused'); END;"
        );
        self.exec(sql).await;
    }

    pub async fn allow_writes(&self, table: &'static str) {
        let sql = format!(
            "DROP TRIGGER refuse_insert_{table}; DROP TRIGGER refuse_update_{table};"
        );
        self.exec(sql).await;
    }

    async fn exec(&self, sql: String) {
        self.state
            .db
            .call(move |db| Ok(db.conn().execute_batch(&sql).map_err(StoreError::from)?))
            .await
            .unwrap();
    }

    /// Open an authenticated connection for `user` and hand back its outbound queue.
    pub async fn connect(&self, user: &TestUser) -> (Uuid, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (conn, _) = self.state.connections.create(tx, None).await;
        assert!(self.state.connections.authenticate(conn, &user.session).await);
        (conn, rx)
    }
}

pub fn begin_payload(device_id: &str, whisper_id: Option<&str>) -> RegisterBeginPayload {
    RegisterBeginPayload {
        protocol_version: Some(1),
        crypto_version: Some(1),
        device_id: device_id.to_string(),
        platform: Platform::Android,
        whisper_id: whisper_id.map(str::to_string),
    }
}

pub fn proof_payload(
    keys: &ClientIdentity,
    challenge: &RegisterChallengePayload,
    device_id: &str,
    whisper_id: Option<&str>,
) -> RegisterProofPayload {
    let raw = decode_b64("challenge", &challenge.challenge).unwrap();
    RegisterProofPayload {
        protocol_version: Some(1),
        crypto_version: Some(1),
        challenge_id: challenge.challenge_id.clone(),
        device_id: device_id.to_string(),
        platform: Platform::Android,
        whisper_id: whisper_id.map(str::to_string),
        enc_public_key: keys.enc_public_key_b64(),
        sign_public_key: keys.sign_public_key_b64(),
        signature: keys.sign_challenge(&raw),
        push_token: Some("push-token".to_string()),
        voip_token: None,
    }
}

/// Every text frame queued so far, decoded.
pub fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
    let mut frames = Vec::new();
    while let Ok(out) = rx.try_recv() {
        if let Outbound::Frame(text) = out {
            frames.push(ServerMessage::from_frame(&text).unwrap().1);
        }
    }
    frames
}

/// A correctly signed direct envelope from `from` to `to`.
pub fn envelope(from: &TestUser, to: &str, message_id: &str) -> SendMessagePayload {
    let timestamp = Utc::now().timestamp_millis();
    let nonce = encode_b64(&[9u8; 24]);
    let ciphertext = encode_b64(format!("sealed {message_id}").as_bytes());
    let sig = from.keys.sign_envelope(
        "send_message",
        message_id,
        &from.whisper_id,
        to,
        timestamp,
        &nonce,
        &ciphertext,
    );
    SendMessagePayload {
        session_token: None,
        message_id: message_id.to_string(),
        from: from.whisper_id.clone(),
        to: to.to_string(),
        msg_type: MsgType::Text,
        timestamp,
        nonce,
        ciphertext,
        sig,
        reply_to: None,
        reactions: None,
        attachment: None,
    }
}

pub fn pointer(object_key: &str) -> AttachmentPointer {
    AttachmentPointer {
        object_key: object_key.to_string(),
        content_type: "image/png".to_string(),
        ciphertext_size: 10,
        file_nonce: encode_b64(&[3u8; 24]),
        file_key_box: FileKeyBox {
            nonce: encode_b64(&[4u8; 24]),
            ciphertext: encode_b64(&[5u8; 48]),
        },
    }
}

/// Wait until the provider has seen at least `count` notifications.
pub async fn wait_for_pushes(provider: &RecordingProvider, count: usize) {
    for _ in 0..200 {
        if provider.sent().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {count} push notifications, saw {}",
        provider.sent().len()
    );
}
