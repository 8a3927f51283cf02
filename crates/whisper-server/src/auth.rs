//! Challenge-response registration, recovery and session lifecycle.
//!
//! A client proves possession of its signing key by signing
//! `SHA-256(challenge)`. The first proof for a key pair creates an identity;
//! later proofs with the same keys recover it. Each successful proof mints a
//! session that supersedes any previous one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use whisper_shared::constants::{CHALLENGE_SIZE, CHALLENGE_TTL_SECS};
use whisper_shared::crypto::{
    decode_b64_fixed, encode_b64, generate_whisper_id, is_valid_whisper_id, random_bytes,
    verify_prehashed,
};
use whisper_shared::protocol::{
    RegisterAckPayload, RegisterBeginPayload, RegisterChallengePayload, RegisterProofPayload,
    ServerMessage, SessionRefreshAckPayload, SuccessPayload,
};
use whisper_shared::types::{IdentityStatus, Platform, PushReason};
use whisper_shared::validation::{validate_client_id, validate_public_key, validate_signature};
use whisper_shared::ErrorCode;
use whisper_store::{Device, Identity, StoreError};

use crate::attachments::AttachmentService;
use crate::connections::ConnectionManager;
use crate::db::DbHandle;
use crate::ephemeral::{keys, EphemeralStore};
use crate::error::{Result, ServerError};
use crate::sessions::{Session, SessionStore};

const ID_GENERATION_ATTEMPTS: usize = 5;

/// Issued challenge, bound to the parameters of `register_begin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Challenge {
    challenge: String,
    device_id: String,
    platform: Platform,
    whisper_id: Option<String>,
    created_at: i64,
}

pub struct AuthService {
    db: DbHandle,
    kv: Arc<EphemeralStore>,
    sessions: SessionStore,
    connections: Arc<ConnectionManager>,
    attachments: Arc<AttachmentService>,
}

impl AuthService {
    pub fn new(
        db: DbHandle,
        kv: Arc<EphemeralStore>,
        sessions: SessionStore,
        connections: Arc<ConnectionManager>,
        attachments: Arc<AttachmentService>,
    ) -> Self {
        Self {
            db,
            kv,
            sessions,
            connections,
            attachments,
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub async fn register_begin(&self, p: &RegisterBeginPayload) -> Result<RegisterChallengePayload> {
        validate_client_id("deviceId", &p.device_id)?;

        if let Some(claimed) = &p.whisper_id {
            if !is_valid_whisper_id(claimed) {
                return Err(ServerError::InvalidPayload("malformed whisperId".to_string()));
            }
            let wid = claimed.clone();
            let identity = self.db.call(move |db| Ok(db.find_identity(&wid)?)).await?;
            match identity {
                None => return Err(ServerError::NotFound("identity".to_string())),
                Some(identity) if identity.is_banned() => {
                    self.audit("auth_rejected", Some(claimed), "banned").await;
                    return Err(ServerError::UserBanned);
                }
                Some(_) => {}
            }
        }

        let challenge_id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let challenge = Challenge {
            challenge: encode_b64(&random_bytes::<CHALLENGE_SIZE>()),
            device_id: p.device_id.clone(),
            platform: p.platform,
            whisper_id: p.whisper_id.clone(),
            created_at: now,
        };
        self.kv.set_json(
            &keys::challenge(&challenge_id),
            &challenge,
            Duration::from_secs(CHALLENGE_TTL_SECS),
        );

        Ok(RegisterChallengePayload {
            challenge_id,
            challenge: challenge.challenge,
            expires_at: now + (CHALLENGE_TTL_SECS * 1000) as i64,
        })
    }

    /// Verify a signed challenge and open a session.
    pub async fn register_proof(&self, p: &RegisterProofPayload) -> Result<(Session, RegisterAckPayload)> {
        // Consumed before anything else so a challenge can never be replayed,
        // even after a failed attempt.
        let Some(challenge) = self.kv.take_json::<Challenge>(&keys::challenge(&p.challenge_id))
        else {
            self.audit("auth_failed", p.whisper_id.as_deref(), "unknown_challenge").await;
            return Err(ServerError::AuthFailed("unknown or expired challenge".to_string()));
        };

        if challenge.device_id != p.device_id
            || challenge.platform != p.platform
            || challenge.whisper_id != p.whisper_id
        {
            self.audit("auth_failed", p.whisper_id.as_deref(), "challenge_mismatch").await;
            return Err(ServerError::AuthFailed("challenge parameters differ".to_string()));
        }

        let enc_key = validate_public_key("encPublicKey", &p.enc_public_key)?;
        let sign_key = validate_public_key("signPublicKey", &p.sign_public_key)?;
        let signature = validate_signature("signature", &p.signature)?;
        let challenge_bytes = decode_b64_fixed::<CHALLENGE_SIZE>("challenge", &challenge.challenge)?;

        if verify_prehashed(&sign_key, &challenge_bytes, &signature).is_err() {
            self.audit("auth_failed", p.whisper_id.as_deref(), "bad_signature").await;
            return Err(ServerError::AuthFailed("bad signature".to_string()));
        }

        // Persist the device before minting a session: a failed write must
        // not revoke the one the caller already holds.
        let claimed = p.whisper_id.clone();
        let (device_id, platform) = (p.device_id.clone(), p.platform);
        let (push_token, voip_token) = (p.push_token.clone(), p.voip_token.clone());
        let resolved = self
            .db
            .call(move |db| {
                let (identity, created) =
                    resolve_identity(db, claimed.as_deref(), enc_key, sign_key)?;
                db.upsert_device(&Device {
                    whisper_id: identity.whisper_id.clone(),
                    device_id,
                    platform,
                    push_token,
                    voip_token,
                    updated_at: Utc::now(),
                })?;
                Ok((identity, created))
            })
            .await;
        let (identity, created) = match resolved {
            Ok(found) => found,
            Err(e) => {
                let reason = match &e {
                    ServerError::UserBanned => Some("banned"),
                    ServerError::AuthFailed(_) => Some("key_mismatch"),
                    _ => None,
                };
                if let Some(reason) = reason {
                    self.audit("auth_failed", p.whisper_id.as_deref(), reason).await;
                }
                return Err(e);
            }
        };

        let (session, previous) = self
            .sessions
            .issue(&identity.whisper_id, &p.device_id, p.platform);
        if previous.is_some() {
            info!(whisper_id = %identity.whisper_id, "Previous session superseded");
        }


        let event = if created { "register" } else { "recover" };
        self.audit(event, Some(&identity.whisper_id), &format!("device {}", p.device_id))
            .await;
        info!(whisper_id = %identity.whisper_id, created, platform = %p.platform, "Identity authenticated");

        let ack = RegisterAckPayload {
            success: true,
            whisper_id: identity.whisper_id,
            session_token: session.session_token.clone(),
            session_expires_at: session.expires_at,
            server_time: Utc::now().timestamp_millis(),
        };
        Ok((session, ack))
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn validate_session(&self, token: &str) -> Option<Session> {
        self.sessions.validate(token)
    }

    pub fn refresh_session(&self, token: &str) -> Result<(Session, SessionRefreshAckPayload)> {
        let current = self
            .sessions
            .validate(token)
            .ok_or_else(|| ServerError::AuthFailed("invalid session".to_string()))?;
        let (session, _) =
            self.sessions
                .issue(&current.whisper_id, &current.device_id, current.platform);
        let ack = SessionRefreshAckPayload {
            session_token: session.session_token.clone(),
            session_expires_at: session.expires_at,
            server_time: Utc::now().timestamp_millis(),
        };
        Ok((session, ack))
    }

    /// End the session and stop wakes to the logged-out device.
    pub async fn logout(&self, token: &str) -> Result<()> {
        let session = self
            .sessions
            .revoke(token)
            .ok_or_else(|| ServerError::AuthFailed("invalid session".to_string()))?;
        let wid = session.whisper_id.clone();
        self.db.call(move |db| Ok(db.clear_push_tokens(&wid)?)).await?;
        info!(whisper_id = %session.whisper_id, "Logged out");
        Ok(())
    }

    pub async fn update_tokens(
        &self,
        whisper_id: &str,
        push_token: Option<String>,
        voip_token: Option<String>,
    ) -> Result<()> {
        let wid = whisper_id.to_string();
        let updated = self
            .db
            .call(move |db| {
                Ok(db.update_push_tokens(&wid, push_token.as_deref(), voip_token.as_deref(), Utc::now())?)
            })
            .await?;
        if !updated {
            return Err(ServerError::NotFound("device".to_string()));
        }
        Ok(())
    }

    /// Irreversibly delete the identity behind `token` and everything it owns.
    /// The live connection, if any, receives `notice_frame` and is closed.
    pub async fn delete_account(&self, token: &str, notice_frame: Option<String>) -> Result<String> {
        let session = self
            .sessions
            .validate(token)
            .ok_or_else(|| ServerError::AuthFailed("invalid session".to_string()))?;
        let whisper_id = session.whisper_id;

        let wid = whisper_id.clone();
        let object_keys = self
            .db
            .call(move |db| {
                db.delete_account(&wid)?
                    .ok_or_else(|| ServerError::NotFound("identity".to_string()))
            })
            .await?;

        self.sessions.revoke_user(&whisper_id);
        self.kv.delete(&keys::pending(&whisper_id));
        self.kv.delete(&keys::presence(&whisper_id));
        self.kv.delete(&keys::last_seen(&whisper_id));
        for reason in [PushReason::Message, PushReason::Call, PushReason::System] {
            self.kv.delete(&keys::push_suppress(&whisper_id, reason));
        }

        self.attachments.delete_blobs(&object_keys).await;

        let notice = notice_frame.unwrap_or_else(|| {
            ServerMessage::AccountDeleted(SuccessPayload { success: true }).to_frame(None)
        });
        self.connections.kick_user(&whisper_id, Some(notice)).await;

        self.audit("account_deleted", None, "identity removed").await;
        info!(whisper_id = %whisper_id, "Account deleted");
        Ok(whisper_id)
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    pub async fn ban(&self, whisper_id: &str, reason: &str) -> Result<()> {
        let wid = whisper_id.to_string();
        let why = reason.to_string();
        let found = self
            .db
            .call(move |db| Ok(db.ban_identity(&wid, &why, Utc::now())?))
            .await?;
        if !found {
            return Err(ServerError::NotFound("identity".to_string()));
        }

        self.sessions.revoke_user(whisper_id);
        let notice = ServerMessage::error(ErrorCode::UserBanned, "identity is banned");
        self.connections
            .kick_user(whisper_id, Some(notice.to_frame(None)))
            .await;
        self.audit("ban", Some(whisper_id), reason).await;
        warn!(whisper_id, "Identity banned");
        Ok(())
    }

    pub async fn unban(&self, whisper_id: &str) -> Result<()> {
        let wid = whisper_id.to_string();
        let found = self
            .db
            .call(move |db| Ok(db.unban_identity(&wid, Utc::now())?))
            .await?;
        if !found {
            return Err(ServerError::NotFound("identity".to_string()));
        }
        self.audit("unban", Some(whisper_id), "lifted").await;
        info!(whisper_id, "Identity unbanned");
        Ok(())
    }

    /// Record a security event. Failures are logged, never surfaced.
    async fn audit(&self, event: &'static str, whisper_id: Option<&str>, reason: &str) {
        let wid = whisper_id.map(str::to_string);
        let reason = reason.to_string();
        let result = self
            .db
            .call(move |db| Ok(db.insert_audit(event, wid.as_deref(), &reason, Utc::now())?))
            .await;
        if let Err(e) = result {
            e.log("audit");
        }
    }
}

/// Find or create the identity a verified proof refers to.
fn resolve_identity(
    db: &mut whisper_store::Database,
    claimed: Option<&str>,
    enc_key: [u8; 32],
    sign_key: [u8; 32],
) -> Result<(Identity, bool)> {
    if let Some(claimed) = claimed {
        let identity = db
            .find_identity(claimed)?
            .ok_or_else(|| ServerError::NotFound("identity".to_string()))?;
        if identity.enc_public_key != enc_key || identity.sign_public_key != sign_key {
            return Err(ServerError::AuthFailed("keys do not match identity".to_string()));
        }
        if identity.is_banned() {
            return Err(ServerError::UserBanned);
        }
        return Ok((identity, false));
    }

    if let Some(identity) = db.find_identity_by_keys(&enc_key, &sign_key)? {
        if identity.is_banned() {
            return Err(ServerError::UserBanned);
        }
        return Ok((identity, false));
    }

    for _ in 0..ID_GENERATION_ATTEMPTS {
        let now = Utc::now();
        let identity = Identity {
            whisper_id: generate_whisper_id(),
            enc_public_key: enc_key,
            sign_public_key: sign_key,
            status: IdentityStatus::Active,
            created_at: now,
            updated_at: now,
        };
        match db.insert_identity(&identity) {
            Ok(()) => return Ok((identity, true)),
            // Either an id collision (retry) or a concurrent registration of
            // the same keys (recover it).
            Err(StoreError::Conflict) => {
                if let Some(existing) = db.find_identity_by_keys(&enc_key, &sign_key)? {
                    return Ok((existing, false));
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ServerError::Internal("could not allocate a whisper id".to_string()))
}
