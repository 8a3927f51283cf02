//! One-to-one envelope routing, delivery receipts and the pending queue.
//!
//! The server never opens an envelope. It checks the outer fields, verifies
//! the sender's signature over the canonical form and either hands the
//! envelope to the recipient's live connection or queues it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use whisper_shared::constants::{DEDUP_TTL_SECS, PENDING_PAGE_DEFAULT, PENDING_PAGE_MAX};
use whisper_shared::crypto::{canonical_message, verify_prehashed};
use whisper_shared::protocol::{
    AttachmentPointer, DeliveryReceiptPayload, MessageAcceptedPayload, MessageDeliveredPayload,
    PendingMessagesPayload, ReceivedMessage, SendMessagePayload, ServerMessage, TypingNotifyPayload,
    TypingPayload,
};
use whisper_shared::types::{PushReason, ReceiptStatus};
use whisper_shared::validation::{
    check_timestamp, validate_attachment, validate_ciphertext, validate_client_id, validate_nonce,
    validate_signature,
};

use crate::attachments::AttachmentService;
use crate::connections::ConnectionManager;
use crate::db::DbHandle;
use crate::ephemeral::{keys, EphemeralStore};
use crate::error::{Result, ServerError};
use crate::push::PushService;

/// Where an envelope ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Online,
    Queued,
}

pub struct MessageRouter {
    db: DbHandle,
    kv: Arc<EphemeralStore>,
    connections: Arc<ConnectionManager>,
    push: Arc<PushService>,
    attachments: Arc<AttachmentService>,
    pending_ttl: Duration,
}

impl MessageRouter {
    pub fn new(
        db: DbHandle,
        kv: Arc<EphemeralStore>,
        connections: Arc<ConnectionManager>,
        push: Arc<PushService>,
        attachments: Arc<AttachmentService>,
        pending_ttl: Duration,
    ) -> Self {
        Self {
            db,
            kv,
            connections,
            push,
            attachments,
            pending_ttl,
        }
    }

    /// Validate, deduplicate, verify and deliver one envelope.
    ///
    /// A resend of an already accepted `(from, messageId)` gets the same
    /// acknowledgment and is not delivered again.
    pub async fn route_message(
        &self,
        sender: &str,
        p: &SendMessagePayload,
    ) -> Result<MessageAcceptedPayload> {
        if p.from != sender {
            return Err(ServerError::Forbidden("from does not match session".to_string()));
        }
        check_timestamp(p.timestamp, Utc::now().timestamp_millis())?;
        validate_client_id("messageId", &p.message_id)?;
        validate_nonce("nonce", &p.nonce)?;
        validate_ciphertext(&p.ciphertext)?;
        let signature = validate_signature("sig", &p.sig)?;
        self.check_attachment(sender, p.attachment.as_ref()).await?;

        let from = p.from.clone();
        let to = p.to.clone();
        let (sign_key, recipient_active) = self
            .db
            .call(move |db| {
                let sender = db
                    .find_identity(&from)?
                    .ok_or_else(|| ServerError::AuthFailed("unknown sender".to_string()))?;
                let recipient_active = db.find_identity(&to)?.is_some_and(|r| !r.is_banned());
                Ok((sender.sign_public_key, recipient_active))
            })
            .await?;
        if !recipient_active {
            return Err(ServerError::NotFound("recipient".to_string()));
        }

        let accepted = MessageAcceptedPayload {
            message_id: p.message_id.clone(),
            status: "sent".to_string(),
        };
        if !self.claim(sender, &p.message_id) {
            debug!(from = sender, message_id = %p.message_id, "Duplicate envelope acknowledged");
            return Ok(accepted);
        }

        let canonical = canonical_message(
            "send_message",
            &p.message_id,
            &p.from,
            &p.to,
            p.timestamp,
            &p.nonce,
            &p.ciphertext,
        );
        if verify_prehashed(&sign_key, canonical.as_bytes(), &signature).is_err() {
            self.release(sender, &p.message_id);
            warn!(from = sender, message_id = %p.message_id, "Envelope signature rejected");
            return Err(ServerError::AuthFailed("bad signature".to_string()));
        }

        let delivery = match self.deliver_envelope(p).await {
            Ok(delivery) => delivery,
            Err(e) => {
                // Not acknowledged, so a retry must get through.
                self.release(sender, &p.message_id);
                return Err(e);
            }
        };
        debug!(from = sender, to = %p.to, message_id = %p.message_id, ?delivery, "Envelope routed");
        Ok(accepted)
    }

    async fn deliver_envelope(&self, p: &SendMessagePayload) -> Result<Delivery> {
        if let Some(attachment) = &p.attachment {
            self.attachments
                .grant_access(&attachment.object_key, &p.to)
                .await?;
        }

        let message = ReceivedMessage {
            message_id: p.message_id.clone(),
            group_id: None,
            from: p.from.clone(),
            to: p.to.clone(),
            msg_type: p.msg_type,
            timestamp: p.timestamp,
            nonce: p.nonce.clone(),
            ciphertext: p.ciphertext.clone(),
            sig: p.sig.clone(),
            reply_to: p.reply_to.clone(),
            reactions: p.reactions.clone(),
            attachment: p.attachment.clone(),
        };
        self.deliver_or_queue(message).await
    }

    /// Acknowledge a delivered or read envelope on behalf of its recipient.
    pub async fn handle_receipt(&self, sender: &str, p: &DeliveryReceiptPayload) -> Result<()> {
        if p.from != sender {
            return Err(ServerError::Forbidden("from does not match session".to_string()));
        }
        check_timestamp(p.timestamp, Utc::now().timestamp_millis())?;
        validate_client_id("messageId", &p.message_id)?;

        if p.status == ReceiptStatus::Delivered {
            let removed = self.kv.remove_first(&keys::pending(sender), |entry| {
                serde_json::from_str::<ReceivedMessage>(entry)
                    .is_ok_and(|m| m.message_id == p.message_id && m.from == p.to)
            });
            debug!(whisper_id = sender, message_id = %p.message_id, removed, "Delivery receipt");
        }

        let notice = ServerMessage::MessageDelivered(MessageDeliveredPayload {
            message_id: p.message_id.clone(),
            status: p.status,
            timestamp: p.timestamp,
            from: sender.to_string(),
        });
        self.connections.send_to_user(&p.to, &notice).await;
        Ok(())
    }

    /// Page through the caller's queue without removing anything.
    pub fn fetch_pending(
        &self,
        whisper_id: &str,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> PendingMessagesPayload {
        let queue: Vec<ReceivedMessage> = self
            .kv
            .range(&keys::pending(whisper_id))
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(m) => Some(m),
                Err(e) => {
                    warn!(whisper_id, error = %e, "Skipping undecodable queued envelope");
                    None
                }
            })
            .collect();

        let start = cursor
            .and_then(|c| queue.iter().position(|m| m.message_id == c))
            .map_or(0, |pos| pos + 1);
        let limit = limit.unwrap_or(PENDING_PAGE_DEFAULT).clamp(1, PENDING_PAGE_MAX);

        let messages: Vec<ReceivedMessage> = queue.iter().skip(start).take(limit).cloned().collect();
        let next_cursor = if start + messages.len() < queue.len() {
            messages.last().map(|m| m.message_id.clone())
        } else {
            None
        };
        PendingMessagesPayload {
            messages,
            next_cursor,
        }
    }

    /// Relay a typing indicator if the recipient is connected. Never queued.
    pub async fn forward_typing(&self, sender: &str, p: &TypingPayload) -> bool {
        let notice = ServerMessage::Typing(TypingNotifyPayload {
            from: sender.to_string(),
            is_typing: p.is_typing,
        });
        self.connections.send_to_user(&p.to, &notice).await
    }

    // ------------------------------------------------------------------
    // Shared with group fanout
    // ------------------------------------------------------------------

    pub(crate) fn attachments(&self) -> &AttachmentService {
        &self.attachments
    }

    /// Check an attachment pointer and that the sender may reference the
    /// object (its owner or a grantee, so forwarding works).
    pub(crate) async fn check_attachment(
        &self,
        sender: &str,
        attachment: Option<&AttachmentPointer>,
    ) -> Result<()> {
        let Some(pointer) = attachment else {
            return Ok(());
        };
        validate_attachment(pointer)?;
        if !self.attachments.exists(&pointer.object_key, sender).await? {
            return Err(ServerError::InvalidPayload("unknown attachment".to_string()));
        }
        Ok(())
    }

    /// Mark `(sender, messageId)` as processed. `false` if it already was.
    pub(crate) fn claim(&self, sender: &str, message_id: &str) -> bool {
        self.kv.set_nx(
            &keys::dedup(sender, message_id),
            "1".to_string(),
            Duration::from_secs(DEDUP_TTL_SECS),
        )
    }

    pub(crate) fn release(&self, sender: &str, message_id: &str) {
        self.kv.delete(&keys::dedup(sender, message_id));
    }

    /// Hand the envelope to the live connection, or queue it and wake the
    /// recipient when the queue was empty.
    pub(crate) async fn deliver_or_queue(&self, message: ReceivedMessage) -> Result<Delivery> {
        let entry = serde_json::to_string(&message)
            .map_err(|e| ServerError::Internal(format!("encode queued envelope: {e}")))?;
        let recipient = message.to.clone();
        if self
            .connections
            .send_to_user(&recipient, &ServerMessage::MessageReceived(message))
            .await
        {
            return Ok(Delivery::Online);
        }

        let len = self
            .kv
            .push(&keys::pending(&recipient), entry, self.pending_ttl);
        if len == 1 {
            self.push.spawn_wake(recipient, PushReason::Message);
        }
        Ok(Delivery::Queued)
    }
}
