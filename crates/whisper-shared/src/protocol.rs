//! WebSocket wire protocol.
//!
//! Every frame is a JSON object `{ "type": ..., "requestId": ..., "payload": {...} }`.
//! Client frames decode into the closed sum type [`ClientMessage`]; an unknown
//! `type` or a payload that does not fit the schema of its type is a
//! [`ProtocolError::MalformedFrame`]. Server frames are built from
//! [`ServerMessage`], echoing the `requestId` of the request they answer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, ProtocolError};
use crate::types::{GroupEventKind, MsgType, Platform, ReceiptStatus, Role};

// ---------------------------------------------------------------------------
// Shared payload pieces
// ---------------------------------------------------------------------------

/// Pointer to an encrypted blob held by the attachment service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPointer {
    pub object_key: String,
    pub content_type: String,
    pub ciphertext_size: u64,
    /// Nonce of the encrypted file body (base64)
    pub file_nonce: String,
    /// File key sealed for the recipient
    pub file_key_box: FileKeyBox,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileKeyBox {
    pub nonce: String,
    pub ciphertext: String,
}

/// Emoji -> list of whisper ids that reacted with it.
pub type Reactions = BTreeMap<String, Vec<String>>;

// ---------------------------------------------------------------------------
// Client -> server payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBeginPayload {
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub crypto_version: Option<u32>,
    pub device_id: String,
    pub platform: Platform,
    /// Present when the client wants to recover an existing identity.
    #[serde(default)]
    pub whisper_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterProofPayload {
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub crypto_version: Option<u32>,
    pub challenge_id: String,
    pub device_id: String,
    pub platform: Platform,
    #[serde(default)]
    pub whisper_id: Option<String>,
    pub enc_public_key: String,
    pub sign_public_key: String,
    pub signature: String,
    #[serde(default)]
    pub push_token: Option<String>,
    #[serde(default)]
    pub voip_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    #[serde(default)]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTokensPayload {
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub push_token: Option<String>,
    #[serde(default)]
    pub voip_token: Option<String>,
}

/// A direct-message envelope as sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    #[serde(default)]
    pub session_token: Option<String>,
    pub message_id: String,
    pub from: String,
    pub to: String,
    pub msg_type: MsgType,
    pub timestamp: i64,
    pub nonce: String,
    pub ciphertext: String,
    pub sig: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub reactions: Option<Reactions>,
    #[serde(default)]
    pub attachment: Option<AttachmentPointer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceiptPayload {
    #[serde(default)]
    pub session_token: Option<String>,
    pub message_id: String,
    /// The identity acknowledging (recipient of the original message).
    pub from: String,
    /// The original sender.
    pub to: String,
    pub status: ReceiptStatus,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchPendingPayload {
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCreatePayload {
    #[serde(default)]
    pub session_token: Option<String>,
    pub title: String,
    #[serde(default)]
    pub member_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleChange {
    pub whisper_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupUpdatePayload {
    #[serde(default)]
    pub session_token: Option<String>,
    pub group_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub add_members: Vec<String>,
    #[serde(default)]
    pub remove_members: Vec<String>,
    #[serde(default)]
    pub role_changes: Vec<RoleChange>,
}

/// One recipient's copy of a group message, encrypted pairwise by the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecipientEnvelope {
    pub to: String,
    pub nonce: String,
    pub ciphertext: String,
    pub sig: String,
    #[serde(default)]
    pub attachment: Option<AttachmentPointer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSendMessagePayload {
    #[serde(default)]
    pub session_token: Option<String>,
    pub group_id: String,
    pub message_id: String,
    pub from: String,
    pub msg_type: MsgType,
    pub timestamp: i64,
    pub recipients: Vec<GroupRecipientEnvelope>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub reactions: Option<Reactions>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    #[serde(default)]
    pub session_token: Option<String>,
    pub to: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceQueryPayload {
    #[serde(default)]
    pub session_token: Option<String>,
    pub whisper_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Every frame a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    RegisterBegin(RegisterBeginPayload),
    RegisterProof(RegisterProofPayload),
    SessionRefresh(SessionPayload),
    Logout(SessionPayload),
    UpdateTokens(UpdateTokensPayload),
    SendMessage(SendMessagePayload),
    DeliveryReceipt(DeliveryReceiptPayload),
    FetchPending(FetchPendingPayload),
    GroupCreate(GroupCreatePayload),
    GroupUpdate(GroupUpdatePayload),
    GroupSendMessage(GroupSendMessagePayload),
    Typing(TypingPayload),
    PresenceUpdate(PresenceQueryPayload),
    DeleteAccount(SessionPayload),
    Ping(PingPayload),
}

impl ClientMessage {
    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::RegisterBegin(_) => "register_begin",
            ClientMessage::RegisterProof(_) => "register_proof",
            ClientMessage::SessionRefresh(_) => "session_refresh",
            ClientMessage::Logout(_) => "logout",
            ClientMessage::UpdateTokens(_) => "update_tokens",
            ClientMessage::SendMessage(_) => "send_message",
            ClientMessage::DeliveryReceipt(_) => "delivery_receipt",
            ClientMessage::FetchPending(_) => "fetch_pending",
            ClientMessage::GroupCreate(_) => "group_create",
            ClientMessage::GroupUpdate(_) => "group_update",
            ClientMessage::GroupSendMessage(_) => "group_send_message",
            ClientMessage::Typing(_) => "typing",
            ClientMessage::PresenceUpdate(_) => "presence_update",
            ClientMessage::DeleteAccount(_) => "delete_account",
            ClientMessage::Ping(_) => "ping",
        }
    }

    /// Frames that may be sent before the connection is authenticated.
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            ClientMessage::RegisterBegin(_)
                | ClientMessage::RegisterProof(_)
                | ClientMessage::Ping(_)
        )
    }

    /// Session token echoed in the payload, if the client sent one.
    pub fn session_token(&self) -> Option<&str> {
        let token = match self {
            ClientMessage::SessionRefresh(p)
            | ClientMessage::Logout(p)
            | ClientMessage::DeleteAccount(p) => &p.session_token,
            ClientMessage::UpdateTokens(p) => &p.session_token,
            ClientMessage::SendMessage(p) => &p.session_token,
            ClientMessage::DeliveryReceipt(p) => &p.session_token,
            ClientMessage::FetchPending(p) => &p.session_token,
            ClientMessage::GroupCreate(p) => &p.session_token,
            ClientMessage::GroupUpdate(p) => &p.session_token,
            ClientMessage::GroupSendMessage(p) => &p.session_token,
            ClientMessage::Typing(p) => &p.session_token,
            ClientMessage::PresenceUpdate(p) => &p.session_token,
            ClientMessage::RegisterBegin(_)
            | ClientMessage::RegisterProof(_)
            | ClientMessage::Ping(_) => return None,
        };
        token.as_deref()
    }
}

/// Result of decoding one text frame. The request id is kept even when the
/// payload is rejected so the error frame can echo it.
#[derive(Debug)]
pub struct DecodedFrame {
    pub request_id: Option<String>,
    pub message: Result<ClientMessage, ProtocolError>,
}

/// Decode a client text frame.
pub fn decode_client_frame(text: &str) -> DecodedFrame {
    let mut value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            return DecodedFrame {
                request_id: None,
                message: Err(ProtocolError::MalformedFrame(e.to_string())),
            }
        }
    };

    let request_id = take_request_id(&mut value);
    let message = match value.as_object_mut() {
        Some(obj) => {
            obj.entry("payload")
                .or_insert_with(|| Value::Object(Default::default()));
            ClientMessage::deserialize(value)
                .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
        }
        None => Err(ProtocolError::MalformedFrame(
            "frame must be a JSON object".to_string(),
        )),
    };

    DecodedFrame {
        request_id,
        message,
    }
}

fn take_request_id(value: &mut Value) -> Option<String> {
    match value.as_object_mut()?.remove("requestId")? {
        Value::String(s) => Some(s),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Server -> client payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterChallengePayload {
    pub challenge_id: String,
    /// Random challenge bytes (base64)
    pub challenge: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAckPayload {
    pub success: bool,
    pub whisper_id: String,
    pub session_token: String,
    pub session_expires_at: i64,
    pub server_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRefreshAckPayload {
    pub session_token: String,
    pub session_expires_at: i64,
    pub server_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessPayload {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAcceptedPayload {
    pub message_id: String,
    pub status: String,
}

/// An envelope as handed to its recipient, live or from the pending queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub from: String,
    pub to: String,
    pub msg_type: MsgType,
    pub timestamp: i64,
    pub nonce: String,
    pub ciphertext: String,
    pub sig: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Reactions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentPointer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeliveredPayload {
    pub message_id: String,
    pub status: ReceiptStatus,
    pub timestamp: i64,
    /// The identity that acknowledged the message.
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessagesPayload {
    pub messages: Vec<ReceivedMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMemberView {
    pub whisper_id: String,
    pub role: Role,
    pub joined_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
    pub group_id: String,
    pub title: String,
    pub owner_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub members: Vec<GroupMemberView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupEventPayload {
    pub event: GroupEventKind,
    pub group: GroupView,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotifyPayload {
    pub from: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub whisper_id: String,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceResultPayload {
    pub entries: Vec<PresenceEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    pub server_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Every frame the server may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    RegisterChallenge(RegisterChallengePayload),
    RegisterAck(RegisterAckPayload),
    SessionRefreshAck(SessionRefreshAckPayload),
    LogoutAck(SuccessPayload),
    TokensUpdated(SuccessPayload),
    MessageAccepted(MessageAcceptedPayload),
    MessageReceived(ReceivedMessage),
    MessageDelivered(MessageDeliveredPayload),
    PendingMessages(PendingMessagesPayload),
    GroupEvent(GroupEventPayload),
    Typing(TypingNotifyPayload),
    PresenceUpdate(PresenceResultPayload),
    AccountDeleted(SuccessPayload),
    Pong(PongPayload),
    Error(ErrorPayload),
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }

    /// Encode as a text frame, echoing `request_id` when present.
    pub fn to_frame(&self, request_id: Option<&str>) -> String {
        let mut value = match serde_json::to_value(self) {
            Ok(v) => v,
            // Every payload is a plain struct of strings/numbers/maps.
            Err(e) => {
                return format!(
                    r#"{{"type":"error","payload":{{"code":"INTERNAL_ERROR","message":"{}"}}}}"#,
                    e.to_string().replace('"', "'")
                )
            }
        };
        if let (Some(id), Some(obj)) = (request_id, value.as_object_mut()) {
            obj.insert("requestId".to_string(), Value::String(id.to_string()));
        }
        value.to_string()
    }

    /// Decode a server frame (used by clients and tests).
    pub fn from_frame(text: &str) -> Result<(Option<String>, Self), ProtocolError> {
        let mut value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        let request_id = take_request_id(&mut value);
        let message = ServerMessage::deserialize(value)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        Ok((request_id, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_register_begin_with_request_id() {
        let frame = r#"{
            "type": "register_begin",
            "requestId": "r-1",
            "payload": { "deviceId": "dev-1", "platform": "ios", "protocolVersion": 1 }
        }"#;
        let decoded = decode_client_frame(frame);
        assert_eq!(decoded.request_id.as_deref(), Some("r-1"));
        match decoded.message.unwrap() {
            ClientMessage::RegisterBegin(p) => {
                assert_eq!(p.device_id, "dev-1");
                assert_eq!(p.platform, Platform::Ios);
                assert!(p.whisper_id.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected_but_keeps_request_id() {
        let decoded = decode_client_frame(r#"{"type":"teleport","requestId":"x","payload":{}}"#);
        assert_eq!(decoded.request_id.as_deref(), Some("x"));
        let err = decoded.message.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
    }

    #[test]
    fn test_missing_payload_defaults_to_empty_object() {
        let decoded = decode_client_frame(r#"{"type":"fetch_pending"}"#);
        match decoded.message.unwrap() {
            ClientMessage::FetchPending(p) => {
                assert!(p.cursor.is_none());
                assert!(p.limit.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_payload_schema_mismatch() {
        let decoded =
            decode_client_frame(r#"{"type":"send_message","payload":{"messageId":"m1"}}"#);
        assert!(decoded.message.is_err());

        let decoded = decode_client_frame("[1,2,3]");
        assert!(decoded.message.is_err());
    }

    #[test]
    fn test_server_frame_echoes_request_id() {
        let msg = ServerMessage::error(ErrorCode::Forbidden, "nope");
        let text = msg.to_frame(Some("req-9"));
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["requestId"], "req-9");
        assert_eq!(value["payload"]["code"], "FORBIDDEN");

        let (request_id, decoded) = ServerMessage::from_frame(&text).unwrap();
        assert_eq!(request_id.as_deref(), Some("req-9"));
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_session_token_accessor() {
        let decoded = decode_client_frame(
            r#"{"type":"typing","payload":{"sessionToken":"abc","to":"WSP-AAAA-BBBB-CCCC","isTyping":true}}"#,
        );
        let msg = decoded.message.unwrap();
        assert_eq!(msg.session_token(), Some("abc"));
        assert!(!msg.is_public());
        assert_eq!(msg.kind(), "typing");
    }
}
