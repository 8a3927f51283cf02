//! WebSocket endpoint (`GET /ws`).
//!
//! Each socket runs a reader loop and a writer task joined by a bounded
//! channel. The reader decodes one frame at a time and dispatches it; replies,
//! pushed envelopes and pings all go through the same channel so the writer
//! is the only task touching the sink.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use whisper_shared::constants::MAX_PRESENCE_QUERY;
use whisper_shared::protocol::{
    decode_client_frame, ClientMessage, DecodedFrame, PongPayload, PresenceResultPayload,
    ServerMessage, SuccessPayload,
};
use whisper_shared::ErrorCode;

use crate::api::AppState;
use crate::connections::{AuthInfo, Outbound, OUTBOUND_BUFFER};
use crate::error::{Result, ServerError};
use crate::rate_limit::Action;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, Some(addr.ip())))
}

async fn handle_socket(socket: WebSocket, state: AppState, ip: Option<IpAddr>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let (conn_id, shutdown) = state.connections.create(tx.clone(), ip).await;

    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let msg = match out {
                Outbound::Frame(text) => Message::Text(text),
                Outbound::Ping => Message::Ping(Vec::new()),
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    loop {
        let next = tokio::select! {
            _ = shutdown.notified() => break,
            msg = stream.next() => msg,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                state.connections.touch(conn_id).await;
                if let Some(reply) = dispatch(&state, conn_id, &text).await {
                    if tx.send(Outbound::Frame(reply)).await.is_err() {
                        break;
                    }
                }
            }
            Some(Ok(Message::Binary(_))) => {
                state.connections.touch(conn_id).await;
                let reply = ServerMessage::error(ErrorCode::InvalidPayload, "text frames only");
                if tx.send(Outbound::Frame(reply.to_frame(None))).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                state.connections.touch(conn_id).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(conn = %conn_id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    state.connections.remove(conn_id, "socket closed").await;
    drop(tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(conn = %conn_id, "Writer did not drain in time");
    }
}

/// Handle one inbound text frame. Returns the encoded reply, if any.
pub(crate) async fn dispatch(state: &AppState, conn_id: Uuid, text: &str) -> Option<String> {
    let DecodedFrame {
        request_id,
        message,
    } = decode_client_frame(text);
    let request_id = request_id.as_deref();

    let message = match message {
        Ok(message) => message,
        Err(e) => {
            let err = ServerError::from(e);
            err.log("ws.decode");
            return Some(error_frame(&err, request_id));
        }
    };

    let kind = message.kind();
    match handle(state, conn_id, message, request_id).await {
        Ok(Some(reply)) => Some(reply.to_frame(request_id)),
        Ok(None) => None,
        Err(e) => {
            e.log(kind);
            Some(error_frame(&e, request_id))
        }
    }
}

fn error_frame(err: &ServerError, request_id: Option<&str>) -> String {
    ServerMessage::error(err.code(), err.client_message()).to_frame(request_id)
}

async fn handle(
    state: &AppState,
    conn_id: Uuid,
    message: ClientMessage,
    request_id: Option<&str>,
) -> Result<Option<ServerMessage>> {
    let auth = if message.is_public() {
        None
    } else {
        Some(authorize(state, conn_id, &message).await?)
    };
    check_rate(state, conn_id, &message, auth.as_ref()).await?;

    let Some(auth) = auth else {
        return match message {
            ClientMessage::RegisterBegin(p) => {
                let challenge = state.auth.register_begin(&p).await?;
                Ok(Some(ServerMessage::RegisterChallenge(challenge)))
            }
            ClientMessage::RegisterProof(p) => {
                let (session, ack) = state.auth.register_proof(&p).await?;
                state.connections.authenticate(conn_id, &session).await;
                Ok(Some(ServerMessage::RegisterAck(ack)))
            }
            ClientMessage::Ping(p) => Ok(Some(ServerMessage::Pong(PongPayload {
                timestamp: p.timestamp,
                server_time: Utc::now().timestamp_millis(),
            }))),
            other => Err(ServerError::Internal(format!(
                "{} reached the public path",
                other.kind()
            ))),
        };
    };

    let me = auth.whisper_id.as_str();
    let reply = match message {
        ClientMessage::SessionRefresh(_) => {
            let (session, ack) = state.auth.refresh_session(&auth.session_token)?;
            state
                .connections
                .rebind_token(conn_id, &session.session_token)
                .await;
            Some(ServerMessage::SessionRefreshAck(ack))
        }
        ClientMessage::Logout(_) => {
            state.auth.logout(&auth.session_token).await?;
            let ack = ServerMessage::LogoutAck(SuccessPayload { success: true });
            state
                .connections
                .kick_user(me, Some(ack.to_frame(request_id)))
                .await;
            info!(conn = %conn_id, whisper_id = me, "Connection closed after logout");
            None
        }
        ClientMessage::UpdateTokens(p) => {
            state
                .auth
                .update_tokens(me, p.push_token, p.voip_token)
                .await?;
            Some(ServerMessage::TokensUpdated(SuccessPayload { success: true }))
        }
        ClientMessage::SendMessage(p) => Some(ServerMessage::MessageAccepted(
            state.router.route_message(me, &p).await?,
        )),
        ClientMessage::DeliveryReceipt(p) => {
            state.router.handle_receipt(me, &p).await?;
            None
        }
        ClientMessage::FetchPending(p) => Some(ServerMessage::PendingMessages(
            state
                .router
                .fetch_pending(me, p.cursor.as_deref(), p.limit),
        )),
        ClientMessage::GroupCreate(p) => Some(ServerMessage::GroupEvent(
            state.groups.create_group(me, &p).await?,
        )),
        ClientMessage::GroupUpdate(p) => Some(ServerMessage::GroupEvent(
            state.groups.update_group(me, &p).await?,
        )),
        ClientMessage::GroupSendMessage(p) => Some(ServerMessage::MessageAccepted(
            state.groups.send_group_message(me, &p).await?,
        )),
        ClientMessage::Typing(p) => {
            state.router.forward_typing(me, &p).await;
            None
        }
        ClientMessage::PresenceUpdate(p) => {
            if p.whisper_ids.len() > MAX_PRESENCE_QUERY {
                return Err(ServerError::InvalidPayload(format!(
                    "at most {MAX_PRESENCE_QUERY} ids per query"
                )));
            }
            Some(ServerMessage::PresenceUpdate(PresenceResultPayload {
                entries: state.connections.presence(&p.whisper_ids).await,
            }))
        }
        ClientMessage::DeleteAccount(_) => {
            // The notice doubles as the reply; the socket closes right after.
            let notice = ServerMessage::AccountDeleted(SuccessPayload { success: true });
            state
                .auth
                .delete_account(&auth.session_token, Some(notice.to_frame(request_id)))
                .await?;
            None
        }
        ClientMessage::RegisterBegin(_) | ClientMessage::RegisterProof(_) | ClientMessage::Ping(_) => {
            return Err(ServerError::Internal("public frame on the private path".to_string()))
        }
    };
    Ok(reply)
}

/// The connection must be bound to a session that is still the active one,
/// and a token echoed in the payload must be that session's.
async fn authorize(state: &AppState, conn_id: Uuid, message: &ClientMessage) -> Result<AuthInfo> {
    let auth = state
        .connections
        .auth_info(conn_id)
        .await
        .ok_or_else(|| ServerError::AuthFailed("not authenticated".to_string()))?;
    if state.auth.validate_session(&auth.session_token).is_none() {
        return Err(ServerError::AuthFailed("session expired or revoked".to_string()));
    }
    if let Some(token) = message.session_token() {
        if token != auth.session_token {
            return Err(ServerError::AuthFailed("session token mismatch".to_string()));
        }
    }
    Ok(auth)
}

async fn check_rate(
    state: &AppState,
    conn_id: Uuid,
    message: &ClientMessage,
    auth: Option<&AuthInfo>,
) -> Result<()> {
    let action = match message {
        ClientMessage::RegisterBegin(_) => Action::RegisterBegin,
        ClientMessage::RegisterProof(_) => Action::RegisterProof,
        ClientMessage::SendMessage(_) => Action::SendMessage,
        ClientMessage::GroupSendMessage(_) => Action::GroupSendMessage,
        ClientMessage::GroupCreate(_) => Action::GroupCreate,
        ClientMessage::GroupUpdate(_) => Action::GroupUpdate,
        ClientMessage::FetchPending(_) => Action::FetchPending,
        _ => return Ok(()),
    };

    let decision = match auth {
        Some(auth) => state.rate_limiter.check_user(&auth.whisper_id, action).await,
        None => match state.connections.peer_ip(conn_id).await {
            Some(ip) => state.rate_limiter.check_ip(ip, action).await,
            None => return Ok(()),
        },
    };
    if !decision.allowed {
        return Err(ServerError::RateLimited);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use whisper_shared::crypto::decode_b64;

    use super::*;
    use crate::test_support::{drain, envelope, TestServer};

    async fn open(server: &TestServer) -> (Uuid, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (conn, _) = server
            .state
            .connections
            .create(tx, Some("10.0.0.1".parse().unwrap()))
            .await;
        (conn, rx)
    }

    async fn send(server: &TestServer, conn: Uuid, frame: serde_json::Value) -> Option<(Option<String>, ServerMessage)> {
        dispatch(&server.state, conn, &frame.to_string())
            .await
            .map(|text| ServerMessage::from_frame(&text).unwrap())
    }

    fn code(reply: Option<(Option<String>, ServerMessage)>) -> ErrorCode {
        match reply {
            Some((_, ServerMessage::Error(e))) => e.code,
            other => panic!("expected an error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_over_the_socket() {
        let server = TestServer::new().await;
        let client = whisper_shared::identity::ClientIdentity::generate();
        let (conn, _rx) = open(&server).await;

        let reply = send(
            &server,
            conn,
            json!({
                "type": "register_begin",
                "requestId": "r-1",
                "payload": { "deviceId": "dev-1", "platform": "android" }
            }),
        )
        .await;
        let Some((Some(rid), ServerMessage::RegisterChallenge(challenge))) = reply else {
            panic!("expected a challenge");
        };
        assert_eq!(rid, "r-1");

        let signature = client.sign_challenge(&decode_b64("c", &challenge.challenge).unwrap());
        let reply = send(
            &server,
            conn,
            json!({
                "type": "register_proof",
                "requestId": "r-2",
                "payload": {
                    "challengeId": challenge.challenge_id,
                    "deviceId": "dev-1",
                    "platform": "android",
                    "encPublicKey": client.enc_public_key_b64(),
                    "signPublicKey": client.sign_public_key_b64(),
                    "signature": signature,
                }
            }),
        )
        .await;
        let Some((_, ServerMessage::RegisterAck(ack))) = reply else {
            panic!("expected an ack");
        };
        assert!(server.state.connections.is_online(&ack.whisper_id).await);

        let reply = send(
            &server,
            conn,
            json!({ "type": "fetch_pending", "payload": { "sessionToken": ack.session_token } }),
        )
        .await;
        assert!(matches!(reply, Some((None, ServerMessage::PendingMessages(_)))));
    }

    #[tokio::test]
    async fn test_private_frames_require_authentication() {
        let server = TestServer::new().await;
        let (conn, _rx) = open(&server).await;

        let reply = send(
            &server,
            conn,
            json!({ "type": "fetch_pending", "requestId": "r-9", "payload": {} }),
        )
        .await;
        assert!(matches!(&reply, Some((Some(rid), _)) if rid == "r-9"));
        assert_eq!(code(reply), ErrorCode::AuthFailed);

        let reply = send(&server, conn, json!({ "type": "ping", "payload": { "timestamp": 5 } })).await;
        assert!(matches!(reply, Some((None, ServerMessage::Pong(p))) if p.timestamp == Some(5)));
    }

    #[tokio::test]
    async fn test_malformed_frames_are_invalid_payload() {
        let server = TestServer::new().await;
        let (conn, _rx) = open(&server).await;

        let reply = dispatch(&server.state, conn, "not json").await.unwrap();
        let (_, msg) = ServerMessage::from_frame(&reply).unwrap();
        assert!(matches!(msg, ServerMessage::Error(e) if e.code == ErrorCode::InvalidPayload));

        let reply = send(
            &server,
            conn,
            json!({ "type": "teleport", "requestId": "r-1", "payload": {} }),
        )
        .await;
        assert_eq!(code(reply), ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn test_token_mismatch_and_revoked_session() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let (conn, _rx) = server.connect(&alice).await;

        let reply = send(
            &server,
            conn,
            json!({ "type": "fetch_pending", "payload": { "sessionToken": "someone-else" } }),
        )
        .await;
        assert_eq!(code(reply), ErrorCode::AuthFailed);

        server.state.auth.ban(&alice.whisper_id, "abuse").await.unwrap();
        assert!(!server.state.connections.is_online(&alice.whisper_id).await);
        let reply = send(&server, conn, json!({ "type": "fetch_pending", "payload": {} })).await;
        assert_eq!(code(reply), ErrorCode::AuthFailed);
    }

    #[tokio::test]
    async fn test_send_message_frame_round_trip() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let bob = server.register().await;
        let (conn, _rx) = server.connect(&alice).await;
        let (_bob_conn, mut bob_rx) = server.connect(&bob).await;

        let p = envelope(&alice, &bob.whisper_id, "m-1");
        let mut frame = json!({ "type": "send_message", "requestId": "r-1" });
        frame["payload"] = serde_json::to_value(&p).unwrap();
        let reply = send(&server, conn, frame).await;
        assert!(matches!(
            reply,
            Some((Some(_), ServerMessage::MessageAccepted(a))) if a.message_id == "m-1"
        ));
        assert_eq!(drain(&mut bob_rx).len(), 1);

        let reply = send(
            &server,
            conn,
            json!({ "type": "typing", "payload": { "to": bob.whisper_id, "isTyping": true } }),
        )
        .await;
        assert!(reply.is_none());
        assert!(matches!(
            &drain(&mut bob_rx)[..],
            [ServerMessage::Typing(t)] if t.from == alice.whisper_id && t.is_typing
        ));
    }

    #[tokio::test]
    async fn test_presence_query() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let bob = server.register().await;
        let (conn, _rx) = server.connect(&alice).await;

        let reply = send(
            &server,
            conn,
            json!({
                "type": "presence_update",
                "payload": { "whisperIds": [alice.whisper_id, bob.whisper_id] }
            }),
        )
        .await;
        let Some((_, ServerMessage::PresenceUpdate(result))) = reply else {
            panic!("expected presence");
        };
        assert!(result.entries[0].online);
        assert!(result.entries[0].last_seen.is_some());
        assert!(!result.entries[1].online);

        let too_many: Vec<String> = (0..=MAX_PRESENCE_QUERY).map(|i| format!("id-{i}")).collect();
        let reply = send(
            &server,
            conn,
            json!({ "type": "presence_update", "payload": { "whisperIds": too_many } }),
        )
        .await;
        assert_eq!(code(reply), ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn test_delete_account_notice_then_close() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let (conn, mut rx) = server.connect(&alice).await;

        let reply = send(
            &server,
            conn,
            json!({ "type": "delete_account", "requestId": "r-del", "payload": {} }),
        )
        .await;
        assert!(reply.is_none());

        let first = rx.try_recv().unwrap();
        let Outbound::Frame(text) = first else {
            panic!("expected the notice first");
        };
        let (rid, msg) = ServerMessage::from_frame(&text).unwrap();
        assert_eq!(rid.as_deref(), Some("r-del"));
        assert!(matches!(msg, ServerMessage::AccountDeleted(_)));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);

        let wid = alice.whisper_id.clone();
        let gone = server
            .state
            .db
            .call(move |db| Ok(db.find_identity(&wid)?))
            .await
            .unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_register_is_rate_limited_per_ip() {
        let server = TestServer::new().await;
        let (conn, _rx) = open(&server).await;
        let begin = json!({
            "type": "register_begin",
            "payload": { "deviceId": "dev-1", "platform": "ios" }
        });
        for _ in 0..10 {
            let reply = send(&server, conn, begin.clone()).await;
            assert!(matches!(reply, Some((_, ServerMessage::RegisterChallenge(_)))));
        }
        assert_eq!(code(send(&server, conn, begin).await), ErrorCode::RateLimited);
    }
}
