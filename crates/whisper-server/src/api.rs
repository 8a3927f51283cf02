use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, Method},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use whisper_shared::constants::{CRYPTO_VERSION, MAX_BACKUP_SIZE, PROTOCOL_VERSION};
use whisper_shared::crypto::encode_b64;
use whisper_store::Database;

use crate::attachments::{AttachmentService, BlobStore};
use crate::auth::AuthService;
use crate::config::ServerConfig;
use crate::connections::ConnectionManager;
use crate::db::DbHandle;
use crate::ephemeral::EphemeralStore;
use crate::error::{Result, ServerError};
use crate::groups::GroupService;
use crate::push::{PushProvider, PushService};
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::router::MessageRouter;
use crate::sessions::{Session, SessionStore};
use crate::ws::ws_handler;

/// Headroom on top of the attachment cap for multipart framing.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub db: DbHandle,
    pub kv: Arc<EphemeralStore>,
    pub connections: Arc<ConnectionManager>,
    pub auth: Arc<AuthService>,
    pub router: Arc<MessageRouter>,
    pub groups: Arc<GroupService>,
    pub attachments: Arc<AttachmentService>,
    pub rate_limiter: RateLimiter,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every service around one database and one ephemeral store.
    pub async fn build(
        config: ServerConfig,
        db: Database,
        provider: Arc<dyn PushProvider>,
    ) -> Result<Self> {
        let db = DbHandle::new(db);
        let kv = Arc::new(EphemeralStore::new());
        let connections = Arc::new(ConnectionManager::new(kv.clone(), config.heartbeat_interval));

        let blobs = BlobStore::new(config.blob_storage_path.clone()).await?;
        let attachments = Arc::new(AttachmentService::new(
            blobs,
            db.clone(),
            config.max_attachment_size,
        ));
        let push = Arc::new(PushService::new(
            db.clone(),
            kv.clone(),
            connections.clone(),
            provider,
            config.push_suppress,
        ));
        let sessions = SessionStore::new(kv.clone(), config.session_ttl);
        let auth = Arc::new(AuthService::new(
            db.clone(),
            kv.clone(),
            sessions,
            connections.clone(),
            attachments.clone(),
        ));
        let router = Arc::new(MessageRouter::new(
            db.clone(),
            kv.clone(),
            connections.clone(),
            push,
            attachments.clone(),
            config.pending_ttl,
        ));
        let groups = Arc::new(GroupService::new(
            db.clone(),
            connections.clone(),
            router.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            db,
            kv,
            connections,
            auth,
            router,
            groups,
            attachments,
            rate_limiter: RateLimiter::new(),
            started_at: Instant::now(),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);
    let body_limit = usize::try_from(state.config.max_attachment_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/users/:whisper_id/keys", get(user_keys))
        .route(
            "/backup/contacts",
            put(backup_upload).get(backup_download).delete(backup_delete),
        )
        .route("/attachments/upload", post(attachment_upload))
        .route("/attachments/*object_key", get(attachment_download))
        .route("/account", delete(account_delete))
        .route("/admin/status", get(admin_status))
        .route("/admin/audit", get(admin_audit))
        .route("/admin/ban", post(admin_ban))
        .route("/admin/unban", post(admin_unban))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    protocol_version: u32,
    crypto_version: u32,
    max_attachment_size: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserKeysResponse {
    whisper_id: String,
    enc_public_key: String,
    sign_public_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BackupStoredResponse {
    stored: bool,
    size_bytes: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    object_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminStatusResponse {
    name: String,
    uptime_secs: u64,
    connections: usize,
    authenticated: usize,
    identities: i64,
    ephemeral_keys: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdminBanRequest {
    whisper_id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct AuditQuery {
    #[serde(default)]
    limit: Option<u32>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        protocol_version: PROTOCOL_VERSION,
        crypto_version: CRYPTO_VERSION,
        max_attachment_size: state.attachments.max_size(),
    })
}

/// Resolve `Authorization: Bearer <session token>` to a live session.
fn require_session(headers: &HeaderMap, state: &AppState) -> Result<Session> {
    let token = bearer(headers)
        .ok_or_else(|| ServerError::AuthFailed("missing bearer token".to_string()))?;
    state
        .auth
        .validate_session(token)
        .ok_or_else(|| ServerError::AuthFailed("invalid session".to_string()))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

async fn user_keys(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(whisper_id): Path<String>,
) -> Result<Json<UserKeysResponse>> {
    require_session(&headers, &state)?;
    let identity = state
        .db
        .call(move |db| Ok(db.find_identity(&whisper_id)?))
        .await?
        .filter(|i| !i.is_banned())
        .ok_or_else(|| ServerError::NotFound("identity".to_string()))?;

    Ok(Json(UserKeysResponse {
        whisper_id: identity.whisper_id,
        enc_public_key: encode_b64(&identity.enc_public_key),
        sign_public_key: encode_b64(&identity.sign_public_key),
    }))
}

// ─── Contact backup ───

/// Store the caller's encrypted contact backup, replacing any previous one.
async fn backup_upload(
    headers: HeaderMap,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<BackupStoredResponse>> {
    let session = require_session(&headers, &state)?;
    if body.is_empty() {
        return Err(ServerError::InvalidPayload("empty backup".to_string()));
    }
    if body.len() > MAX_BACKUP_SIZE {
        return Err(ServerError::TooLarge {
            size: body.len() as u64,
            max: MAX_BACKUP_SIZE as u64,
        });
    }

    let size = body.len();
    let wid = session.whisper_id.clone();
    state
        .db
        .call(move |db| Ok(db.put_backup(&wid, &body, Utc::now())?))
        .await?;

    info!(whisper_id = %session.whisper_id, size, "Contact backup stored");
    Ok(Json(BackupStoredResponse {
        stored: true,
        size_bytes: size,
    }))
}

async fn backup_download(headers: HeaderMap, State(state): State<AppState>) -> Result<Vec<u8>> {
    let session = require_session(&headers, &state)?;
    let backup = state
        .db
        .call(move |db| Ok(db.get_backup(&session.whisper_id)?))
        .await?
        .ok_or_else(|| ServerError::NotFound("no backup stored".to_string()))?;
    Ok(backup.data)
}

async fn backup_delete(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>> {
    let session = require_session(&headers, &state)?;
    let deleted = state
        .db
        .call(move |db| Ok(db.delete_backup(&session.whisper_id)?))
        .await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

// ─── Attachments ───

async fn attachment_upload(
    headers: HeaderMap,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>> {
    let session = require_session(&headers, &state)?;

    let mut data = None;
    let mut content_type = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::InvalidPayload(format!("Multipart error: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServerError::InvalidPayload(format!("Failed to read field: {e}")))?;
                data = Some(bytes);
            }
            "contentType" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServerError::InvalidPayload(format!("Failed to read field: {e}")))?;
                content_type = Some(text);
            }
            _ => {}
        }
    }

    let data = data.ok_or_else(|| {
        ServerError::InvalidPayload("Missing 'file' field in multipart form".to_string())
    })?;
    let content_type = content_type.ok_or_else(|| {
        ServerError::InvalidPayload("Missing 'contentType' field in multipart form".to_string())
    })?;

    let object_key = state
        .attachments
        .upload(&session.whisper_id, content_type.trim(), &data)
        .await?;
    Ok(Json(UploadResponse { object_key }))
}

async fn attachment_download(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(object_key): Path<String>,
) -> Result<Response> {
    let session = require_session(&headers, &state)?;
    let (record, data) = state
        .attachments
        .download(&object_key, &session.whisper_id)
        .await?;
    Ok(([(header::CONTENT_TYPE, record.content_type)], data).into_response())
}

// ─── Account ───

async fn account_delete(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>> {
    let token = bearer(&headers)
        .ok_or_else(|| ServerError::AuthFailed("missing bearer token".to_string()))?;
    state.auth.delete_account(token, None).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

// ─── Admin ───

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<()> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let token = bearer(headers).unwrap_or("");

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

async fn admin_status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<AdminStatusResponse>> {
    verify_admin_token(&headers, &state.config)?;

    let (connections, authenticated) = state.connections.count().await;
    let identities = state.db.call(|db| Ok(db.count_identities()?)).await?;
    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        connections,
        authenticated,
        identities,
        ephemeral_keys: state.kv.len(),
    }))
}

async fn admin_audit(
    headers: HeaderMap,
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<whisper_store::AuditEvent>>> {
    verify_admin_token(&headers, &state.config)?;
    let limit = query.limit.unwrap_or(100).min(1000);
    let events = state.db.call(move |db| Ok(db.list_audit(limit)?)).await?;
    Ok(Json(events))
}

async fn admin_ban(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AdminBanRequest>,
) -> Result<Json<serde_json::Value>> {
    verify_admin_token(&headers, &state.config)?;
    let reason = req.reason.as_deref().unwrap_or("admin");
    state.auth.ban(&req.whisper_id, reason).await?;
    info!(whisper_id = %req.whisper_id, "Admin banned identity");
    Ok(Json(serde_json::json!({ "banned": true })))
}

async fn admin_unban(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AdminBanRequest>,
) -> Result<Json<serde_json::Value>> {
    verify_admin_token(&headers, &state.config)?;
    state.auth.unban(&req.whisper_id).await?;
    info!(whisper_id = %req.whisper_id, "Admin unbanned identity");
    Ok(Json(serde_json::json!({ "unbanned": true })))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP and WebSocket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::test_support::TestServer;

    async fn call(server: &TestServer, req: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = build_router(server.state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body.to_vec())
    }

    fn authed(method: Method, uri: &str, token: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_info() {
        let server = TestServer::new().await;
        let (status, body) = call(&server, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("\"ok\""));

        let (status, body) = call(&server, Request::get("/info").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        let info: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(info["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_http_rate_limit_per_forwarded_ip() {
        let server = TestServer::new().await;
        let health = || {
            Request::get("/health")
                .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
                .body(Body::empty())
                .unwrap()
        };
        for _ in 0..30 {
            let (status, _) = call(&server, health()).await;
            assert_eq!(status, StatusCode::OK);
        }
        // Refill during the burst may let a few more through.
        let mut denied = None;
        for _ in 0..20 {
            let (status, body) = call(&server, health()).await;
            if status == StatusCode::TOO_MANY_REQUESTS {
                denied = Some(body);
                break;
            }
        }
        let body = denied.expect("burst should be cut off");
        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(err["code"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn test_backup_lifecycle() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let token = alice.session.session_token.as_str();

        let (status, _) = call(&server, authed(Method::GET, "/backup/contacts", token, Body::empty())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &server,
            authed(Method::PUT, "/backup/contacts", token, Body::from(vec![1u8, 2, 3])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&server, authed(Method::GET, "/backup/contacts", token, Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, vec![1u8, 2, 3]);

        let (status, body) = call(
            &server,
            authed(Method::PUT, "/backup/contacts", token, Body::from(vec![0u8; MAX_BACKUP_SIZE + 1])),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(err["code"], "INVALID_PAYLOAD");

        let (status, _) = call(&server, authed(Method::DELETE, "/backup/contacts", token, Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_session_required() {
        let server = TestServer::new().await;
        let (status, body) = call(
            &server,
            Request::get("/backup/contacts").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(err["code"], "AUTH_FAILED");
    }

    #[tokio::test]
    async fn test_user_keys() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let bob = server.register().await;

        let uri = format!("/users/{}/keys", bob.whisper_id);
        let (status, body) = call(
            &server,
            authed(Method::GET, &uri, &alice.session.session_token, Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let keys: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(keys["signPublicKey"], bob.keys.sign_public_key_b64());
    }

    #[tokio::test]
    async fn test_attachment_upload_and_download() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let bob = server.register().await;

        let boundary = "XBOUNDARYX";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"contentType\"\r\n\r\nimage/png\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"sealed-bytes");
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let req = Request::post("/attachments/upload")
            .header(header::AUTHORIZATION, format!("Bearer {}", alice.session.session_token))
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap();
        let (status, body) = call(&server, req).await;
        assert_eq!(status, StatusCode::OK);
        let uploaded: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let key = uploaded["objectKey"].as_str().unwrap().to_string();

        let uri = format!("/attachments/{key}");
        let (status, body) = call(
            &server,
            authed(Method::GET, &uri, &alice.session.session_token, Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"sealed-bytes");

        let (status, _) = call(
            &server,
            authed(Method::GET, &uri, &bob.session.session_token, Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let server = TestServer::new().await;
        let alice = server.register().await;

        let (status, _) = call(
            &server,
            authed(Method::GET, "/admin/status", "wrong", Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(
            &server,
            authed(Method::GET, "/admin/status", TestServer::ADMIN_TOKEN, Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["identities"], 1);

        let ban = serde_json::json!({ "whisperId": alice.whisper_id, "reason": "spam" });
        let req = Request::post("/admin/ban")
            .header(header::AUTHORIZATION, format!("Bearer {}", TestServer::ADMIN_TOKEN))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(ban.to_string()))
            .unwrap();
        let (status, _) = call(&server, req).await;
        assert_eq!(status, StatusCode::OK);
        assert!(server.state.auth.validate_session(&alice.session.session_token).is_none());
    }

    #[tokio::test]
    async fn test_account_delete_over_http() {
        let server = TestServer::new().await;
        let alice = server.register().await;
        let (status, _) = call(
            &server,
            authed(Method::DELETE, "/account", &alice.session.session_token, Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &server,
            authed(Method::DELETE, "/account", &alice.session.session_token, Body::empty()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
