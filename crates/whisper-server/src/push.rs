//! Content-free wake pushes.
//!
//! A wake tells a device to reconnect and fetch; it never carries message
//! data. Wakes are skipped while the identity is connected, coalesced per
//! `(identity, reason)` for a short window, and dropped outright if the
//! payload would contain a forbidden field.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use whisper_shared::constants::FORBIDDEN_PUSH_FIELDS;
use whisper_shared::types::{Platform, PushReason};

use crate::connections::ConnectionManager;
use crate::db::DbHandle;
use crate::ephemeral::{keys, EphemeralStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPriority {
    Normal,
    High,
}

/// One notification handed to a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct PushNotification {
    pub whisper_id: String,
    pub platform: Platform,
    pub token: String,
    /// The token is an iOS PushKit (VoIP) token.
    pub voip: bool,
    pub priority: PushPriority,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// The provider rejected the token as invalid or unregistered.
    InvalidToken,
    Failed(String),
}

/// Delivery backend for wake notifications.
pub trait PushProvider: Send + Sync {
    fn send(&self, notification: PushNotification) -> BoxFuture<'_, PushOutcome>;
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Posts wakes to an HTTP push gateway, FCM-style for Android and with
/// APNs-style headers for iOS.
pub struct GatewayProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl GatewayProvider {
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    fn request(&self, n: &PushNotification) -> reqwest::RequestBuilder {
        let req = match n.platform {
            Platform::Android => {
                let priority = match n.priority {
                    PushPriority::High => "high",
                    PushPriority::Normal => "normal",
                };
                self.http.post(format!("{}/fcm/send", self.base_url)).json(&json!({
                    "message": {
                        "token": n.token,
                        "android": { "priority": priority },
                        "data": n.body,
                    }
                }))
            }
            Platform::Ios => {
                let (push_type, priority) = match (n.voip, n.priority) {
                    (true, _) => ("voip", "10"),
                    (false, PushPriority::High) => ("alert", "10"),
                    (false, PushPriority::Normal) => ("background", "5"),
                };
                self.http
                    .post(format!("{}/apns/{}", self.base_url, n.token))
                    .header("apns-push-type", push_type)
                    .header("apns-priority", priority)
                    .json(&json!({
                        "aps": { "content-available": 1 },
                        "wake": n.body,
                    }))
            }
        };
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

impl PushProvider for GatewayProvider {
    fn send(&self, notification: PushNotification) -> BoxFuture<'_, PushOutcome> {
        Box::pin(async move {
            let response = match self.request(&notification).send().await {
                Ok(r) => r,
                Err(e) => return PushOutcome::Failed(e.to_string()),
            };
            let status = response.status();
            if status.is_success() {
                PushOutcome::Delivered
            } else if status == reqwest::StatusCode::NOT_FOUND
                || status == reqwest::StatusCode::GONE
            {
                PushOutcome::InvalidToken
            } else {
                PushOutcome::Failed(format!("gateway answered {status}"))
            }
        })
    }
}

/// Used when no gateway is configured.
pub struct LogProvider;

impl PushProvider for LogProvider {
    fn send(&self, notification: PushNotification) -> BoxFuture<'_, PushOutcome> {
        Box::pin(async move {
            debug!(
                whisper_id = %notification.whisper_id,
                platform = %notification.platform,
                priority = ?notification.priority,
                "Wake push (no gateway configured)"
            );
            PushOutcome::Delivered
        })
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Why a wake was or was not sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeResult {
    Sent,
    Online,
    Suppressed,
    NoToken,
    Rejected,
    InvalidToken,
    Failed,
}

pub struct PushService {
    db: DbHandle,
    kv: Arc<EphemeralStore>,
    connections: Arc<ConnectionManager>,
    provider: Arc<dyn PushProvider>,
    suppress_for: Duration,
}

impl PushService {
    pub fn new(
        db: DbHandle,
        kv: Arc<EphemeralStore>,
        connections: Arc<ConnectionManager>,
        provider: Arc<dyn PushProvider>,
        suppress_for: Duration,
    ) -> Self {
        Self {
            db,
            kv,
            connections,
            provider,
            suppress_for,
        }
    }

    /// Fire a wake in a detached task; failures are only logged.
    pub fn spawn_wake(self: &Arc<Self>, whisper_id: String, reason: PushReason) {
        let service = self.clone();
        tokio::spawn(async move {
            service.send_wake(&whisper_id, reason, None).await;
        });
    }

    pub async fn send_wake(
        &self,
        whisper_id: &str,
        reason: PushReason,
        hint: Option<&str>,
    ) -> WakeResult {
        if self.connections.is_online(whisper_id).await {
            return WakeResult::Online;
        }

        let suppress_key = keys::push_suppress(whisper_id, reason);
        if self.kv.get(&suppress_key).is_some() {
            debug!(whisper_id, reason = reason.as_str(), "Wake coalesced");
            return WakeResult::Suppressed;
        }

        let wid = whisper_id.to_string();
        let device = match self.db.call(move |db| Ok(db.get_device(&wid)?)).await {
            Ok(Some(device)) => device,
            Ok(None) => return WakeResult::NoToken,
            Err(e) => {
                e.log("push.lookup");
                return WakeResult::Failed;
            }
        };

        let use_voip = reason == PushReason::Call && device.platform == Platform::Ios;
        let (token, voip) = match (use_voip, &device.voip_token, &device.push_token) {
            (true, Some(voip), _) => (voip.clone(), true),
            (_, _, Some(push)) => (push.clone(), false),
            _ => return WakeResult::NoToken,
        };

        let body = wake_body(whisper_id, reason, hint);
        if contains_forbidden_field(&body) {
            warn!(whisper_id, "Wake payload rejected: forbidden field");
            return WakeResult::Rejected;
        }

        // Claim the window before dispatch so concurrent wakes coalesce.
        if !self
            .kv
            .set_nx(&suppress_key, "1".to_string(), self.suppress_for)
        {
            return WakeResult::Suppressed;
        }

        let notification = PushNotification {
            whisper_id: whisper_id.to_string(),
            platform: device.platform,
            token: token.clone(),
            voip,
            priority: if reason.is_time_sensitive() {
                PushPriority::High
            } else {
                PushPriority::Normal
            },
            body,
        };

        match self.provider.send(notification).await {
            PushOutcome::Delivered => {
                info!(whisper_id, reason = reason.as_str(), "Wake sent");
                WakeResult::Sent
            }
            PushOutcome::InvalidToken => {
                warn!(whisper_id, "Push token rejected by provider, clearing it");
                let wid = whisper_id.to_string();
                if let Err(e) = self
                    .db
                    .call(move |db| Ok(db.clear_invalid_token(&wid, &token)?))
                    .await
                {
                    e.log("push.clear_token");
                }
                WakeResult::InvalidToken
            }
            PushOutcome::Failed(error) => {
                warn!(whisper_id, error = %error, "Wake delivery failed");
                WakeResult::Failed
            }
        }
    }
}

fn wake_body(whisper_id: &str, reason: PushReason, hint: Option<&str>) -> Value {
    let mut body = json!({
        "type": "wake",
        "reason": reason.as_str(),
        "whisperId": whisper_id,
    });
    if let (Some(hint), Some(obj)) = (hint, body.as_object_mut()) {
        obj.insert("hint".to_string(), Value::String(hint.to_string()));
    }
    body
}

/// Recursively look for keys that could leak message data.
pub fn contains_forbidden_field(value: &Value) -> bool {
    match value {
        Value::Object(map) => map
            .iter()
            .any(|(k, v)| FORBIDDEN_PUSH_FIELDS.contains(&k.as_str()) || contains_forbidden_field(v)),
        Value::Array(items) => items.iter().any(contains_forbidden_field),
        _ => false,
    }
}
