use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::ServerError;

/// Rate-limited operations, each with its own budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    RegisterBegin,
    RegisterProof,
    SendMessage,
    GroupSendMessage,
    GroupCreate,
    GroupUpdate,
    FetchPending,
    /// Any HTTP request (per-IP middleware).
    Http,
}

impl Action {
    /// `(tokens per second, burst capacity)`
    fn budget(&self) -> (f64, f64) {
        match self {
            Action::RegisterBegin | Action::RegisterProof => (0.5, 10.0),
            Action::SendMessage => (10.0, 60.0),
            Action::GroupSendMessage => (5.0, 30.0),
            Action::GroupCreate => (0.1, 5.0),
            Action::GroupUpdate => (1.0, 20.0),
            Action::FetchPending => (2.0, 20.0),
            Action::Http => (10.0, 30.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Subject {
    Ip(IpAddr),
    User(String),
}

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Unix ms at which the bucket is full again (allowed) or the next token
    /// becomes available (denied).
    pub reset_at: i64,
}

/// Classic token bucket; refilled lazily on every check.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn take(&mut self, rate: f64, capacity: f64) -> bool {
        let now = Instant::now();
        let refill = now.duration_since(self.last_refill).as_secs_f64() * rate;
        self.tokens = (self.tokens + refill).min(capacity);
        self.last_refill = now;

        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }
        allowed
    }
}

#[derive(Clone, Default)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<(Subject, Action), TokenBucket>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn check_user(&self, whisper_id: &str, action: Action) -> RateDecision {
        self.check(Subject::User(whisper_id.to_string()), action).await
    }

    pub async fn check_ip(&self, ip: IpAddr, action: Action) -> RateDecision {
        self.check(Subject::Ip(ip), action).await
    }

    async fn check(&self, subject: Subject, action: Action) -> RateDecision {
        let (rate, capacity) = action.budget();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry((subject, action))
            .or_insert_with(|| TokenBucket::full(capacity));
        let allowed = bucket.take(rate, capacity);

        let wait_secs = if allowed {
            (capacity - bucket.tokens) / rate
        } else {
            (1.0 - bucket.tokens) / rate
        };
        RateDecision {
            allowed,
            remaining: bucket.tokens.floor() as u32,
            reset_at: Utc::now().timestamp_millis() + (wait_secs * 1000.0).ceil() as i64,
        }
    }

    pub async fn purge_stale(&self, max_idle_secs: f64) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, bucket| {
            now.duration_since(bucket.last_refill).as_secs_f64() < max_idle_secs
        });
    }
}

/// Per-IP budget for every HTTP request. Requests whose peer address is
/// unknown pass through.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ServerError> {
    if let Some(ip) = client_ip(&req) {
        let decision = limiter.check_ip(ip, Action::Http).await;
        if !decision.allowed {
            warn!(ip = %ip, reset_at = decision.reset_at, "HTTP rate limit exceeded");
            return Err(ServerError::RateLimited);
        }
    }
    Ok(next.run(req).await)
}

/// Socket peer first, then the first `X-Forwarded-For` hop, then `X-Real-IP`.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip());
    }
    let header_ip = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };
    header_ip("x-forwarded-for").or_else(|| header_ip("x-real-ip"))
}
