//! # whisper-server
//!
//! Relay server for Whisper end-to-end encrypted messaging.
//!
//! This binary provides:
//! - **WebSocket endpoint** carrying the JSON frame protocol: registration,
//!   sessions, direct and group envelopes, receipts, typing and presence
//! - **Offline queue** with push wakes for recipients that are not connected
//! - **Encrypted attachment storage** (opaque ciphertext on disk)
//! - **REST API** (axum) for health, key lookup, contact backup, attachments
//!   and admin operations
//! - **Per-user and per-IP rate limiting**
//!
//! The server never sees plaintext. Envelopes are verified against the
//! sender's Ed25519 key and forwarded as-is.

mod api;
mod attachments;
mod auth;
mod config;
mod connections;
mod db;
mod ephemeral;
mod error;
mod groups;
mod push;
mod rate_limit;
mod router;
mod sessions;
mod ws;

#[cfg(test)]
mod test_support;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use whisper_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::push::{GatewayProvider, LogProvider, PushProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,whisper_server=debug")),
        )
        .init();

    info!("Starting Whisper relay server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(
        instance = %config.instance_name,
        admin_enabled = config.admin_token.is_some(),
        push_gateway = config.push_gateway_url.is_some(),
        "Instance settings"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;

    let provider: Arc<dyn PushProvider> = match config.push_gateway_url.clone() {
        Some(url) => Arc::new(GatewayProvider::new(url, config.push_gateway_key.clone())?),
        None => {
            info!("No push gateway configured, wakes will only be logged");
            Arc::new(LogProvider)
        }
    };

    let http_addr = config.http_addr;
    let app_state = AppState::build(config, db, provider).await?;

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Ping live sockets, evict the silent ones
    let connections = app_state.connections.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(connections.heartbeat_interval());
        loop {
            interval.tick().await;
            let report = connections.heartbeat().await;
            if report.evicted > 0 {
                info!(
                    pinged = report.pinged,
                    evicted = report.evicted,
                    "Heartbeat evicted stale connections"
                );
            }
        }
    });

    // Expired challenges, sessions, queues and dedup markers (every minute)
    let kv = app_state.kv.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let purged = kv.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "Purged expired ephemeral entries");
            }
        }
    });

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = app_state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP/WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
