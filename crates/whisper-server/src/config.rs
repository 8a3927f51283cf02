//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use whisper_shared::constants::{
    HEARTBEAT_INTERVAL_SECS, MAX_ATTACHMENT_SIZE, PENDING_TTL_SECS, PUSH_SUPPRESS_SECS,
    SESSION_TTL_SECS,
};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP and WebSocket listener.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./whisper.db`
    pub database_path: PathBuf,

    /// Filesystem path where encrypted attachments are stored.
    /// Env: `BLOB_STORAGE_PATH`
    /// Default: `./blobs`
    pub blob_storage_path: PathBuf,

    /// Maximum attachment size in bytes.
    /// Env: `MAX_ATTACHMENT_SIZE`
    /// Default: 100 MiB
    pub max_attachment_size: u64,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Push gateway base URL. Wakes are only logged when unset.
    /// Env: `PUSH_GATEWAY_URL`
    pub push_gateway_url: Option<String>,

    /// Bearer key sent to the push gateway.
    /// Env: `PUSH_GATEWAY_KEY`
    pub push_gateway_key: Option<String>,

    /// Env: `HEARTBEAT_INTERVAL_SECS`
    pub heartbeat_interval: Duration,

    /// Env: `SESSION_TTL_SECS`
    pub session_ttl: Duration,

    /// Retention of queued messages, refreshed on every append.
    /// Env: `PENDING_TTL_SECS`
    pub pending_ttl: Duration,

    /// Window in which repeated wakes for the same reason are coalesced.
    /// Env: `PUSH_SUPPRESS_SECS`
    pub push_suppress: Duration,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("blob_storage_path", &self.blob_storage_path)
            .field("max_attachment_size", &self.max_attachment_size)
            .field("instance_name", &self.instance_name)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("push_gateway_url", &self.push_gateway_url)
            .field("push_gateway_key", &self.push_gateway_key.as_ref().map(|_| "<redacted>"))
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("session_ttl", &self.session_ttl)
            .field("pending_ttl", &self.pending_ttl)
            .field("push_suppress", &self.push_suppress)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: PathBuf::from("./whisper.db"),
            blob_storage_path: PathBuf::from("./blobs"),
            max_attachment_size: MAX_ATTACHMENT_SIZE,
            instance_name: "Whisper Node".to_string(),
            admin_token: None,
            push_gateway_url: None,
            push_gateway_key: None,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            session_ttl: Duration::from_secs(SESSION_TTL_SECS),
            pending_ttl: Duration::from_secs(PENDING_TTL_SECS),
            push_suppress: Duration::from_secs(PUSH_SUPPRESS_SECS),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("BLOB_STORAGE_PATH") {
            config.blob_storage_path = PathBuf::from(path);
        }

        if let Some(val) = lookup("MAX_ATTACHMENT_SIZE") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.max_attachment_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_ATTACHMENT_SIZE, using default"),
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        config.admin_token = lookup("ADMIN_TOKEN").filter(|t| !t.is_empty());
        config.push_gateway_url = lookup("PUSH_GATEWAY_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty());
        config.push_gateway_key = lookup("PUSH_GATEWAY_KEY").filter(|k| !k.is_empty());

        if let Some(d) = secs(&lookup, "HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval = d;
        }
        if let Some(d) = secs(&lookup, "SESSION_TTL_SECS") {
            config.session_ttl = d;
        }
        if let Some(d) = secs(&lookup, "PENDING_TTL_SECS") {
            config.pending_ttl = d;
        }
        if let Some(d) = secs(&lookup, "PUSH_SUPPRESS_SECS") {
            config.push_suppress = d;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

/// Parse a positive number of seconds, warning on garbage.
fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let val = lookup(key)?;
    match val.parse::<u64>() {
        Ok(n) if n > 0 => Some(Duration::from_secs(n)),
        _ => {
            tracing::warn!(key, value = %val, "Invalid duration, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_map(pairs: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.max_attachment_size, 100 * 1024 * 1024);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("ADMIN_TOKEN", "secret"),
            ("PUSH_GATEWAY_URL", "https://push.example/"),
            ("HEARTBEAT_INTERVAL_SECS", "10"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.admin_token.as_deref(), Some("secret"));
        assert_eq!(config.push_gateway_url.as_deref(), Some("https://push.example"));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = from_map(&[
            ("HTTP_ADDR", "not-an-addr"),
            ("SESSION_TTL_SECS", "-5"),
            ("ADMIN_TOKEN", ""),
        ]);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.session_ttl, Duration::from_secs(SESSION_TTL_SECS));
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = from_map(&[("ADMIN_TOKEN", "hunter2"), ("PUSH_GATEWAY_KEY", "k")]);
        let printed = format!("{config:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }
}
