//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{APP_NAME, DEFAULT_HTTP_PORT, DEFAULT_MAX_TEXT_LEN};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: PathBuf,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Parley"`
    pub instance_name: String,

    /// Whether offline recipients get push notifications. When disabled,
    /// pushes are only logged.
    /// Env: `PUSH_ENABLED` (true/false)
    /// Default: `true`
    pub push_enabled: bool,

    /// Timeout for a single push delivery attempt.
    /// Env: `PUSH_TIMEOUT_SECS`
    /// Default: `10`
    pub push_timeout: Duration,

    /// Maximum message text length in characters.
    /// Env: `MAX_TEXT_LEN`
    /// Default: `4000`
    pub max_text_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./parley.db"),
            instance_name: APP_NAME.to_string(),
            push_enabled: true,
            push_timeout: Duration::from_secs(10),
            max_text_len: DEFAULT_MAX_TEXT_LEN,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
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
            if !path.is_empty() {
                config.database_path = PathBuf::from(path);
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(val) = lookup("PUSH_ENABLED") {
            config.push_enabled = val != "false" && val != "0";
        }

        if let Some(val) = lookup("PUSH_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.push_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid PUSH_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(val) = lookup("MAX_TEXT_LEN") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_text_len = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_TEXT_LEN, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert!(config.push_enabled);
        assert_eq!(config.max_text_len, DEFAULT_MAX_TEXT_LEN);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("DATABASE_PATH", "/tmp/chat.db"),
            ("PUSH_ENABLED", "0"),
            ("PUSH_TIMEOUT_SECS", "3"),
            ("MAX_TEXT_LEN", "280"),
        ]));

        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.database_path, PathBuf::from("/tmp/chat.db"));
        assert!(!config.push_enabled);
        assert_eq!(config.push_timeout, Duration::from_secs(3));
        assert_eq!(config.max_text_len, 280);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "not an address"),
            ("PUSH_TIMEOUT_SECS", "soon"),
            ("MAX_TEXT_LEN", "0"),
        ]));

        assert_eq!(config.http_addr, ServerConfig::default().http_addr);
        assert_eq!(config.push_timeout, Duration::from_secs(10));
        assert_eq!(config.max_text_len, DEFAULT_MAX_TEXT_LEN);
    }
}
