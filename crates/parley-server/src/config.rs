//! Server configuration.
//!
//! Loading flow:
//! 1. Start with [`ServerConfig::default()`]
//! 2. If a JSON config file is given and exists, deep-merge it over defaults
//! 3. Apply `PARLEY_*` environment variable overrides
//!
//! CLI flags are applied by the binary on top of the result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::session::SessionConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Outbound frames buffered per connection before pushes are dropped.
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
    /// Close a connection that has been silent this long.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Allowed CORS origin; `None` allows any.
    pub cors_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5001,
            db_path: parley_home().join("parley.db"),
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 10 * 1024 * 1024,
            cors_origin: None,
        }
    }
}

impl ServerConfig {
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            max_send_queue: self.max_send_queue,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue("heartbeat_interval_secs must be > 0".into()));
        }
        if self.heartbeat_timeout_secs < self.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue(
                "heartbeat_timeout_secs must be >= heartbeat_interval_secs".into(),
            ));
        }
        if self.max_send_queue == 0 {
            return Err(ConfigError::InvalidValue("max_send_queue must be > 0".into()));
        }
        Ok(())
    }
}

/// `~/.parley`, or `/tmp/.parley` without a home directory.
pub fn parley_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley")
}

/// Load configuration from an optional JSON file plus environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, anything else is replaced by `source`, and null
/// values in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PARLEY_*` overrides. Invalid or out-of-range values are ignored
/// with a warning.
pub fn apply_env_overrides(config: &mut ServerConfig) {
    apply_overrides(config, |name| std::env::var(name).ok());
}

fn apply_overrides(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let ranged = |name: &str, min: u64, max: u64| -> Option<u64> {
        let val = lookup(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    };

    if let Some(v) = string("PARLEY_HOST") {
        config.host = v;
    }
    if let Some(v) = ranged("PARLEY_PORT", 1, u64::from(u16::MAX)) {
        config.port = v as u16;
    }
    if let Some(v) = string("PARLEY_DB_PATH") {
        config.db_path = PathBuf::from(v);
    }
    if let Some(v) = ranged("PARLEY_MAX_SEND_QUEUE", 1, 65_536) {
        config.max_send_queue = v as usize;
    }
    if let Some(v) = ranged("PARLEY_HEARTBEAT_INTERVAL", 1, 3_600) {
        config.heartbeat_interval_secs = v;
    }
    if let Some(v) = ranged("PARLEY_HEARTBEAT_TIMEOUT", 1, 86_400) {
        config.heartbeat_timeout_secs = v;
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
