//! Environment-driven configuration.
//!
//! Loaded once at process start through the `config` crate layered over
//! environment variables (prefix `RELAY_`), then handed around as
//! `Arc<Config>`.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Raw, directly-deserializable shape; durations arrive as seconds.
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    database_resource: String,
    #[serde(default = "default_token_checkpoint_threshold")]
    token_checkpoint_threshold: u64,
    #[serde(default = "default_max_message_limit")]
    max_message_limit: usize,
    checkpoint_function_id: String,
    title_function_id: String,
    #[serde(default = "default_host")]
    default_host: String,
    session_security_scope: String,
    #[serde(default = "default_gc_interval_secs")]
    gc_interval_secs: u64,
    delegation_func_id: String,
    encryption_key: String,
    #[serde(default = "default_session_inactivity_secs")]
    session_inactivity_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    shutdown_grace_secs: u64,
    #[serde(default = "default_cancel_timeout_secs")]
    cancel_timeout_secs: u64,
    #[serde(default = "default_max_sessions_per_user")]
    max_sessions_per_user: usize,
}

fn default_token_checkpoint_threshold() -> u64 {
    8_000
}
fn default_max_message_limit() -> usize {
    2_500
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_gc_interval_secs() -> u64 {
    300
}
fn default_session_inactivity_secs() -> u64 {
    1_800
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_cancel_timeout_secs() -> u64 {
    5
}
fn default_max_sessions_per_user() -> usize {
    300
}

/// Process-wide configuration. Cheap to clone (wrap in `Arc` at the call
/// site); all fields are immutable after [`Config::load`].
#[derive(Debug, Clone)]
pub struct Config {
    pub database_resource: String,
    pub token_checkpoint_threshold: u64,
    pub max_message_limit: usize,
    pub checkpoint_function_id: String,
    pub title_function_id: String,
    pub default_host: String,
    pub session_security_scope: String,
    pub gc_interval: Duration,
    pub delegation_func_id: String,
    pub encryption_key: String,
    pub session_inactivity: Duration,
    pub shutdown_grace: Duration,
    pub cancel_timeout: Duration,
    pub max_sessions_per_user: usize,
}

impl Config {
    /// Load from environment variables prefixed `RELAY_` (e.g.
    /// `RELAY_DATABASE_RESOURCE`, `RELAY_MAX_SESSIONS_PER_USER`).
    pub fn load() -> Result<Self, ConfigError> {
        let raw: RawConfig = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if ![16usize * 2, 24 * 2, 32 * 2].contains(&raw.encryption_key.len()) {
            return Err(ConfigError::Invalid(format!(
                "encryption_key must hex-encode a 16/24/32-byte key, got {} hex chars",
                raw.encryption_key.len()
            )));
        }
        if raw.max_message_limit == 0 {
            return Err(ConfigError::Invalid(
                "max_message_limit must be positive".to_string(),
            ));
        }
        if raw.max_sessions_per_user == 0 {
            return Err(ConfigError::Invalid(
                "max_sessions_per_user must be positive".to_string(),
            ));
        }

        Ok(Config {
            database_resource: raw.database_resource,
            token_checkpoint_threshold: raw.token_checkpoint_threshold,
            max_message_limit: raw.max_message_limit,
            checkpoint_function_id: raw.checkpoint_function_id,
            title_function_id: raw.title_function_id,
            default_host: raw.default_host,
            session_security_scope: raw.session_security_scope,
            gc_interval: Duration::from_secs(raw.gc_interval_secs),
            delegation_func_id: raw.delegation_func_id,
            encryption_key: raw.encryption_key,
            session_inactivity: Duration::from_secs(raw.session_inactivity_secs),
            shutdown_grace: Duration::from_secs(raw.shutdown_grace_secs),
            cancel_timeout: Duration::from_secs(raw.cancel_timeout_secs),
            max_sessions_per_user: raw.max_sessions_per_user,
        })
    }

    /// A config suitable for tests: in-memory backend, short timers.
    #[cfg(any(test, feature = "test-support"))]
    pub fn for_tests() -> Self {
        Config {
            database_resource: "memory".to_string(),
            token_checkpoint_threshold: 8_000,
            max_message_limit: 2_500,
            checkpoint_function_id: "checkpoint".to_string(),
            title_function_id: "title".to_string(),
            default_host: "127.0.0.1".to_string(),
            session_security_scope: "test".to_string(),
            gc_interval: Duration::from_secs(300),
            delegation_func_id: "delegate".to_string(),
            encryption_key: "ab".repeat(32),
            session_inactivity: Duration::from_secs(1_800),
            shutdown_grace: Duration::from_millis(50),
            cancel_timeout: Duration::from_secs(5),
            max_sessions_per_user: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_key_length() {
        let mut raw_defaults = RawConfig {
            database_resource: "memory".to_string(),
            token_checkpoint_threshold: 1,
            max_message_limit: 1,
            checkpoint_function_id: "c".to_string(),
            title_function_id: "t".to_string(),
            default_host: "h".to_string(),
            session_security_scope: "s".to_string(),
            gc_interval_secs: 1,
            delegation_func_id: "d".to_string(),
            encryption_key: "ab".to_string(),
            session_inactivity_secs: 1,
            shutdown_grace_secs: 1,
            cancel_timeout_secs: 1,
            max_sessions_per_user: 1,
        };
        assert!(Config::from_raw(raw_defaults.clone()).is_err());
        raw_defaults.encryption_key = "ab".repeat(32);
        assert!(Config::from_raw(raw_defaults).is_ok());
    }
}
