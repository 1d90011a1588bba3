//! Configuration management for prefixd.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cidr::HostBits;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/prefixd/prefixd.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to SQLite database.
    pub path: PathBuf,

    /// Connection pool size.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/prefixd/prefixd.db"),
            max_connections: 5,
        }
    }
}

/// Allocation engine tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// What to do with prefixes that have host bits set.
    pub non_canonical: HostBits,

    /// `max_result` applied to searches that don't set one.
    pub default_max_result: usize,

    /// Upper bound on `count` for find-free.
    pub max_find_free_count: usize,

    /// Deadline for acquiring locks and planning a mutation (milliseconds).
    pub operation_timeout_ms: u64,

    /// Store conflict retries before giving up.
    pub conflict_retries: u32,

    /// Initial backoff between retries, doubled each attempt (milliseconds).
    pub retry_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            non_canonical: HostBits::Reject,
            default_max_result: 50,
            max_find_free_count: 1000,
            operation_timeout_ms: 10_000,
            conflict_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_result == 0 {
            return Err(ConfigError::ValidationError(
                "default_max_result must be at least 1".to_string(),
            ));
        }
        if self.max_find_free_count == 0 {
            return Err(ConfigError::ValidationError(
                "max_find_free_count must be at least 1".to_string(),
            ));
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "operation_timeout_ms must be positive".to_string(),
            ));
        }
        if self.conflict_retries > 16 {
            return Err(ConfigError::ValidationError(
                "conflict_retries must be at most 16".to_string(),
            ));
        }
        // Backoff doubles per retry; keep the last sleep within the deadline.
        let last_backoff = self
            .retry_backoff_ms
            .checked_shl(self.conflict_retries)
            .filter(|b| *b >> self.conflict_retries == self.retry_backoff_ms);
        match last_backoff {
            Some(b) if b <= self.operation_timeout_ms => Ok(()),
            _ => Err(ConfigError::ValidationError(
                "retry_backoff_ms doubled conflict_retries times exceeds operation_timeout_ms"
                    .to_string(),
            )),
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// API server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address.
    pub listen_host: String,

    /// Listen port.
    pub listen_port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 1337,
        }
    }
}

impl ApiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.listen_host, self.listen_port)
            .parse()
            .map_err(|_| ConfigError::ValidationError("Invalid listen address".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthBackendKind {
    Local,
    Directory,
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub backend: AuthBackendKind,

    /// Authoritative source stamped on changes made through the API.
    pub default_source: String,

    /// Directory group granting read-write access.
    pub rw_group: Option<String>,

    /// Directory group granting read-only access.
    pub ro_group: Option<String>,

    /// Directory group whose members may act on behalf of others.
    pub trusted_group: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backend: AuthBackendKind::Local,
            default_source: "prefixd".to_string(),
            rw_group: None,
            ro_group: None,
            trusted_group: None,
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_source.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "default_source must not be empty".to_string(),
            ));
        }
        if self.backend == AuthBackendKind::Directory
            && self.rw_group.is_none()
            && self.ro_group.is_none()
        {
            return Err(ConfigError::ValidationError(
                "directory backend needs rw_group or ro_group".to_string(),
            ));
        }
        Ok(())
    }
}

/// Main configuration container.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub api: ApiConfig,
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        self.engine.validate()?;
        self.api.socket_addr()?;
        self.auth.validate()?;
        Ok(())
    }
}

/// Load configuration from the default or specified path.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let config_path = path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
    Config::from_file(config_path)
}
