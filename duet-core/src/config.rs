//! Application configuration management.
//!
//! Holds the API and broker endpoints, realtime reconnect/heartbeat tuning,
//! key bootstrap policy and logging settings. Persisted as TOML on disk.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{DuetError, DuetResult};
use crate::platform::Platform;

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// REST API and broker endpoints.
    #[serde(default)]
    pub server: ServerConfig,

    /// Realtime connection tuning.
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Key bootstrap policy and local key storage.
    #[serde(default)]
    pub e2ee: E2eeConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// REST API base URL (e.g., "https://api.example.com/api").
    #[serde(default)]
    pub api_base_url: String,

    /// STOMP WebSocket endpoint. Derived from `api_base_url` when empty.
    #[serde(default)]
    pub ws_url: String,

    /// API request timeout in milliseconds.
    #[serde(default = "default_api_timeout")]
    pub api_timeout_ms: u64,

    /// Accept self-signed certificates (development servers only).
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// Realtime client tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// First reconnect delay; doubles with every failed attempt.
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_delay_ms: u64,

    /// Reconnect attempts before giving up.
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Client heartbeat interval (0 disables).
    #[serde(default = "default_heartbeat_out")]
    pub heartbeat_outgoing_ms: u64,

    /// Requested broker heartbeat interval (0 disables liveness checks).
    #[serde(default = "default_heartbeat_in")]
    pub heartbeat_incoming_ms: u64,

    /// Time allowed for the transport plus STOMP handshake.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

/// Key bootstrap configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct E2eeConfig {
    /// RSA modulus size for the identity keypair.
    #[serde(default = "default_rsa_bits")]
    pub rsa_key_bits: usize,

    /// Polls for the partner's public key.
    #[serde(default = "default_partner_polls")]
    pub partner_key_poll_attempts: u32,

    /// Polls for this party's copy of the shared key.
    #[serde(default = "default_shared_polls")]
    pub shared_key_poll_attempts: u32,

    /// Fixed delay between polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Directory of the sealed key files. Empty means `<data_dir>/keys`.
    #[serde(default)]
    pub key_store_dir: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for log files. If empty, uses default location.
    #[serde(default)]
    pub directory: String,

    /// Enable JSON structured logging output.
    #[serde(default)]
    pub json_output: bool,
}

fn default_api_timeout() -> u64 {
    constants::DEFAULT_API_TIMEOUT_MS
}

fn default_reconnect_base() -> u64 {
    constants::reconnect::BASE_DELAY_MS
}

fn default_reconnect_attempts() -> u32 {
    constants::reconnect::MAX_ATTEMPTS
}

fn default_heartbeat_out() -> u64 {
    constants::heartbeat::OUTGOING_MS
}

fn default_heartbeat_in() -> u64 {
    constants::heartbeat::INCOMING_MS
}

fn default_connect_timeout() -> u64 {
    15_000
}

fn default_rsa_bits() -> usize {
    constants::e2ee::RSA_KEY_BITS
}

fn default_partner_polls() -> u32 {
    constants::e2ee::PARTNER_KEY_POLL_ATTEMPTS
}

fn default_shared_polls() -> u32 {
    constants::e2ee::SHARED_KEY_POLL_ATTEMPTS
}

fn default_poll_interval() -> u64 {
    constants::e2ee::POLL_INTERVAL_MS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            ws_url: String::new(),
            api_timeout_ms: default_api_timeout(),
            accept_invalid_certs: false,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: default_reconnect_base(),
            max_reconnect_attempts: default_reconnect_attempts(),
            heartbeat_outgoing_ms: default_heartbeat_out(),
            heartbeat_incoming_ms: default_heartbeat_in(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl Default for E2eeConfig {
    fn default() -> Self {
        Self {
            rsa_key_bits: default_rsa_bits(),
            partner_key_poll_attempts: default_partner_polls(),
            shared_key_poll_attempts: default_shared_polls(),
            poll_interval_ms: default_poll_interval(),
            key_store_dir: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: String::new(),
            json_output: false,
        }
    }
}

impl RealtimeConfig {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl E2eeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ServerConfig {
    /// The WebSocket endpoint, derived from the API base URL when unset.
    ///
    /// `https://host/api` becomes `wss://host/ws`.
    pub fn effective_ws_url(&self) -> DuetResult<String> {
        if !self.ws_url.is_empty() {
            return Ok(AppConfig::sanitize_url(&self.ws_url));
        }
        let api = AppConfig::sanitize_url(&self.api_base_url);
        if api.is_empty() {
            return Err(DuetError::MissingConfig("server.ws_url".into()));
        }
        let (scheme, rest) = match api.split_once("://") {
            Some(("https", rest)) => ("wss", rest),
            Some((_, rest)) => ("ws", rest),
            None => ("ws", api.as_str()),
        };
        let host = rest.split('/').next().unwrap_or(rest);
        Ok(format!("{scheme}://{host}/ws"))
    }
}

impl AppConfig {
    /// Load configuration from the default config file path.
    pub fn load_default() -> DuetResult<Self> {
        let path = Self::default_config_path()?;
        if path.exists() {
            Self::load_from_file(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &Path) -> DuetResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a specific file path.
    pub fn save_to_file(&self, path: &Path) -> DuetResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| DuetError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Default configuration file path.
    pub fn default_config_path() -> DuetResult<PathBuf> {
        Ok(Platform::config_dir()?.join("config.toml"))
    }

    /// Key store directory, using the configured path or the default.
    pub fn effective_key_store_dir(&self) -> DuetResult<PathBuf> {
        if self.e2ee.key_store_dir.is_empty() {
            Ok(Platform::data_dir()?.join("keys"))
        } else {
            Ok(PathBuf::from(&self.e2ee.key_store_dir))
        }
    }

    /// Log directory, using the configured path or the default.
    pub fn effective_log_dir(&self) -> DuetResult<PathBuf> {
        if self.logging.directory.is_empty() {
            Ok(Platform::data_dir()?.join("logs"))
        } else {
            Ok(PathBuf::from(&self.logging.directory))
        }
    }

    /// Trim quotes/whitespace and trailing slashes; default to https.
    pub fn sanitize_url(address: &str) -> String {
        let trimmed = address.trim().trim_matches('"').trim();
        if trimmed.is_empty() {
            return String::new();
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };

        with_scheme.trim_end_matches('/').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.realtime.reconnect_base_delay_ms, 1_000);
        assert_eq!(config.realtime.max_reconnect_attempts, 5);
        assert_eq!(config.e2ee.rsa_key_bits, 2048);
        assert_eq!(config.logging.level, "info");
        assert!(config.server.api_base_url.is_empty());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            api_base_url = "https://api.duet.example/api"

            [realtime]
            max_reconnect_attempts = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.realtime.max_reconnect_attempts, 8);
        assert_eq!(config.realtime.heartbeat_outgoing_ms, 10_000);
        assert_eq!(config.e2ee.partner_key_poll_attempts, 10);
    }

    #[test]
    fn test_sanitize_url() {
        assert_eq!(
            AppConfig::sanitize_url("  \"api.duet.example/api/\"  "),
            "https://api.duet.example/api"
        );
        assert_eq!(
            AppConfig::sanitize_url("http://10.0.2.2:8080/"),
            "http://10.0.2.2:8080"
        );
        assert_eq!(AppConfig::sanitize_url("   "), "");
    }

    #[test]
    fn test_ws_url_derived_from_api() {
        let server = ServerConfig {
            api_base_url: "https://api.duet.example/api".into(),
            ..ServerConfig::default()
        };
        assert_eq!(server.effective_ws_url().unwrap(), "wss://api.duet.example/ws");

        let local = ServerConfig {
            api_base_url: "http://10.0.2.2:8080/api".into(),
            ..ServerConfig::default()
        };
        assert_eq!(local.effective_ws_url().unwrap(), "ws://10.0.2.2:8080/ws");
    }

    #[test]
    fn test_ws_url_missing() {
        assert!(ServerConfig::default().effective_ws_url().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = AppConfig::default();
        config.e2ee.poll_interval_ms = 250;
        config.save_to_file(&path).unwrap();

        let loaded = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.e2ee.poll_interval_ms, 250);
    }
}
