//! # Configuration Management Module
//!
//! All settings for the bridge live in one TOML file with four sections:
//!
//! - [`BridgeConfig`] - command prefix, reply ceiling, AI toggle, stats cadence
//! - [`MeshtasticConfig`] - how to reach the radio and how hard to retry
//! - [`OllamaConfig`] - model endpoint, retry policy and prompt options
//! - [`LoggingConfig`] - log level and optional log file
//!
//! Every field has a default, so a file only needs the values it changes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshai::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load("config.toml").await?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!     println!("Radio: {} {}", config.meshtastic.connection_type, config.meshtastic.port);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [bridge]
//! command_prefix = "/AI"
//! reply_byte_limit = 200
//!
//! [meshtastic]
//! connection_type = "serial"   # serial | tcp | console
//! port = ""                    # empty = first USB serial device
//! tcp_host = "192.168.1.50"
//!
//! [ollama]
//! url = "http://127.0.0.1:11434/api/generate"
//! model = "llama3.1"
//! ```
//!
//! ## Environment Integration
//!
//! A handful of values can be overridden with `MESHAI_*` variables (see
//! [`Config::apply_env_overrides`]). Precedence: CLI args > environment > file > defaults.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub meshtastic: MeshtasticConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Answer queries at all. When false messages are still logged and counted.
    pub ai_enabled: bool,
    /// Case-insensitive prefix that marks a message as a query.
    pub command_prefix: String,
    /// Maximum reply size in bytes, mention included.
    pub reply_byte_limit: usize,
    /// Seconds between stats log lines; 0 disables them.
    pub stats_interval_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ai_enabled: true,
            command_prefix: "/AI".to_string(),
            reply_byte_limit: 200, // ~30 bytes below the radio payload limit
            stats_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Serial,
    Tcp,
    /// stdin/stdout stand-in for a radio.
    Console,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionType::Serial => "serial",
            ConnectionType::Tcp => "tcp",
            ConnectionType::Console => "console",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshtasticConfig {
    pub connection_type: ConnectionType,
    /// Serial device path. Empty means auto-detect.
    pub port: String,
    pub baud_rate: u32,
    /// `host` or `host:port` (default port 4403).
    pub tcp_host: String,
    pub auto_reconnect: bool,
    pub reconnect_max_attempts: u32,
    pub reconnect_delay_secs: u64,
    /// Pause after a lost link before reopening the device.
    pub settle_delay_secs: u64,
    /// Upper bound for opening the device and finishing the radio handshake.
    pub open_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// Upper bound for closing a link, including at shutdown.
    pub close_timeout_secs: u64,
    /// Exit at startup instead of retrying in the background when no radio answers.
    pub require_device_at_startup: bool,
}

impl Default for MeshtasticConfig {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::Serial,
            port: String::new(),
            baud_rate: 115200,
            tcp_host: String::new(),
            auto_reconnect: true,
            reconnect_max_attempts: 3,
            reconnect_delay_secs: 5,
            settle_delay_secs: 2,
            open_timeout_secs: 15,
            health_check_interval_secs: 10,
            probe_timeout_secs: 5,
            close_timeout_secs: 5,
            require_device_at_startup: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    /// Full generate endpoint.
    pub url: String,
    pub model: String,
    pub retries: u32,
    pub retry_delay_secs: u64,
    pub timeout_secs: u64,
    pub temperature: f64,
    /// Prefix prompts with the local date and time.
    pub include_datetime: bool,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:11434/api/generate".to_string(),
            model: "llama3.1".to_string(),
            retries: 3,
            retry_delay_secs: 2,
            timeout_secs: 90,
            temperature: 0.7,
            include_datetime: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshai.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Load `path` when it exists, otherwise fall back to defaults.
    /// Returns the config and whether the file was found.
    pub async fn load_or_default(path: &str) -> Result<(Self, bool)> {
        if Path::new(path).exists() {
            Ok((Self::load(path).await?, true))
        } else {
            Ok((Self::default(), false))
        }
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Apply `MESHAI_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Override source is injectable so tests need not touch the process environment.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = get("MESHAI_OLLAMA_URL") {
            self.ollama.url = url;
        }
        if let Some(model) = get("MESHAI_MODEL") {
            self.ollama.model = model;
        }
        if let Some(prefix) = get("MESHAI_PREFIX") {
            self.bridge.command_prefix = prefix;
        }
        if let Some(port) = get("MESHAI_PORT") {
            self.meshtastic.port = port;
            self.meshtastic.connection_type = ConnectionType::Serial;
        }
        if let Some(host) = get("MESHAI_TCP_HOST") {
            self.meshtastic.tcp_host = host;
            self.meshtastic.connection_type = ConnectionType::Tcp;
        }
    }

    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.bridge.command_prefix.trim().is_empty() {
            return Err(anyhow!("bridge.command_prefix must not be empty"));
        }
        if self.bridge.reply_byte_limit < 16 {
            return Err(anyhow!(
                "bridge.reply_byte_limit must be at least 16 (got {})",
                self.bridge.reply_byte_limit
            ));
        }
        let m = &self.meshtastic;
        if m.reconnect_max_attempts == 0 {
            return Err(anyhow!("meshtastic.reconnect_max_attempts must be at least 1"));
        }
        if m.health_check_interval_secs == 0
            || m.probe_timeout_secs == 0
            || m.open_timeout_secs == 0
            || m.close_timeout_secs == 0
        {
            return Err(anyhow!(
                "meshtastic health_check_interval_secs, probe_timeout_secs, open_timeout_secs and close_timeout_secs must be non-zero"
            ));
        }
        if m.connection_type == ConnectionType::Tcp && m.tcp_host.trim().is_empty() {
            return Err(anyhow!("meshtastic.tcp_host is required when connection_type = \"tcp\""));
        }
        if self.ollama.retries == 0 {
            return Err(anyhow!("ollama.retries must be at least 1"));
        }
        if self.ollama.timeout_secs == 0 {
            return Err(anyhow!("ollama.timeout_secs must be non-zero"));
        }
        if !self.ollama.url.starts_with("http://") && !self.ollama.url.starts_with("https://") {
            return Err(anyhow!("ollama.url must be an http(s) URL (got {})", self.ollama.url));
        }
        self.logging
            .level
            .parse::<log::LevelFilter>()
            .map_err(|_| anyhow!("logging.level '{}' is not a valid log level", self.logging.level))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bridge.command_prefix, "/AI");
        assert_eq!(config.bridge.reply_byte_limit, 200);
        assert_eq!(config.meshtastic.health_check_interval_secs, 10);
        assert_eq!(config.ollama.timeout_secs, 90);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [meshtastic]
            connection_type = "tcp"
            tcp_host = "10.0.0.5"

            [ollama]
            model = "mistral"
            "#,
        )
        .unwrap();
        assert_eq!(config.meshtastic.connection_type, ConnectionType::Tcp);
        assert_eq!(config.meshtastic.reconnect_max_attempts, 3);
        assert_eq!(config.ollama.model, "mistral");
        assert_eq!(config.ollama.retries, 3);
        assert_eq!(config.bridge.command_prefix, "/AI");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_connection_type_rejected() {
        let parsed: Result<Config, _> = toml::from_str("[meshtastic]\nconnection_type = \"bluetooth\"\n");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.bridge.command_prefix = "  ".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bridge.reply_byte_limit = 8;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.meshtastic.connection_type = ConnectionType::Tcp;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.meshtastic.reconnect_max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.meshtastic.close_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MESHAI_MODEL", "phi3"),
            ("MESHAI_TCP_HOST", "meshnode.local"),
            ("MESHAI_PREFIX", ""),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.ollama.model, "phi3");
        assert_eq!(config.meshtastic.tcp_host, "meshnode.local");
        assert_eq!(config.meshtastic.connection_type, ConnectionType::Tcp);
        // blank values are ignored
        assert_eq!(config.bridge.command_prefix, "/AI");
    }

    #[tokio::test]
    async fn test_create_default_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();

        let (loaded, found) = Config::load_or_default(path).await.unwrap();
        assert!(found);
        assert_eq!(loaded.ollama.url, OllamaConfig::default().url);
        assert_eq!(loaded.logging.file.as_deref(), Some("meshai.log"));

        let (_, found) = Config::load_or_default(dir.path().join("missing.toml").to_str().unwrap())
            .await
            .unwrap();
        assert!(!found);
    }
}
