//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Configuration parsed but is not usable
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// tracing EnvFilter directive (default "info")
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

/// Status endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StatusConfig {
    /// Address of the JSON status endpoint (disabled if None)
    pub addr: Option<SocketAddr>,
}

/// A single relayed video source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    /// Stream name, used in logs and the status endpoint
    pub name: String,
    /// RTSP source URL
    pub url: String,
    /// WebSocket listening port
    pub ws_port: u16,
    /// Host the WebSocket listener binds to (default 0.0.0.0)
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Transcoder binary (default "ffmpeg")
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Extra transcoder arguments, inserted before the output target
    #[serde(default)]
    pub ffmpeg_options: Vec<String>,
    /// Explicit frame width (discovered from ffmpeg output if None)
    pub width: Option<u16>,
    /// Explicit frame height (discovered from ffmpeg output if None)
    pub height: Option<u16>,
    /// Restart the transcoder when it exits unexpectedly (default true)
    #[serde(default = "default_restart_on_close")]
    pub restart_on_close: bool,
    /// Delay before an automatic restart, in milliseconds (default 1000)
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Grace period between the stop signal and a forced kill (default 5000)
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Chunks queued per client before it counts as not ready (default 64)
    #[serde(default = "default_client_queue_depth")]
    pub client_queue_depth: usize,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_restart_on_close() -> bool {
    true
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

fn default_client_queue_depth() -> usize {
    64
}

impl StreamConfig {
    /// Create a stream config with defaults for everything but the essentials
    pub fn new(name: impl Into<String>, url: impl Into<String>, ws_port: u16) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ws_port,
            bind_host: default_bind_host(),
            ffmpeg_path: default_ffmpeg_path(),
            ffmpeg_options: Vec::new(),
            width: None,
            height: None,
            restart_on_close: default_restart_on_close(),
            restart_delay_ms: default_restart_delay_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            client_queue_depth: default_client_queue_depth(),
        }
    }

    /// Address the WebSocket listener binds to
    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.ws_port)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RELAY_LOG -> logging.filter
    /// - RELAY_STATUS_ADDR -> status.addr
    /// - RELAY_FFMPEG_PATH -> ffmpeg_path of every stream
    /// - RELAY_RESTART_ON_CLOSE -> restart_on_close of every stream
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RELAY_LOG") {
            if !val.trim().is_empty() {
                self.logging.filter = val;
            }
        }

        if let Ok(val) = env::var("RELAY_STATUS_ADDR") {
            if let Ok(addr) = val.parse::<SocketAddr>() {
                self.status.addr = Some(addr);
            }
        }

        if let Ok(val) = env::var("RELAY_FFMPEG_PATH") {
            if !val.trim().is_empty() {
                for stream in &mut self.streams {
                    stream.ffmpeg_path = val.clone();
                }
            }
        }

        if let Ok(val) = env::var("RELAY_RESTART_ON_CLOSE") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            let restart = match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None, // Invalid value, keep existing
            };
            if let Some(restart) = restart {
                for stream in &mut self.streams {
                    stream.restart_on_close = restart;
                }
            }
        }
    }

    /// Check that the configuration describes a runnable relay
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streams.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [[streams]] entry is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut addrs = HashSet::new();
        for stream in &self.streams {
            if stream.name.trim().is_empty() {
                return Err(ConfigError::Invalid("stream name is empty".to_string()));
            }
            if !names.insert(stream.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate stream name '{}'",
                    stream.name
                )));
            }
            if stream.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stream '{}' has an empty url",
                    stream.name
                )));
            }
            if stream.ws_port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "stream '{}' needs a non-zero ws_port",
                    stream.name
                )));
            }
            if !addrs.insert(stream.ws_addr()) {
                return Err(ConfigError::Invalid(format!(
                    "stream '{}' reuses listener address {}",
                    stream.name,
                    stream.ws_addr()
                )));
            }
            if stream.width == Some(0) || stream.height == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "stream '{}' has a zero width or height",
                    stream.name
                )));
            }
            if stream.client_queue_depth == 0 {
                return Err(ConfigError::Invalid(format!(
                    "stream '{}' needs client_queue_depth >= 1",
                    stream.name
                )));
            }
        }

        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
