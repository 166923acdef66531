//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
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
    /// A value parsed but is not usable
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

/// What happens to a new broadcast when the fleet is already at `max_sessions`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Refuse the handshake with a "try again later" close code
    Reject,
    /// Accept anyway; capacity is only used for reporting
    Allow,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self::Reject
    }
}

impl AdmissionPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "allow" => Some(Self::Allow),
            _ => None,
        }
    }
}

/// Listener and ingest protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket listener binds to
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Path the ingest WebSocket is served on
    #[serde(default = "default_ingest_path")]
    pub ingest_path: String,
    /// Seconds between liveness pings
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Seconds a new connection has to send its handshake
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Soft fleet capacity
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default)]
    pub admission: AdmissionPolicy,
    /// Largest single WebSocket message accepted
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:5002".to_string()
}

fn default_ingest_path() -> String {
    "/ws/rtmp".to_string()
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_max_sessions() -> usize {
    60
}

fn default_max_message_bytes() -> usize {
    8 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            ingest_path: default_ingest_path(),
            ping_interval_secs: default_ping_interval_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_sessions: default_max_sessions(),
            admission: AdmissionPolicy::default(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

/// Transcoding engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscoderConfig {
    /// Explicit path to the ffmpeg binary (searched on PATH if None)
    pub ffmpeg_path: Option<String>,
    /// x264 speed preset
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Milliseconds between SIGTERM and SIGKILL during teardown
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Bytes allowed to sit in a process's input queue before frames are dropped
    #[serde(default = "default_backpressure_limit_bytes")]
    pub backpressure_limit_bytes: usize,
    /// Respawns allowed after a mid-stream crash (0 = fail immediately)
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_grace_period_ms() -> u64 {
    4000
}

fn default_backpressure_limit_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            preset: default_preset(),
            grace_period_ms: default_grace_period_ms(),
            backpressure_limit_bytes: default_backpressure_limit_bytes(),
            max_reconnect_attempts: 0,
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

/// Outbound destination defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DestinationConfig {
    /// Endpoint used when a handshake's server is blank
    #[serde(default = "default_endpoint")]
    pub default_endpoint: String,
}

fn default_endpoint() -> String {
    "rtmps://live-api-s.facebook.com:443/rtmp/".to_string()
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            default_endpoint: default_endpoint(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
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
    /// - RELAY_BIND_ADDR -> server.bind_addr
    /// - RELAY_INGEST_PATH -> server.ingest_path
    /// - RELAY_PING_INTERVAL_SECS -> server.ping_interval_secs
    /// - RELAY_HANDSHAKE_TIMEOUT_SECS -> server.handshake_timeout_secs
    /// - RELAY_MAX_SESSIONS -> server.max_sessions
    /// - RELAY_ADMISSION -> server.admission
    /// - FFMPEG_PATH -> transcoder.ffmpeg_path
    /// - RELAY_FFMPEG_PRESET -> transcoder.preset
    /// - RELAY_GRACE_PERIOD_MS -> transcoder.grace_period_ms
    /// - RELAY_BACKPRESSURE_LIMIT_BYTES -> transcoder.backpressure_limit_bytes
    /// - RELAY_MAX_RECONNECT_ATTEMPTS -> transcoder.max_reconnect_attempts
    /// - RELAY_DEFAULT_ENDPOINT -> destination.default_endpoint
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RELAY_BIND_ADDR") {
            if !val.trim().is_empty() {
                self.server.bind_addr = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("RELAY_INGEST_PATH") {
            if !val.trim().is_empty() {
                self.server.ingest_path = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("RELAY_PING_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.server.ping_interval_secs = secs;
            }
        }

        if let Ok(val) = env::var("RELAY_HANDSHAKE_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.server.handshake_timeout_secs = secs;
            }
        }

        if let Ok(val) = env::var("RELAY_MAX_SESSIONS") {
            if let Ok(max) = val.parse::<usize>() {
                self.server.max_sessions = max;
            }
        }

        if let Ok(val) = env::var("RELAY_ADMISSION") {
            // Unknown policies keep the existing value
            if let Some(policy) = AdmissionPolicy::parse(&val) {
                self.server.admission = policy;
            }
        }

        if let Ok(val) = env::var("FFMPEG_PATH") {
            if !val.trim().is_empty() {
                self.transcoder.ffmpeg_path = Some(val.trim().to_string());
            }
        }

        if let Ok(val) = env::var("RELAY_FFMPEG_PRESET") {
            if !val.trim().is_empty() {
                self.transcoder.preset = val.trim().to_string();
            }
        }

        if let Ok(val) = env::var("RELAY_GRACE_PERIOD_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.transcoder.grace_period_ms = ms;
            }
        }

        if let Ok(val) = env::var("RELAY_BACKPRESSURE_LIMIT_BYTES") {
            if let Ok(bytes) = val.parse::<usize>() {
                self.transcoder.backpressure_limit_bytes = bytes;
            }
        }

        if let Ok(val) = env::var("RELAY_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(attempts) = val.parse::<u32>() {
                self.transcoder.max_reconnect_attempts = attempts;
            }
        }

        if let Ok(val) = env::var("RELAY_DEFAULT_ENDPOINT") {
            if !val.trim().is_empty() {
                self.destination.default_endpoint = val.trim().to_string();
            }
        }
    }

    /// Check values that parse fine but cannot drive a running server
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "server.bind_addr '{}' is not a socket address",
                self.server.bind_addr
            )));
        }
        if !self.server.ingest_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.ingest_path '{}' must start with '/'",
                self.server.ingest_path
            )));
        }
        if self.server.ping_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.ping_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.transcoder.grace_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "transcoder.grace_period_ms must be greater than zero".to_string(),
            ));
        }
        if self.transcoder.backpressure_limit_bytes == 0 {
            return Err(ConfigError::Invalid(
                "transcoder.backpressure_limit_bytes must be greater than zero".to_string(),
            ));
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

    /// Defaults plus environment overrides, for running without a config file
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
