//! Configuration
//!
//! Configuration structures for the relay server and the voice client.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS is enabled only when both `certfile` and `keyfile` are set.
    #[serde(default)]
    pub certfile: Option<PathBuf>,
    #[serde(default)]
    pub keyfile: Option<PathBuf>,
    #[serde(default = "default_room_capacity")]
    pub room_capacity: usize,
    /// How long an empty room stays reserved for reconnecting members.
    #[serde(default = "default_empty_room_retention")]
    pub empty_room_retention_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_room_capacity() -> usize {
    4
}

fn default_empty_room_retention() -> u64 {
    120
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_max_frame_len() -> usize {
    64 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            certfile: None,
            keyfile: None,
            room_capacity: default_room_capacity(),
            empty_room_retention_secs: default_empty_room_retention(),
            sweep_interval_secs: default_sweep_interval(),
            max_frame_len: default_max_frame_len(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the registry cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.room_capacity == 0 {
            return Err(ConfigError::Invalid("room_capacity must be at least 1".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid("sweep_interval_secs must be at least 1".into()));
        }
        let grace = ReconnectConfig::default().grace_window();
        if self.empty_room_retention_secs > 0 && self.empty_room_retention() < grace {
            return Err(ConfigError::Invalid(format!(
                "empty_room_retention_secs ({}) is shorter than the client reconnection window ({}s)",
                self.empty_room_retention_secs,
                grace.as_secs()
            )));
        }
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        self.certfile.is_some() && self.keyfile.is_some()
    }

    pub fn empty_room_retention(&self) -> Duration {
        Duration::from_secs(self.empty_room_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Voice client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_port")]
    pub server_port: u16,
    #[serde(default)]
    pub tls: bool,
    /// Extra trust anchor for self-signed relays; public roots are used otherwise.
    #[serde(default)]
    pub ca_certfile: Option<PathBuf>,
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    /// Largest signaling frame accepted from the relay
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_display_name() -> String {
    "User".to_string()
}

fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
        "stun:stun2.l.google.com:19302".to_string(),
        "stun:stun3.l.google.com:19302".to_string(),
        "stun:stun4.l.google.com:19302".to_string(),
    ]
}

/// Signaling reconnection policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_attempts")]
    pub attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    5000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempts: default_reconnect_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl ReconnectConfig {
    /// Backoff before the given attempt (1-based), doubling up to the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Total time a client keeps retrying before giving up.
    pub fn grace_window(&self) -> Duration {
        (1..=self.attempts).map(|a| self.delay_for(a)).sum()
    }
}

/// Audio capture and playback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Input device name; the host default is used when unset.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_true")]
    pub echo_cancellation: bool,
    #[serde(default = "default_true")]
    pub noise_suppression: bool,
    #[serde(default = "default_true")]
    pub auto_gain_control: bool,
    #[serde(default = "default_meter_interval")]
    pub meter_interval_ms: u64,
    #[serde(default = "default_speaking_threshold")]
    pub speaking_threshold: u8,
    #[serde(default = "default_volume")]
    pub volume: u8,
}

fn default_sample_rate() -> u32 {
    48000
}

fn default_channels() -> u16 {
    1
}

fn default_true() -> bool {
    true
}

fn default_meter_interval() -> u64 {
    100
}

fn default_speaking_threshold() -> u8 {
    10
}

fn default_volume() -> u8 {
    50
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            meter_interval_ms: default_meter_interval(),
            speaking_threshold: default_speaking_threshold(),
            volume: default_volume(),
        }
    }
}

impl AudioConfig {
    pub fn meter_interval(&self) -> Duration {
        Duration::from_millis(self.meter_interval_ms.max(1))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            server_port: default_port(),
            tls: false,
            ca_certfile: None,
            display_name: default_display_name(),
            ice_servers: default_ice_servers(),
            reconnect: ReconnectConfig::default(),
            audio: AudioConfig::default(),
            max_frame_len: default_max_frame_len(),
            log_level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
