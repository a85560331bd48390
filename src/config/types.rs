//! Configuration type definitions.

use super::error::{ConfigError, ConfigResult};
use crate::websocket::POWERED_BY;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest accepted handshake bound; a request line plus a key header
/// does not fit in less.
const MIN_HANDSHAKE_SIZE: usize = 64;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener and process settings.
    pub server: ServerSection,

    /// Per-connection resource limits.
    pub limits: LimitsConfig,

    /// WebSocket protocol behavior.
    pub protocol: ProtocolConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl ServerConfig {
    /// Address the listening socket binds to, as `host:port`.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Check values that deserialize fine but cannot run.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for the first offending field.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::invalid("server.host", "must not be empty"));
        }
        if self.server.workers == 0 {
            return Err(ConfigError::invalid("server.workers", "must be at least 1"));
        }
        if self.server.server_id.trim().is_empty() {
            return Err(ConfigError::invalid("server.server_id", "must not be empty"));
        }
        if self.limits.read_buffer_size == 0 {
            return Err(ConfigError::invalid(
                "limits.read_buffer_size",
                "must be greater than 0",
            ));
        }
        if self.limits.max_handshake_size < MIN_HANDSHAKE_SIZE {
            return Err(ConfigError::invalid(
                "limits.max_handshake_size",
                format!("must be at least {MIN_HANDSHAKE_SIZE} bytes"),
            ));
        }
        if self.limits.max_frame_size == 0 {
            return Err(ConfigError::invalid(
                "limits.max_frame_size",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Server section configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSection {
    /// Host or IP address to bind.
    pub host: String,

    /// TCP port to bind (0 picks an ephemeral port).
    pub port: u16,

    /// Number of worker processes.
    pub workers: usize,

    /// PID file written by the master at startup.
    pub pid_file: Option<PathBuf>,

    /// Value of the `X-Powered-By` response header.
    pub server_id: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: 4,
            pid_file: None,
            server_id: POWERED_BY.to_string(),
        }
    }
}

/// Default [`LimitsConfig::max_frame_size`]: 16 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

/// Per-connection resource limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum open connections per remote IP (0 = unlimited).
    pub max_connections_per_ip: usize,

    /// Maximum size of the upgrade request in bytes.
    pub max_handshake_size: usize,

    /// Bytes reserved per socket read.
    pub read_buffer_size: usize,

    /// Maximum payload length of a single frame. Larger declared lengths
    /// close the connection before any payload is buffered.
    pub max_frame_size: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: 0,
            max_handshake_size: crate::websocket::DEFAULT_MAX_REQUEST_SIZE,
            read_buffer_size: 4096,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// WebSocket protocol behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Answer ping frames with a pong carrying the same payload.
    pub auto_pong: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self { auto_pong: true }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: LogLevel,

    /// Log format (json, pretty, compact).
    pub format: LogFormat,
}

/// Log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace,
    /// Debug level.
    Debug,
    /// Info level (default).
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level (least verbose).
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (machine-readable).
    Json,
    /// Pretty multi-line format (default).
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
}
