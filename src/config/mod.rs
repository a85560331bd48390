//! # Configuration
//!
//! TOML-based configuration for the server.
//!
//! ## Example Configuration
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//! workers = 4
//! pid_file = "/var/run/r0n-ws.pid"
//!
//! [limits]
//! max_connections_per_ip = 16
//! max_handshake_size = 10000
//!
//! [protocol]
//! auto_pong = true
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

mod error;
mod loader;
mod types;

pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use types::{
    LimitsConfig, LogFormat, LogLevel, LoggingConfig, ProtocolConfig, ServerConfig, ServerSection,
    DEFAULT_MAX_FRAME_SIZE,
};
