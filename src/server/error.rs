//! Server, connection and application error types.

use crate::config::ConfigError;
use crate::ipc::IpcError;
use crate::logging::LoggingError;
use crate::websocket::{HandshakeError, ProtocolError};
use thiserror::Error;

/// Errors surfaced for one connection.
///
/// These are what applications see in `on_error` and what reaches the
/// error sink.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The peer violated the frame protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The upgrade request was rejected.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// An application callback failed.
    #[error("application error: {0}")]
    Application(#[from] ApplicationError),

    /// Socket I/O failed.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection is already closed.
    #[error("connection is closed")]
    Closed,

    /// The handshake has not completed yet.
    #[error("connection is not open")]
    NotOpen,
}

/// Errors returned by application callbacks.
#[derive(Debug, Error)]
pub enum ApplicationError {
    /// Application-defined failure.
    #[error("{0}")]
    Message(String),

    /// A connection error the application chose not to handle.
    #[error("unhandled: {0}")]
    Unhandled(String),

    /// No relay channel is attached to the loop.
    #[error("relay channel unavailable")]
    RelayUnavailable,

    /// Any other error.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl ApplicationError {
    /// Create an application error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

impl From<ConnectionError> for ApplicationError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::Application(inner) => inner,
            other => Self::Other(Box::new(other)),
        }
    }
}

/// Process-level failures. All of them are fatal for the affected process.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Other I/O failure (runtime, accept, PID file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker process could not be created.
    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    /// The master/worker channel failed.
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// Logging could not be initialized.
    #[error(transparent)]
    Logging(#[from] LoggingError),

    /// The event loop was started twice.
    #[error("event loop already started")]
    AlreadyRunning,
}

/// Result type for application callbacks.
pub type ApplicationResult<T = ()> = Result<T, ApplicationError>;

/// Result type for process-level operations.
pub type ServerResult<T = ()> = Result<T, ServerError>;
