//! Lifecycle events and the top-level error sink.

use super::connection::ConnectionId;
use super::error::ConnectionError;
use std::fmt;
use tracing::error;

/// Events emitted by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// A connection was accepted and registered.
    Connect,
    /// A connection was deregistered.
    Disconnect,
    /// The upgrade request was read.
    HandshakeRead,
    /// The upgrade response was written.
    HandshakeSend,
    /// A frame was encoded for transmission.
    Send,
    /// A connection became a WebSocket.
    Open,
    /// An upgraded connection was closed.
    Close,
    /// A frame was received.
    Message,
    /// An error was raised for a connection.
    Error,
    /// The loop stopped.
    Shutdown,
}

impl LifecycleEvent {
    /// Event name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::HandshakeRead => "handshake.read",
            Self::HandshakeSend => "handshake.send",
            Self::Send => "send",
            Self::Open => "open",
            Self::Close => "close",
            Self::Message => "message",
            Self::Error => "error",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observes every lifecycle event of a loop.
pub trait LifecycleObserver {
    /// Called once per event; `connection` is `None` for `shutdown`.
    fn on_event(&self, event: LifecycleEvent, connection: Option<ConnectionId>);
}

/// Receives errors no application handled.
pub trait ErrorSink {
    /// Report an escaped error.
    fn report(&self, connection: Option<ConnectionId>, error: &ConnectionError);
}

/// Error sink that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, connection: Option<ConnectionId>, err: &ConnectionError) {
        match connection {
            Some(id) => error!(connection = %id, error = %err, "unhandled connection error"),
            None => error!(error = %err, "unhandled error"),
        }
    }
}
