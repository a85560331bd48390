//! IPC error types.

use crate::websocket::ProtocolError;
use thiserror::Error;

/// Errors on the master/worker socket pairs.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Reading from or writing to an IPC endpoint failed.
    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A worker closed its end of the pair.
    #[error("worker {0} closed its IPC channel")]
    WorkerGone(u32),

    /// The master closed its end of the pair.
    #[error("master closed the relay channel")]
    MasterGone,

    /// A published message does not fit in one relay record.
    #[error("relay message too large: {actual} bytes (max {max})")]
    MessageTooLarge {
        /// Largest record the pair carries.
        max: usize,
        /// Framed size of the message.
        actual: usize,
    },

    /// Relay traffic could not be framed or unframed.
    #[error("relay framing error: {0}")]
    Framing(#[from] ProtocolError),
}

/// Result type for IPC operations.
pub type IpcResult<T> = Result<T, IpcError>;
