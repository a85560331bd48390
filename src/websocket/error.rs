//! WebSocket protocol and handshake error types.

use thiserror::Error;

/// Result type for frame codec operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Result type for handshake operations.
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Errors raised while encoding or decoding WebSocket frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A client frame arrived without the mask bit set.
    #[error("protocol error: client frame is not masked")]
    UnmaskedFrame,

    /// A server frame arrived with the mask bit set.
    #[error("protocol error: server frame must not be masked")]
    MaskedFrame,

    /// The opcode nibble does not name a supported frame type.
    #[error("unknown opcode: {0:#x}")]
    UnknownOpcode(u8),

    /// RSV1-3 set without a negotiated extension.
    #[error("protocol error: reserved bits set ({0:#05b})")]
    ReservedBits(u8),

    /// FIN bit cleared; fragmented messages are not supported.
    #[error("protocol error: fragmented frames are not supported")]
    Fragmented,

    /// The most significant bit of a 64-bit length was set.
    #[error("protocol error: invalid 64-bit payload length {0}")]
    LengthOverflow(u64),

    /// The declared payload exceeds the configured maximum.
    #[error("frame too large: {actual} bytes (max {max})")]
    FrameTooLarge {
        /// Maximum allowed payload length.
        max: u64,
        /// Declared payload length.
        actual: u64,
    },

    /// The payload cannot be represented in a single frame.
    #[error("payload too large to encode: {0} bytes")]
    PayloadTooLarge(u64),
}

/// Errors raised while reading the HTTP upgrade request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The request head did not end within the allowed size.
    #[error("request head exceeds {max} bytes")]
    HeadTooLarge {
        /// Maximum head size in bytes.
        max: usize,
    },

    /// The request head is not valid UTF-8.
    #[error("request head is not valid UTF-8")]
    InvalidUtf8,

    /// The request line does not have exactly three tokens.
    #[error("malformed request line: \"{0}\"")]
    MalformedRequestLine(String),

    /// A header line has no `:` separator.
    #[error("malformed header line: \"{0}\"")]
    MalformedHeader(String),

    /// The `Content-Length` header is not a number.
    #[error("invalid Content-Length: \"{0}\"")]
    InvalidContentLength(String),

    /// `Sec-WebSocket-Key` is absent or empty.
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    /// The peer closed the socket before the handshake finished.
    #[error("peer closed the connection during the handshake")]
    PeerClosed,

    /// The operation does not apply to the current handshake state.
    #[error("invalid handshake state: current={current}, expected={expected}")]
    InvalidState {
        /// Current state.
        current: &'static str,
        /// State the operation needs.
        expected: &'static str,
    },
}
