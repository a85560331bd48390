//! # WebSocket Protocol
//!
//! RFC 6455 wire protocol: the frame codec and the HTTP upgrade handshake.
//!
//! ## Features
//!
//! - Single-frame text, binary, close, ping and pong messages
//! - 7-bit, 16-bit and 64-bit payload length classes
//! - Client masking enforced on the server side
//! - Handshake requests reassembled across partial reads
//!
//! Fragmented messages, extensions and subprotocol negotiation are not
//! supported; the raw `Sec-WebSocket-Protocol` values are exposed on the
//! request.

mod error;
mod frame;
mod handshake;

pub use error::{HandshakeError, HandshakeResult, ProtocolError, ProtocolResult};
pub use frame::{
    apply_mask, decode, encode, encode_into, encode_with_mask, header_len, Decoded, Frame,
    FrameDecoder, OpCode, Role, MAX_EXT16_LEN, MAX_INLINE_LEN, MAX_PAYLOAD_LEN,
};
pub use handshake::{
    compute_accept_key, normalize_path, Handshake, HandshakeRequest, HandshakeResponse,
    HandshakeState, Headers, DEFAULT_MAX_REQUEST_SIZE, POWERED_BY,
};
