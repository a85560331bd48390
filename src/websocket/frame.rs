//! WebSocket frame codec.
//!
//! Encodes and decodes single, unfragmented RFC 6455 frames:
//!
//! ```text
//! byte0: FIN(1) RSV(000) opcode(4)
//! byte1: MASK(1) length-class(7)   0-125 literal, 126 => u16, 127 => u64
//! [2 or 8 bytes extended length, big-endian]
//! [4 mask bytes when MASK=1]
//! payload, XORed with mask[i % 4] when MASK=1
//! ```
//!
//! Decoding works on a byte prefix and reports [`Decoded::Incomplete`] until a
//! whole frame is available, so callers can keep appending to a read buffer.

use super::error::{ProtocolError, ProtocolResult};
use bytes::{BufMut, Bytes, BytesMut};

const FIN: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LENGTH_BITS: u8 = 0x7F;
const LENGTH_EXT16: u8 = 126;
const LENGTH_EXT64: u8 = 127;

/// Largest payload carried in the 7-bit length field.
pub const MAX_INLINE_LEN: usize = 125;

/// Largest payload carried in the 16-bit extended length field.
pub const MAX_EXT16_LEN: usize = 65_535;

/// Largest payload a frame can declare (the 64-bit length MSB must be 0).
pub const MAX_PAYLOAD_LEN: u64 = i64::MAX as u64;

/// WebSocket operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Text frame.
    Text,
    /// Binary frame.
    Binary,
    /// Close frame.
    Close,
    /// Ping frame.
    Ping,
    /// Pong frame.
    Pong,
}

impl OpCode {
    /// Parse the low nibble of the first header byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Check if this is a data frame.
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text | Self::Binary)
    }
}

impl From<OpCode> for u8 {
    fn from(value: OpCode) -> Self {
        match value {
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(ProtocolError::UnknownOpcode(value))
    }
}

/// Which side of the connection is decoding.
///
/// Clients mask every frame they send and servers never do, so the decoder
/// rejects frames whose mask bit does not match the peer's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Decoding frames sent by a client.
    Server,
    /// Decoding frames sent by a server.
    Client,
}

/// A single WebSocket frame with its payload unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub opcode: OpCode,
    /// Unmasked payload.
    pub payload: Bytes,
    /// Whether the frame is (or was) masked on the wire.
    pub masked: bool,
}

impl Frame {
    /// Create an unmasked frame.
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
            masked: false,
        }
    }

    /// Create a text frame.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OpCode::Text, Bytes::from(text.into()))
    }

    /// Create a binary frame.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data)
    }

    /// Create a ping frame.
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data)
    }

    /// Create a pong frame.
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data)
    }

    /// Create a close frame with a raw payload.
    pub fn close(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Close, data)
    }

    /// Mark the frame to be masked when encoded.
    #[must_use]
    pub fn masked(mut self) -> Self {
        self.masked = true;
        self
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Encode this frame for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] if the payload cannot be
    /// expressed in a 63-bit length.
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        encode(&self.payload, self.opcode, self.masked)
    }
}

/// Outcome of decoding a byte prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// More bytes are needed before a frame can be produced.
    Incomplete,
    /// A whole frame was decoded.
    Complete {
        /// The decoded frame.
        frame: Frame,
        /// Number of input bytes the frame occupied (header, mask, payload).
        length: usize,
    },
}

/// Size of the frame header for a payload of `payload_len` bytes.
pub fn header_len(payload_len: usize, masked: bool) -> usize {
    let length_bytes = match payload_len {
        n if n <= MAX_INLINE_LEN => 0,
        n if n <= MAX_EXT16_LEN => 2,
        _ => 8,
    };
    2 + length_bytes + if masked { 4 } else { 0 }
}

/// Encode `payload` as a single frame.
///
/// When `masked` is set a random mask is generated; the server never masks
/// its own frames, so this is only true for client-role encoding.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] for payloads of 2^63 bytes or more.
pub fn encode(payload: &[u8], opcode: OpCode, masked: bool) -> ProtocolResult<Bytes> {
    let mask = masked.then(rand::random::<[u8; 4]>);
    let mut buf = BytesMut::with_capacity(header_len(payload.len(), masked) + payload.len());
    encode_into(&mut buf, payload, opcode, mask)?;
    Ok(buf.freeze())
}

/// Encode `payload` as a masked frame using the given mask.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] for payloads of 2^63 bytes or more.
pub fn encode_with_mask(payload: &[u8], opcode: OpCode, mask: [u8; 4]) -> ProtocolResult<Bytes> {
    let mut buf = BytesMut::with_capacity(header_len(payload.len(), true) + payload.len());
    encode_into(&mut buf, payload, opcode, Some(mask))?;
    Ok(buf.freeze())
}

/// Append an encoded frame to `buf`.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] for payloads of 2^63 bytes or more.
pub fn encode_into(
    buf: &mut BytesMut,
    payload: &[u8],
    opcode: OpCode,
    mask: Option<[u8; 4]>,
) -> ProtocolResult<()> {
    let len = payload.len() as u64;
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge(len));
    }

    buf.reserve(header_len(payload.len(), mask.is_some()) + payload.len());
    buf.put_u8(FIN | u8::from(opcode));

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    match payload.len() {
        n if n <= MAX_INLINE_LEN => buf.put_u8(mask_bit | n as u8),
        n if n <= MAX_EXT16_LEN => {
            buf.put_u8(mask_bit | LENGTH_EXT16);
            buf.put_u16(n as u16);
        },
        _ => {
            buf.put_u8(mask_bit | LENGTH_EXT64);
            buf.put_u64(len);
        },
    }

    match mask {
        Some(mask) => {
            buf.put_slice(&mask);
            let start = buf.len();
            buf.put_slice(payload);
            apply_mask(&mut buf[start..], mask);
        },
        None => buf.put_slice(payload),
    }

    Ok(())
}

/// XOR `data` in place with the repeating 4-byte `mask`.
///
/// Applying the same mask twice restores the original bytes.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Role-aware frame decoder with an optional payload limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDecoder {
    role: Role,
    max_payload_len: Option<u64>,
}

impl FrameDecoder {
    /// Create a decoder for the given role with no payload limit.
    pub const fn new(role: Role) -> Self {
        Self {
            role,
            max_payload_len: None,
        }
    }

    /// Decoder for frames sent by clients (mask required).
    pub const fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Decoder for frames sent by servers (mask forbidden).
    pub const fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Reject frames declaring a payload longer than `max` bytes.
    #[must_use]
    pub const fn with_max_payload_len(mut self, max: u64) -> Self {
        self.max_payload_len = Some(max);
        self
    }

    /// The decoding role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Decode the frame at the start of `raw`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] for mask violations, unknown opcodes,
    /// reserved bits, fragmented frames and invalid or oversized lengths.
    pub fn decode(&self, raw: &[u8]) -> ProtocolResult<Decoded> {
        if raw.len() < 2 {
            return Ok(Decoded::Incomplete);
        }

        let first = raw[0];
        let second = raw[1];
        let masked = second & MASK_BIT != 0;

        match (self.role, masked) {
            (Role::Server, false) => return Err(ProtocolError::UnmaskedFrame),
            (Role::Client, true) => return Err(ProtocolError::MaskedFrame),
            _ => {},
        }

        let opcode = OpCode::try_from(first & OPCODE_BITS)?;

        if first & RSV_BITS != 0 {
            return Err(ProtocolError::ReservedBits((first & RSV_BITS) >> 4));
        }
        if first & FIN == 0 {
            return Err(ProtocolError::Fragmented);
        }

        let (payload_len, mut offset) = match second & LENGTH_BITS {
            LENGTH_EXT16 => {
                if raw.len() < 4 {
                    return Ok(Decoded::Incomplete);
                }
                (u64::from(u16::from_be_bytes([raw[2], raw[3]])), 4)
            },
            LENGTH_EXT64 => {
                if raw.len() < 10 {
                    return Ok(Decoded::Incomplete);
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&raw[2..10]);
                let len = u64::from_be_bytes(bytes);
                if len > MAX_PAYLOAD_LEN {
                    return Err(ProtocolError::LengthOverflow(len));
                }
                (len, 10)
            },
            inline => (u64::from(inline), 2),
        };

        if let Some(max) = self.max_payload_len {
            if payload_len > max {
                return Err(ProtocolError::FrameTooLarge {
                    max,
                    actual: payload_len,
                });
            }
        }

        let mask = if masked {
            if raw.len() < offset + 4 {
                return Ok(Decoded::Incomplete);
            }
            let mask = [raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]];
            offset += 4;
            Some(mask)
        } else {
            None
        };

        let length = usize::try_from(payload_len)
            .ok()
            .and_then(|len| offset.checked_add(len))
            .ok_or(ProtocolError::FrameTooLarge {
                max: usize::MAX as u64,
                actual: payload_len,
            })?;

        if raw.len() < length {
            return Ok(Decoded::Incomplete);
        }

        let mut payload = BytesMut::from(&raw[offset..length]);
        if let Some(mask) = mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Decoded::Complete {
            frame: Frame {
                opcode,
                payload: payload.freeze(),
                masked,
            },
            length,
        })
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::server()
    }
}

/// Decode a client-originated frame at the start of `raw`.
///
/// # Errors
///
/// See [`FrameDecoder::decode`]; unmasked frames are rejected.
pub fn decode(raw: &[u8]) -> ProtocolResult<Decoded> {
    FrameDecoder::server().decode(raw)
}
