//! One client socket and its protocol state.

use super::error::ConnectionError;
use crate::websocket::{
    encode_into, Decoded, Frame, FrameDecoder, Handshake, HandshakeError, HandshakeRequest,
    HandshakeState, ProtocolResult,
};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::Interest;
use tokio::net::TcpStream;

/// Opaque connection identifier, assigned in accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw counter value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection lifecycle as seen by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted; nothing received yet.
    New,
    /// Upgrade request in progress or response pending.
    Handshaking,
    /// Upgraded; frames flow both ways.
    Open,
    /// Closed and deregistered.
    Closed,
}

/// Per-connection buffer and protocol limits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionLimits {
    pub(crate) read_buffer_size: usize,
    pub(crate) max_handshake_size: usize,
    pub(crate) decoder: FrameDecoder,
}

/// A client connection.
///
/// Applications interact with it through [`send`](Self::send) and
/// [`close`](Self::close); the socket itself stays with the event loop.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    stream: TcpStream,
    handshake: Handshake,
    decoder: FrameDecoder,
    read_buf: BytesMut,
    read_buffer_size: usize,
    write_buf: BytesMut,
    outbound: VecDeque<Frame>,
    close_requested: bool,
    closed: bool,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        peer_addr: SocketAddr,
        limits: ConnectionLimits,
    ) -> Self {
        Self {
            id,
            peer_addr,
            stream,
            handshake: Handshake::new(limits.max_handshake_size),
            decoder: limits.decoder,
            read_buf: BytesMut::with_capacity(limits.read_buffer_size),
            read_buffer_size: limits.read_buffer_size,
            write_buf: BytesMut::new(),
            outbound: VecDeque::new(),
            close_requested: false,
            closed: false,
        }
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote IP address (port stripped).
    #[must_use]
    pub fn remote_addr(&self) -> IpAddr {
        self.peer_addr.ip()
    }

    /// Remote socket address.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The upgrade request, once received.
    #[must_use]
    pub fn request(&self) -> Option<&HandshakeRequest> {
        self.handshake.request()
    }

    /// Routing path: request path without query, trimmed of `/`.
    ///
    /// Empty until the request has been received.
    #[must_use]
    pub fn application_path(&self) -> &str {
        self.request()
            .map(HandshakeRequest::application_path)
            .unwrap_or_default()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.closed {
            ConnectionState::Closed
        } else if self.handshake.is_upgraded() {
            ConnectionState::Open
        } else if self.read_buf.is_empty()
            && self.handshake.state() == HandshakeState::AwaitingRequest
        {
            ConnectionState::New
        } else {
            ConnectionState::Handshaking
        }
    }

    /// Whether the handshake response has been written.
    #[must_use]
    pub fn is_upgraded(&self) -> bool {
        self.handshake.is_upgraded()
    }

    /// Whether the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Queue a frame for transmission.
    ///
    /// Frames are encoded and written by the event loop once the socket is
    /// writable, after the applications' `on_send` observers have seen them.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] once the connection is closed or
    /// a close has been requested, and [`ConnectionError::NotOpen`] before
    /// the upgrade.
    pub fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if self.closed || self.close_requested {
            return Err(ConnectionError::Closed);
        }
        if !self.handshake.is_upgraded() {
            return Err(ConnectionError::NotOpen);
        }
        self.outbound.push_back(frame);
        Ok(())
    }

    /// Queue a text frame.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn send_text(&mut self, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.send(Frame::text(text))
    }

    /// Queue a binary frame.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<(), ConnectionError> {
        self.send(Frame::binary(data))
    }

    /// Ask the event loop to close this connection once the current
    /// callback returns. Already-queued frames are written first when the
    /// socket accepts them.
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    /// Number of frames queued but not yet encoded.
    #[must_use]
    pub fn pending_frames(&self) -> usize {
        self.outbound.len()
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub(crate) fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        !self.write_buf.is_empty() || !self.outbound.is_empty()
    }

    /// Readiness the loop should wait for.
    ///
    /// Readable while waiting for the request or once upgraded; writable
    /// only while the response is pending or output is queued. Once a close
    /// is requested nothing more is read.
    pub(crate) fn interest(&self) -> Interest {
        if self.close_requested {
            return Interest::WRITABLE;
        }
        match self.handshake.state() {
            HandshakeState::RequestReceived => Interest::WRITABLE,
            HandshakeState::AwaitingRequest | HandshakeState::Upgraded => {
                if self.has_pending_output() {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                }
            },
        }
    }

    /// One non-blocking read into the buffer. `Ok(0)` means the peer closed.
    pub(crate) fn read(&mut self) -> io::Result<usize> {
        self.read_buf.reserve(self.read_buffer_size);
        self.stream.try_read_buf(&mut self.read_buf)
    }

    pub(crate) fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    /// Advance the handshake with the buffered bytes.
    pub(crate) fn receive_request(&mut self) -> Result<bool, HandshakeError> {
        self.handshake.receive(&mut self.read_buf)
    }

    /// Queue the upgrade response and move to `Upgraded`.
    pub(crate) fn accept_upgrade(&mut self, server_id: &str) -> Result<(), HandshakeError> {
        let response = self.handshake.response(server_id)?;
        self.handshake.complete()?;
        self.write_buf.extend_from_slice(&response.to_bytes());
        Ok(())
    }

    /// Next complete frame in the read buffer.
    pub(crate) fn next_frame(&mut self) -> ProtocolResult<Option<Frame>> {
        match self.decoder.decode(&self.read_buf)? {
            Decoded::Incomplete => Ok(None),
            Decoded::Complete { frame, length } => {
                self.read_buf.advance(length);
                Ok(Some(frame))
            },
        }
    }

    pub(crate) fn pop_outbound(&mut self) -> Option<Frame> {
        self.outbound.pop_front()
    }

    /// Encode an outbound frame into the write buffer.
    pub(crate) fn write_frame(&mut self, frame: &Frame) -> ProtocolResult<()> {
        encode_into(&mut self.write_buf, &frame.payload, frame.opcode, None)
    }

    /// Write as much of the write buffer as the socket accepts.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.stream.try_write(&self.write_buf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }
}
