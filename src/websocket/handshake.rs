//! WebSocket HTTP upgrade handshake.
//!
//! A connection moves through three states:
//!
//! ```text
//! AwaitingRequest --(request head parsed, key present)--> RequestReceived
//! RequestReceived --(101 response written)--------------> Upgraded
//! ```
//!
//! Request bytes are accumulated by the caller in a read buffer; the head is
//! parsed only once the `\r\n\r\n` terminator is present, so a request split
//! across several reads is reassembled instead of rejected.

use super::error::{HandshakeError, HandshakeResult};
use base64::Engine;
use bytes::{Buf, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use std::collections::HashMap;

/// WebSocket magic GUID for Sec-WebSocket-Accept calculation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// End of the request head.
const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Default bound on the request head (plus body) size.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 10_000;

/// Server identification sent in `X-Powered-By`.
pub const POWERED_BY: &str = concat!("r0n-ws/", env!("CARGO_PKG_VERSION"));

/// Case-insensitive HTTP header multimap.
///
/// Names are stored lowercased; each header keeps its comma-separated values
/// in order, and repeated header lines append to the same list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: HashMap<String, Vec<String>>,
}

impl Headers {
    /// Create an empty header collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw header value, splitting it on commas.
    pub fn append(&mut self, name: &str, value: &str) {
        let values = self.entries.entry(name.trim().to_ascii_lowercase()).or_default();
        values.extend(
            value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
        );
    }

    /// Whether the header is present.
    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// All values of a header, empty if absent.
    pub fn get(&self, name: &str) -> &[String] {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Values of a header joined back into one line.
    pub fn line(&self, name: &str) -> Option<String> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|values| values.join(", "))
    }

    /// Whether any value of the header equals `value` (ASCII case-insensitive).
    pub fn contains(&self, name: &str, value: &str) -> bool {
        self.get(name).iter().any(|v| v.eq_ignore_ascii_case(value))
    }

    /// Lowercased header names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of distinct headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parsed WebSocket upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    method: String,
    path: String,
    protocol: String,
    headers: Headers,
    body: Bytes,
}

impl HandshakeRequest {
    /// Parse a request head (request line and header lines, without the
    /// terminating blank line).
    ///
    /// # Errors
    ///
    /// Fails if the request line does not have exactly three space-separated
    /// tokens or a header line has no `:`.
    pub fn parse(head: &str) -> HandshakeResult<Self> {
        let mut lines = head.trim().split("\r\n");

        let request_line = lines.next().unwrap_or_default().trim();
        let parts: Vec<&str> = request_line.split(' ').collect();
        let [method, path, protocol] = parts.as_slice() else {
            return Err(HandshakeError::MalformedRequestLine(
                request_line.to_string(),
            ));
        };

        let mut headers = Headers::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HandshakeError::MalformedHeader(line.to_string()))?;
            headers.append(name, value);
        }

        Ok(Self {
            method: method.to_ascii_uppercase(),
            path: (*path).to_string(),
            protocol: (*protocol).to_string(),
            headers,
            body: Bytes::new(),
        })
    }

    /// Request method, uppercased.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Raw request target, including any query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Protocol token of the request line (e.g. `HTTP/1.1`).
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Request body (only present when `Content-Length` was sent).
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Request target without query string or fragment.
    pub fn uri_path(&self) -> &str {
        self.path
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
    }

    /// Query string, if any.
    pub fn query(&self) -> Option<&str> {
        let (_, rest) = self.path.split_once('?')?;
        Some(rest.split('#').next().unwrap_or_default())
    }

    /// Path used to route the connection: the URI path trimmed of slashes.
    pub fn application_path(&self) -> &str {
        normalize_path(self.uri_path())
    }

    /// `Sec-WebSocket-Key`, if present and non-empty.
    pub fn key(&self) -> Option<String> {
        self.headers
            .line("sec-websocket-key")
            .filter(|key| !key.is_empty())
    }

    /// `Sec-WebSocket-Version`, if present and numeric.
    pub fn version(&self) -> Option<u8> {
        self.headers
            .get("sec-websocket-version")
            .first()
            .and_then(|v| v.parse().ok())
    }

    /// Raw `Sec-WebSocket-Protocol` values; no negotiation is performed.
    pub fn protocols(&self) -> &[String] {
        self.headers.get("sec-websocket-protocol")
    }

    /// `Origin` header, if present.
    pub fn origin(&self) -> Option<String> {
        self.headers.line("origin")
    }

    fn content_length(&self) -> HandshakeResult<usize> {
        match self.headers.line("content-length") {
            Some(value) => value
                .parse()
                .map_err(|_| HandshakeError::InvalidContentLength(value)),
            None => Ok(0),
        }
    }
}

/// Trim leading and trailing slashes from a routing path.
pub fn normalize_path(path: &str) -> &str {
    path.trim_matches('/')
}

/// The `101 Switching Protocols` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    accept: String,
    server_id: String,
}

impl HandshakeResponse {
    /// Build the response for a client key.
    pub fn new(key: &str, server_id: impl Into<String>) -> Self {
        Self {
            accept: compute_accept_key(key),
            server_id: server_id.into(),
        }
    }

    /// The `Sec-WebSocket-Accept` value.
    pub fn accept(&self) -> &str {
        &self.accept
    }

    /// Build the HTTP response bytes.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(format!(
            "HTTP/1.0 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             X-Powered-By: {}\r\n\
             \r\n",
            self.accept, self.server_id
        ))
    }
}

/// Compute Sec-WebSocket-Accept value from client key.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Handshake progress of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for the full request head.
    AwaitingRequest,
    /// Request parsed; the response has not been written.
    RequestReceived,
    /// Response written; the connection speaks WebSocket frames.
    Upgraded,
}

impl HandshakeState {
    fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingRequest => "AwaitingRequest",
            Self::RequestReceived => "RequestReceived",
            Self::Upgraded => "Upgraded",
        }
    }
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection handshake state machine.
#[derive(Debug, Clone)]
pub struct Handshake {
    state: HandshakeState,
    request: Option<HandshakeRequest>,
    max_request_size: usize,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUEST_SIZE)
    }
}

impl Handshake {
    /// Create a handshake that accepts requests up to `max_request_size` bytes.
    pub fn new(max_request_size: usize) -> Self {
        Self {
            state: HandshakeState::AwaitingRequest,
            request: None,
            max_request_size,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// The parsed request, once received.
    pub fn request(&self) -> Option<&HandshakeRequest> {
        self.request.as_ref()
    }

    /// Whether the response has been written.
    pub fn is_upgraded(&self) -> bool {
        self.state == HandshakeState::Upgraded
    }

    /// Drive the read step over the bytes buffered so far.
    ///
    /// Returns `Ok(true)` once the request has been parsed and removed from
    /// `buf` (any bytes that follow it stay buffered), `Ok(false)` if more
    /// bytes are needed.
    ///
    /// # Errors
    ///
    /// Fails on malformed requests, a missing key, or a head that exceeds the
    /// size bound.
    pub fn receive(&mut self, buf: &mut BytesMut) -> HandshakeResult<bool> {
        self.expect(HandshakeState::AwaitingRequest)?;

        let Some(end) = find(buf, HEAD_TERMINATOR) else {
            if buf.len() > self.max_request_size {
                return Err(HandshakeError::HeadTooLarge {
                    max: self.max_request_size,
                });
            }
            return Ok(false);
        };

        let head_len = end + HEAD_TERMINATOR.len();
        if head_len > self.max_request_size {
            return Err(HandshakeError::HeadTooLarge {
                max: self.max_request_size,
            });
        }

        let head = std::str::from_utf8(&buf[..end]).map_err(|_| HandshakeError::InvalidUtf8)?;
        let mut request = HandshakeRequest::parse(head)?;

        let body_len = request.content_length()?;
        let total = head_len.saturating_add(body_len);
        if total > self.max_request_size {
            return Err(HandshakeError::HeadTooLarge {
                max: self.max_request_size,
            });
        }
        if buf.len() < total {
            return Ok(false);
        }

        if request.key().is_none() {
            return Err(HandshakeError::MissingKey);
        }

        buf.advance(head_len);
        request.body = buf.split_to(body_len).freeze();

        self.request = Some(request);
        self.state = HandshakeState::RequestReceived;
        Ok(true)
    }

    /// Build the upgrade response for the received request.
    ///
    /// # Errors
    ///
    /// Fails unless the state is `RequestReceived`.
    pub fn response(&self, server_id: &str) -> HandshakeResult<HandshakeResponse> {
        self.expect(HandshakeState::RequestReceived)?;
        let key = self
            .request
            .as_ref()
            .and_then(HandshakeRequest::key)
            .ok_or(HandshakeError::MissingKey)?;
        Ok(HandshakeResponse::new(&key, server_id))
    }

    /// Mark the response as written.
    ///
    /// # Errors
    ///
    /// Fails unless the state is `RequestReceived`.
    pub fn complete(&mut self) -> HandshakeResult<()> {
        self.expect(HandshakeState::RequestReceived)?;
        self.state = HandshakeState::Upgraded;
        Ok(())
    }

    fn expect(&self, expected: HandshakeState) -> HandshakeResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HandshakeError::InvalidState {
                current: self.state.as_str(),
                expected: expected.as_str(),
            })
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
