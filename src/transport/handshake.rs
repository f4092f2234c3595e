//! HTTP request heads and the upgrade handshake.
//!
//! Every inbound TCP connection starts with an HTTP/1.1 request head. The
//! server reads it, routes on the path, and either answers with a plain
//! HTTP response or upgrades the socket with a `101 Switching Protocols`.
//!
//! # Upgrade Checks
//!
//! Checked in order, first failure wins:
//!
//! 1. `Connection` contains `upgrade`
//! 2. `Upgrade` contains `websocket`
//! 3. method is `GET`
//! 4. `Sec-WebSocket-Version` contains `13`
//! 5. `Sec-WebSocket-Key` present and non-empty
//!
//! Header names and token matches are ASCII case-insensitive.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rustc_hash::FxHashMap;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// GUID appended to the client key before hashing (RFC 6455 §1.3).
const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum number of headers parsed from one request.
const MAX_HEADERS: usize = 32;

/// Read size while collecting the request head.
const READ_CHUNK: usize = 1024;

// ============================================================================
// RequestHead
// ============================================================================

/// Parsed HTTP request line and headers.
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    /// Request method (`GET`, `POST`, ...).
    pub method: String,
    /// Path without the query string.
    pub path: String,
    /// Query parameters; the first occurrence of a key wins.
    pub query: FxHashMap<String, String>,
    /// Headers in arrival order.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Parses a request head from the start of `buf`.
    ///
    /// Returns `Ok(None)` if more bytes are needed, otherwise the head and
    /// the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if the bytes are not a valid request.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        let consumed = match request.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(Error::handshake(format!("malformed request: {e}"))),
        };

        let method = request.method.unwrap_or_default().to_string();
        let target = request.path.unwrap_or_default();
        let (path, query_string) = target.split_once('?').unwrap_or((target, ""));

        let mut query = FxHashMap::default();
        for (key, value) in url::form_urlencoded::parse(query_string.as_bytes()) {
            query
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }

        let headers = request
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();

        Ok(Some((
            Self {
                method,
                path: path.to_string(),
                query,
                headers,
            },
            consumed,
        )))
    }

    /// Returns all values of a header (name is case-insensitive).
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the first value of a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns a query parameter.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Returns `true` if any value of `name` contains `token`.
    #[must_use]
    pub fn header_contains(&self, name: &str, token: &str) -> bool {
        let token = token.to_ascii_lowercase();
        self.header_values(name)
            .any(|v| v.to_ascii_lowercase().contains(&token))
    }

    /// Runs the upgrade checks and returns the client key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] naming the first failed check.
    pub fn validate_upgrade(&self) -> Result<&str> {
        if !self.header_contains("Connection", "upgrade") {
            return Err(Error::handshake(
                "'upgrade' token not found in 'Connection' header",
            ));
        }

        if !self.header_contains("Upgrade", "websocket") {
            return Err(Error::handshake(
                "'websocket' token not found in 'Upgrade' header",
            ));
        }

        if self.method != "GET" {
            return Err(Error::handshake("request method is not GET"));
        }

        if !self.header_contains("Sec-WebSocket-Version", "13") {
            return Err(Error::handshake(
                "unsupported version: 13 not found in 'Sec-WebSocket-Version' header",
            ));
        }

        match self.header("Sec-WebSocket-Key").map(str::trim) {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(Error::handshake(
                "'Sec-WebSocket-Key' header is missing or blank",
            )),
        }
    }
}

/// Computes `Sec-WebSocket-Accept` for a client key.
#[must_use]
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(ACCEPT_GUID);
    BASE64.encode(hasher.finalize())
}

// ============================================================================
// IncomingRequest
// ============================================================================

/// An accepted socket whose request head has been read.
#[derive(Debug)]
pub struct IncomingRequest {
    /// Parsed request head.
    head: RequestHead,
    /// The socket, positioned after whatever was read.
    stream: TcpStream,
    /// Bytes that arrived after the head.
    buffered: Vec<u8>,
    /// Remote address.
    peer: SocketAddr,
}

impl IncomingRequest {
    /// Reads a request head from a freshly accepted socket.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the peer hangs up mid-head
    /// - [`Error::Handshake`] if the head is malformed or exceeds `max_header_bytes`
    /// - [`Error::Io`] on socket errors
    pub async fn read(mut stream: TcpStream, peer: SocketAddr, max_header_bytes: usize) -> Result<Self> {
        let mut buf = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            buf.extend_from_slice(&chunk[..n]);

            if let Some((head, consumed)) = RequestHead::parse(&buf)? {
                let buffered = buf.split_off(consumed);
                trace!(?peer, method = %head.method, path = %head.path, "Request head read");
                return Ok(Self {
                    head,
                    stream,
                    buffered,
                    peer,
                });
            }

            if buf.len() >= max_header_bytes {
                return Err(Error::handshake(format!(
                    "request head exceeds {max_header_bytes} bytes"
                )));
            }
        }
    }

    /// Returns the parsed head.
    #[inline]
    #[must_use]
    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Returns the remote address.
    #[inline]
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Runs every upgrade check without touching the socket.
    ///
    /// Returns the client key on success, so a failed request can still be
    /// answered with [`respond`](Self::respond).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] if a header check fails or the peer
    /// sent data before the handshake completed.
    pub fn check_upgrade(&self) -> Result<&str> {
        let key = self.head.validate_upgrade()?;

        if !self.buffered.is_empty() {
            return Err(Error::handshake(
                "client sent data before handshake is complete",
            ));
        }

        Ok(key)
    }

    /// Completes the upgrade handshake and hands back the raw socket.
    ///
    /// No I/O deadline set while reading the head carries over to the
    /// returned socket.
    ///
    /// # Errors
    ///
    /// - [`Error::Handshake`] if [`check_upgrade`](Self::check_upgrade) fails
    /// - [`Error::Io`] if writing the response fails
    pub async fn upgrade(self) -> Result<TcpStream> {
        let key = self.check_upgrade()?;

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(key)
        );

        let mut stream = self.stream;
        stream.write_all(response.as_bytes()).await?;

        debug!(peer = ?self.peer, path = %self.head.path, "Connection upgraded");

        Ok(stream)
    }

    /// Answers with a plain HTTP response and closes the socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if writing fails.
    pub async fn respond(self, status: u16, reason: &str, body: &str) -> Result<()> {
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        );

        let mut stream = self.stream;
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
