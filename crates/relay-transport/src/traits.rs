//! Raw socket abstraction for Relay.
//!
//! A connection runs on top of two halves of a duplex message socket: a
//! sink of outgoing [`RawFrame`]s and a stream of incoming ones. The
//! WebSocket adapters and the in-memory transport all produce these two
//! halves, which keeps [`Connection`](crate::Connection) transport-agnostic.

use axum::http::HeaderMap;
use bytes::Bytes;
use futures_util::{Sink, Stream};
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use thiserror::Error;

/// Number of random bytes in a correlation id (128 bits).
const CORRELATION_ID_BYTES: usize = 16;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", random_hex(8)))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Generate a correlation id with 128 bits of entropy, hex encoded.
#[must_use]
pub fn generate_correlation_id() -> String {
    random_hex(CORRELATION_ID_BYTES)
}

fn random_hex(len: usize) -> String {
    use rand::RngCore;

    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// A single message on the raw socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    /// Encoded Relay frame.
    Data(Bytes),
    /// Transport ping.
    Ping(Bytes),
    /// Transport pong.
    Pong(Bytes),
    /// Close handshake.
    Close,
}

/// Outgoing half of a raw socket.
pub type SocketSink = Pin<Box<dyn Sink<RawFrame, Error = TransportError> + Send>>;

/// Incoming half of a raw socket.
pub type SocketStream = Pin<Box<dyn Stream<Item = Result<RawFrame, TransportError>> + Send>>;

/// Metadata captured when a connection is established.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    /// Headers of the upgrade (server) or dial (client) request.
    pub headers: HeaderMap,
    /// Remote address, if the transport knows it.
    pub remote_addr: Option<SocketAddr>,
}

impl ConnectionMeta {
    /// Create metadata from request headers.
    #[must_use]
    pub fn new(headers: HeaderMap) -> Self {
        Self {
            headers,
            remote_addr: None,
        }
    }

    /// Attach the remote address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Look up a header value as a string.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No frame arrived before the read deadline.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// WebSocket handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_id_from_string() {
        let id: ConnectionId = "test-id".into();
        assert_eq!(id.as_str(), "test-id");
    }

    #[test]
    fn test_correlation_id_entropy() {
        let id = generate_correlation_id();
        assert_eq!(id.len(), CORRELATION_ID_BYTES * 2);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_correlation_id());
    }

    #[test]
    fn test_meta_header_lookup() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user", "alice".parse().unwrap());
        let meta = ConnectionMeta::new(headers);
        assert_eq!(meta.header("x-user"), Some("alice"));
        assert_eq!(meta.header("x-missing"), None);
    }
}
