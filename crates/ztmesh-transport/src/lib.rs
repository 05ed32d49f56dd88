//! Relay transport abstraction
//!
//! The relay session only needs a duplex channel of whole frames: something
//! that writes one frame at a time and something that yields one frame at a
//! time. These traits keep the session independent of the concrete
//! transport. The production transport is a WebSocket (`wss://<relay>/derp`);
//! an in-memory pair is provided for tests and embedding.
//!
//! ```text
//! RelaySession ──► FrameSink   (single writer task)
//!              ◄── FrameSource (single reader loop)
//!                      │
//!          ┌───────────┴───────────┐
//!   WebSocketConnector      MemoryConnector
//! ```

pub mod memory;
pub mod tls;
pub mod websocket;

pub use memory::{MemoryConnector, MemoryEndpoint};
pub use websocket::{WebSocketConfig, WebSocketConnector};

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Write half of a relay connection. One frame per call; frames are never
/// split or interleaved.
#[async_trait]
pub trait FrameSink: Send + Debug {
    async fn send_frame(&mut self, frame: Bytes) -> TransportResult<()>;

    /// Close the connection gracefully
    async fn close(&mut self) -> TransportResult<()>;
}

/// Read half of a relay connection
#[async_trait]
pub trait FrameSource: Send + Debug {
    /// Receive the next frame. `None` means the remote closed the connection.
    async fn recv_frame(&mut self) -> TransportResult<Option<Bytes>>;
}

/// Both halves of an established relay connection
pub type FramePair = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Parameters for dialing the relay
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Relay endpoint, e.g. `wss://relay.example/derp`
    pub endpoint: Url,
    /// Extra headers sent with the upgrade request (auth, session, org)
    pub headers: Vec<(String, String)>,
    /// Skip certificate verification (explicit opt-in only)
    pub tls_insecure: bool,
    pub connect_timeout: Duration,
}

impl ConnectRequest {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            headers: Vec::new(),
            tls_insecure: false,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.tls_insecure = insecure;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Look up a header value (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Dials the relay and hands back the two halves of the connection
#[async_trait]
pub trait RelayConnector: Send + Sync + Debug {
    async fn connect(&self, request: &ConnectRequest) -> TransportResult<FramePair>;

    /// Transport name for logging
    fn name(&self) -> &str;
}
