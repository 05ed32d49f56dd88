//! WebSocket relay transport using tokio-tungstenite
//!
//! One binary WebSocket message carries exactly one relay frame, so frame
//! boundaries are preserved by the transport itself.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};

use crate::{
    tls, ConnectRequest, FramePair, FrameSink, FrameSource, RelayConnector, TransportError,
    TransportResult,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket-specific configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Disable Nagle on the underlying TCP socket
    pub disable_nagle: bool,
    /// Upper bound applied on top of the request's own connect timeout
    pub max_connect_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            disable_nagle: true,
            max_connect_timeout: Duration::from_secs(30),
        }
    }
}

/// WebSocket connector for the relay endpoint
#[derive(Debug, Default)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    fn tls_connector(request: &ConnectRequest) -> TransportResult<Connector> {
        match request.endpoint.scheme() {
            "wss" => Ok(Connector::Rustls(tls::client_config(request.tls_insecure)?)),
            "ws" => Ok(Connector::Plain),
            other => Err(TransportError::ConfigurationError(format!(
                "Unsupported relay URL scheme '{}' (expected ws:// or wss://)",
                other
            ))),
        }
    }
}

#[async_trait]
impl RelayConnector for WebSocketConnector {
    async fn connect(&self, request: &ConnectRequest) -> TransportResult<FramePair> {
        let connector = Self::tls_connector(request)?;

        let mut ws_request = request
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid URL: {}", e)))?;

        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::ConfigurationError(format!("Invalid header name {}: {}", name, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                TransportError::ConfigurationError(format!("Invalid header value: {}", e))
            })?;
            ws_request.headers_mut().insert(name, value);
        }

        debug!("Connecting to relay: {}", request.endpoint);

        let timeout = request.connect_timeout.min(self.config.max_connect_timeout);
        let (ws_stream, _response) = tokio::time::timeout(
            timeout,
            tokio_tungstenite::connect_async_tls_with_config(
                ws_request,
                None,
                self.config.disable_nagle,
                Some(connector),
            ),
        )
        .await
        .map_err(|_| {
            TransportError::Timeout(format!(
                "Connecting to {} took longer than {}s",
                request.endpoint,
                timeout.as_secs()
            ))
        })?
        .map_err(map_handshake_error)?;

        info!("WebSocket connection established to {}", request.endpoint);

        let (sink, source) = ws_stream.split();
        Ok((
            Box::new(WebSocketSink { sink, closed: false }),
            Box::new(WebSocketSource { source }),
        ))
    }

    fn name(&self) -> &str {
        "WebSocket"
    }
}

fn map_handshake_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            TransportError::AuthenticationFailed(format!(
                "Relay rejected credential (HTTP {})",
                response.status()
            ))
        }
        WsError::Http(response) => TransportError::ConnectionError(format!(
            "Relay upgrade failed (HTTP {})",
            response.status()
        )),
        WsError::Io(e) => TransportError::IoError(e),
        other => TransportError::ConnectionError(format!("WebSocket handshake failed: {}", other)),
    }
}

/// Write half of a relay WebSocket
pub struct WebSocketSink {
    sink: SplitSink<WsStream, Message>,
    closed: bool,
}

impl std::fmt::Debug for WebSocketSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSink")
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_frame(&mut self, frame: Bytes) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        self.sink
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => {
                    TransportError::ConnectionClosed
                }
                other => TransportError::ConnectionError(format!("WebSocket send error: {}", other)),
            })
    }

    async fn close(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::ConnectionError(format!(
                "WebSocket close error: {}",
                e
            ))),
        }
    }
}

/// Read half of a relay WebSocket
pub struct WebSocketSource {
    source: SplitStream<WsStream>,
}

impl std::fmt::Debug for WebSocketSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSource").finish()
    }
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn recv_frame(&mut self) -> TransportResult<Option<Bytes>> {
        while let Some(result) = self.source.next().await {
            match result {
                Ok(Message::Binary(data)) => return Ok(Some(Bytes::from(data))),
                Ok(Message::Ping(_)) => {
                    // Pong is handled by tungstenite
                    trace!("Received WebSocket ping");
                }
                Ok(Message::Pong(_)) => trace!("Received WebSocket pong"),
                Ok(Message::Close(frame)) => {
                    debug!("Relay closed WebSocket: {:?}", frame);
                    return Ok(None);
                }
                Ok(_) => {
                    // Text and raw frames are not part of the relay protocol
                    trace!("Ignoring non-binary WebSocket message");
                }
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return Ok(None),
                Err(e) => {
                    return Err(TransportError::ConnectionError(format!(
                        "WebSocket read error: {}",
                        e
                    )))
                }
            }
        }

        Ok(None)
    }
}
