//! Route forwarder
//!
//! Bridges one local TCP socket and one route of the relay session. Both
//! directions run concurrently:
//!
//! - local → relay: 16KB reads become TrafficData frames; local EOF becomes
//!   a single empty frame (half-close)
//! - relay → local: payloads are written to the socket; an empty payload
//!   shuts down the socket's write half so the local peer sees EOF
//!
//! An error in either direction cancels the route. The forwarder owns the
//! socket and removes the route from the table when both directions end.

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use ztmesh_proto::RouteId;

use crate::error::ErrorKind;
use crate::route_table::Lifecycle;
use crate::session::{RelaySession, SessionError};

const CHUNK_SIZE: usize = 16 * 1024;

/// Errors that can occur while forwarding a route
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),

    #[error("Relay session error: {0}")]
    Session(#[from] SessionError),

    #[error("Route was closed before forwarding started")]
    RouteClosed,
}

impl ForwarderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ForwarderError::Io(_) => ErrorKind::LocalResource,
            ForwarderError::Session(e) => e.kind(),
            ForwarderError::RouteClosed => ErrorKind::Protocol,
        }
    }
}

/// Byte counts of a finished route
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub bytes_to_relay: u64,
    pub bytes_to_local: u64,
}

pub struct RouteForwarder {
    session: RelaySession,
    route_id: RouteId,
    stream: TcpStream,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
}

impl RouteForwarder {
    pub(crate) fn new(
        session: RelaySession,
        route_id: RouteId,
        stream: TcpStream,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            route_id,
            stream,
            inbound,
            cancel,
        }
    }

    pub async fn run(self) -> Result<ForwardStats, ForwarderError> {
        let Self {
            session,
            route_id,
            mut stream,
            mut inbound,
            cancel,
        } = self;
        let routes = session.routes().clone();

        if cancel.is_cancelled() {
            routes.remove(&route_id);
            return Err(ForwarderError::RouteClosed);
        }

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(route_id = %route_id, "Failed to set TCP_NODELAY: {}", e);
        }

        routes.set_lifecycle(&route_id, Lifecycle::Established);
        tracing::debug!(route_id = %route_id, "Route established");

        let (mut local_read, mut local_write) = stream.split();

        let local_to_relay = async {
            let mut total_bytes = 0u64;
            let mut buffer = vec![0u8; CHUNK_SIZE];
            let mut eof_sent = false;

            let result = loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => break Ok(()),
                    read = local_read.read(&mut buffer) => read,
                };

                match read {
                    Ok(0) => {
                        tracing::debug!(route_id = %route_id, "Local side closed, sending end of stream");
                        eof_sent = true;
                        if let Err(e) = session.send_traffic_data(&route_id, Bytes::new()).await {
                            cancel.cancel();
                            break Err(ForwarderError::Session(e));
                        }
                        routes.set_lifecycle(&route_id, Lifecycle::HalfClosed);
                        break Ok(());
                    }
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buffer[..n]);
                        if let Err(e) = session.send_traffic_data(&route_id, chunk).await {
                            cancel.cancel();
                            break Err(ForwarderError::Session(e));
                        }
                        total_bytes += n as u64;
                        tracing::trace!(route_id = %route_id, bytes = n, "Local → relay");
                    }
                    Err(e) => {
                        tracing::debug!(route_id = %route_id, "Error reading local socket: {}", e);
                        cancel.cancel();
                        break Err(ForwarderError::Io(e));
                    }
                }
            };

            if !eof_sent {
                // Best effort so the remote side tears down too
                let _ = session.send_traffic_data(&route_id, Bytes::new()).await;
            }

            result.map(|()| total_bytes)
        };

        let relay_to_local = async {
            let mut total_bytes = 0u64;

            let result = loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break Ok(()),
                    next = inbound.recv() => next,
                };

                match next {
                    Some(payload) if payload.is_empty() => {
                        tracing::debug!(route_id = %route_id, "Remote side closed, shutting down local write half");
                        if let Err(e) = local_write.shutdown().await {
                            tracing::debug!(route_id = %route_id, "Shutdown of local write half failed: {}", e);
                        }
                        routes.set_lifecycle(&route_id, Lifecycle::HalfClosed);
                        break Ok(());
                    }
                    Some(payload) => {
                        if let Err(e) = local_write.write_all(&payload).await {
                            tracing::debug!(route_id = %route_id, "Error writing local socket: {}", e);
                            cancel.cancel();
                            break Err(ForwarderError::Io(e));
                        }
                        total_bytes += payload.len() as u64;
                        tracing::trace!(route_id = %route_id, bytes = payload.len(), "Relay → local");
                    }
                    // Route removed from the table (reset or session closing)
                    None => break Ok(()),
                }
            };

            result.map(|()| total_bytes)
        };

        let (to_relay, to_local) = tokio::join!(local_to_relay, relay_to_local);

        drop(stream);
        routes.remove(&route_id);

        let stats = ForwardStats {
            bytes_to_relay: *to_relay.as_ref().unwrap_or(&0),
            bytes_to_local: *to_local.as_ref().unwrap_or(&0),
        };

        tracing::info!(
            route_id = %route_id,
            bytes_to_relay = stats.bytes_to_relay,
            bytes_to_local = stats.bytes_to_local,
            "Route closed"
        );

        to_relay?;
        to_local?;
        Ok(stats)
    }
}
