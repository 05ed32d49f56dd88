//! Connect mode: reach a peer's exposed port through a local listener
//!
//! ```text
//! Resolving → Dialing → Proxying → ShuttingDown
//! ```

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ztmesh_api::TunnelRecord;
use ztmesh_proto::RouteProtocol;

use crate::mesh::resolve_peer;
use crate::session::{RelaySession, RouteRequest, SessionError};
use crate::tunnel::{validate_port, TunnelContext, TunnelError, LISTEN_HOST};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Resolving,
    Dialing,
    Proxying,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Device id, hostname or name of the exposing peer
    pub peer: String,
    /// Port the peer exposed (local or external port of its tunnel)
    pub port: u16,
    /// Local listen port, defaults to `port`
    pub local_port: Option<u16>,
}

#[derive(Debug)]
pub struct ConnectOutcome {
    pub record: TunnelRecord,
    pub local_addr: SocketAddr,
    pub connections: u64,
}

pub struct TunnelConnector {
    ctx: TunnelContext,
    options: ConnectOptions,
    state: watch::Sender<ConnectState>,
}

impl TunnelConnector {
    pub fn new(ctx: TunnelContext, options: ConnectOptions) -> Self {
        let (state, _) = watch::channel(ConnectState::Resolving);
        Self {
            ctx,
            options,
            state,
        }
    }

    pub fn state(&self) -> ConnectState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectState) {
        debug!("Connect state: {:?}", state);
        self.state.send_replace(state);
    }

    /// Find the tunnel record this connector should use
    pub async fn resolve(&self) -> Result<TunnelRecord, TunnelError> {
        let peer = self.options.peer.trim();
        if peer.is_empty() {
            return Err(TunnelError::MissingPeer);
        }
        let port = validate_port(self.options.port, "port")?;
        if let Some(local_port) = self.options.local_port {
            validate_port(local_port, "local port")?;
        }

        let device_id = resolve_peer(&self.ctx.api, peer).await;
        let tunnels = self.ctx.api.list_tunnels(Some(&device_id)).await?;

        tunnels
            .into_iter()
            .find(|t| t.device_id == device_id && t.matches_port(port))
            .ok_or_else(|| TunnelError::NoMatchingTunnel {
                peer: peer.to_string(),
                port,
            })
    }

    /// Proxy local connections to the peer until `cancel` fires or the relay
    /// session fails.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ConnectOutcome, TunnelError> {
        self.set_state(ConnectState::Resolving);
        let record = self.resolve().await?;
        info!(
            "Found tunnel {} on device {} (port {})",
            record.id, record.device_id, record.local_port
        );

        self.set_state(ConnectState::Dialing);
        let session = self.ctx.open_session().await?;

        let local_port = self.options.local_port.unwrap_or(self.options.port);
        let bind_addr = format!("{}:{}", LISTEN_HOST, local_port);
        let listener = match TcpListener::bind(&bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let _ = session.close().await;
                return Err(TunnelError::Bind {
                    addr: bind_addr,
                    source,
                });
            }
        };
        let local_addr = listener.local_addr().map_err(|source| TunnelError::Bind {
            addr: bind_addr.clone(),
            source,
        })?;

        self.set_state(ConnectState::Proxying);
        info!(
            "🌐 Listening on {} → {}:{}",
            local_addr, record.device_id, record.local_port
        );

        let run_cancel = cancel.child_token();
        let mut reader = {
            let session = session.clone();
            let run_cancel = run_cancel.clone();
            tokio::spawn(async move { session.run(run_cancel).await })
        };

        let mut connections = 0u64;
        let mut active = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutting down connector");
                    break Ok(());
                }
                finished = &mut reader => {
                    break match finished {
                        Ok(Ok(())) | Ok(Err(SessionError::Cancelled)) => Ok(()),
                        Ok(Err(e)) => Err(TunnelError::Session(e)),
                        Err(e) => Err(TunnelError::Session(SessionError::ConnectionLost(
                            format!("relay reader task failed: {}", e),
                        ))),
                    };
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        connections += 1;
                        debug!("Accepted local connection from {}", peer_addr);
                        active.spawn(proxy_connection(session.clone(), record.clone(), stream));
                    }
                    Err(e) => {
                        // Per-connection failure, keep accepting
                        warn!("Failed to accept local connection: {}", e);
                    }
                },
                Some(_) = active.join_next(), if !active.is_empty() => {}
            }
        };

        self.set_state(ConnectState::ShuttingDown);
        drop(listener);
        run_cancel.cancel();
        if let Err(e) = session.close().await {
            debug!("Error closing relay session: {}", e);
        }
        active.shutdown().await;

        result.map(|()| ConnectOutcome {
            record,
            local_addr,
            connections,
        })
    }
}

async fn proxy_connection(session: RelaySession, record: TunnelRecord, stream: TcpStream) {
    let request = RouteRequest {
        org_id: None,
        target_device: record.device_id.clone(),
        external_port: record.advertised_port(),
        target_port: record.local_port,
        protocol: RouteProtocol::Tcp,
    };

    let pending = match session.send_route_request(request).await {
        Ok(pending) => pending,
        Err(e) => {
            error!("Failed to open route to {}: {}", record.device_id, e);
            return;
        }
    };
    let route_id = pending.route_id().to_string();

    match session.forward(pending, stream).await {
        Ok(Ok(stats)) => debug!(
            route_id = %route_id,
            bytes_to_relay = stats.bytes_to_relay,
            bytes_to_local = stats.bytes_to_local,
            "Outbound route finished"
        ),
        Ok(Err(e)) => debug!(route_id = %route_id, "Outbound route ended with error: {}", e),
        Err(e) => warn!(route_id = %route_id, "Forwarder task failed: {}", e),
    }
}
