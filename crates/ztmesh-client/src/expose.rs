//! Expose mode: publish a local port to the mesh
//!
//! ```text
//! Created → Registering → Listening → ShuttingDown → Deleted
//! ```
//!
//! Inbound routes are only ever bridged to the exposed port, and only for
//! the peer the tunnel is restricted to, if any.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ztmesh_api::{CreateTunnelRequest, TunnelRecord};
use ztmesh_proto::{Capability, RouteProtocol};

use crate::mesh::resolve_peer;
use crate::session::{InboundRouteHandler, PendingRoute, RelaySession, SessionError};
use crate::tunnel::{dial_local, validate_port, TunnelContext, TunnelError};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposeState {
    Created,
    Registering,
    Listening,
    ShuttingDown,
    Deleted,
}

#[derive(Debug, Clone, Default)]
pub struct ExposeOptions {
    pub port: u16,
    pub name: Option<String>,
    /// Only this peer (device id, hostname or name) may connect
    pub to_peer: Option<String>,
    pub external_port: Option<u16>,
    pub public: bool,
}

impl ExposeOptions {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    fn tunnel_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("port-{}", self.port))
    }
}

/// Result of a finished expose run
#[derive(Debug)]
pub struct ExposeOutcome {
    pub record: TunnelRecord,
    /// Set when the tunnel record could not be deleted
    pub cleanup_error: Option<String>,
}

pub struct Exposer {
    ctx: TunnelContext,
    options: ExposeOptions,
    state: watch::Sender<ExposeState>,
}

impl Exposer {
    pub fn new(ctx: TunnelContext, options: ExposeOptions) -> Self {
        let (state, _) = watch::channel(ExposeState::Created);
        Self {
            ctx,
            options,
            state,
        }
    }

    pub fn state(&self) -> ExposeState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExposeState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ExposeState) {
        debug!("Expose state: {:?}", state);
        self.state.send_replace(state);
    }

    /// Expose the port until `cancel` fires or the relay session fails.
    ///
    /// The tunnel record is deleted on every exit path once it was created.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ExposeOutcome, TunnelError> {
        let port = validate_port(self.options.port, "port")?;
        if let Some(external) = self.options.external_port {
            validate_port(external, "external port")?;
        }

        let allowed_peer = match &self.options.to_peer {
            Some(peer) if peer.trim().is_empty() => return Err(TunnelError::MissingPeer),
            Some(peer) => Some(resolve_peer(&self.ctx.api, peer).await),
            None => None,
        };

        self.set_state(ExposeState::Registering);
        let record = self
            .ctx
            .api
            .create_tunnel(&CreateTunnelRequest {
                port,
                name: self.options.tunnel_name(),
                target_device_id: self.ctx.device_id.clone(),
                allowed_peer_device_id: allowed_peer.clone(),
                external_port: self.options.external_port,
                protocol: RouteProtocol::Tcp.to_string(),
                public: self.options.public,
            })
            .await?;
        info!(
            "✅ Tunnel {} created for port {} (id {})",
            record.name, record.local_port, record.id
        );
        if let Some(url) = &record.public_url {
            info!("🌐 Public URL: {}", url);
        }

        let presence = self.ctx.presence();
        if let Err(e) = presence.register(&Capability::defaults()).await {
            warn!("Mesh registration failed: {}", e);
        }
        let keepalive_cancel = cancel.child_token();
        let keepalive = presence.spawn_keepalive(keepalive_cancel.clone());

        let result = self.serve(port, allowed_peer, cancel).await;

        self.set_state(ExposeState::ShuttingDown);
        keepalive_cancel.cancel();
        let _ = keepalive.await;

        let cleanup_error = match self.ctx.api.delete_tunnel(record.id).await {
            Ok(()) => {
                info!("Tunnel {} deleted", record.id);
                None
            }
            Err(e) => {
                warn!("Failed to delete tunnel {}: {}", record.id, e);
                Some(e.to_string())
            }
        };
        self.set_state(ExposeState::Deleted);

        result.map(|()| ExposeOutcome {
            record,
            cleanup_error,
        })
    }

    async fn serve(
        &self,
        port: u16,
        allowed_peer: Option<String>,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        let session = self.ctx.open_session().await?;
        session.set_inbound_handler(Arc::new(ExposeHandler {
            port,
            allowed_peer,
        }));

        self.set_state(ExposeState::Listening);
        info!("🔗 Exposing localhost:{} through the relay", port);

        let result = session.run(cancel).await;
        if let Err(e) = session.close().await {
            debug!("Error closing relay session: {}", e);
        }

        match result {
            Ok(()) | Err(SessionError::Cancelled) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Dials the exposed port for each inbound route the policy allows
struct ExposeHandler {
    port: u16,
    allowed_peer: Option<String>,
}

impl ExposeHandler {
    fn refusal(&self, route: &PendingRoute) -> Option<String> {
        let setup = route.setup();
        if setup.target_port != self.port {
            return Some(format!("port {} is not exposed", setup.target_port));
        }
        match &self.allowed_peer {
            Some(peer) if peer != &setup.source_device => Some(format!(
                "device {} is not allowed on this tunnel",
                setup.source_device
            )),
            _ => None,
        }
    }
}

#[async_trait]
impl InboundRouteHandler for ExposeHandler {
    async fn handle_route(&self, session: RelaySession, route: PendingRoute) {
        let route_id = route.route_id().to_string();

        if let Some(reason) = self.refusal(&route) {
            warn!(route_id = %route_id, "Refusing route: {}", reason);
            drop(route);
            let _ = session.reset_route(&route_id, &reason).await;
            return;
        }

        let address = format!("localhost:{}", self.port);
        let dial = tokio::time::timeout(DIAL_TIMEOUT, dial_local(self.port));
        let stream = tokio::select! {
            _ = route.cancellation().cancelled() => {
                debug!(route_id = %route_id, "Route cancelled while dialing");
                return;
            }
            dialed = dial => match dialed {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    warn!(route_id = %route_id, address = %address, "Failed to dial local target: {}", e);
                    drop(route);
                    let _ = session
                        .reset_route(&route_id, &format!("dial {} failed: {}", address, e))
                        .await;
                    return;
                }
                Err(_) => {
                    warn!(route_id = %route_id, address = %address, "Timed out dialing local target");
                    drop(route);
                    let _ = session
                        .reset_route(&route_id, &format!("dial {} timed out", address))
                        .await;
                    return;
                }
            },
        };

        debug!(route_id = %route_id, address = %address, "Connected to local target");
        match session.forward(route, stream).await {
            Ok(Ok(stats)) => debug!(
                route_id = %route_id,
                bytes_to_relay = stats.bytes_to_relay,
                bytes_to_local = stats.bytes_to_local,
                "Inbound route finished"
            ),
            Ok(Err(e)) => debug!(route_id = %route_id, "Inbound route ended with error: {}", e),
            Err(e) => warn!(route_id = %route_id, "Forwarder task failed: {}", e),
        }
    }
}
