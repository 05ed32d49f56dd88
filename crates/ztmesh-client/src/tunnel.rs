//! Shared plumbing for the expose and connect orchestrators

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;
use ztmesh_api::{ApiClient, ApiError};
use ztmesh_transport::RelayConnector;

use crate::credentials::CredentialSource;
use crate::error::ErrorKind;
use crate::mesh::{MeshPresence, DEFAULT_PING_INTERVAL};
use crate::session::{RelaySession, SessionConfig, SessionError};

/// Host the connector's local listener binds to
pub const LISTEN_HOST: &str = "127.0.0.1";

/// Dial the exposed service on `localhost`, over IPv4 loopback first and
/// then IPv6 loopback
pub(crate) async fn dial_local(port: u16) -> std::io::Result<TcpStream> {
    let candidates = [
        SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        SocketAddr::from((Ipv6Addr::LOCALHOST, port)),
    ];
    TcpStream::connect(&candidates[..]).await
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("A peer reference is required")]
    MissingPeer,

    #[error("No tunnel on port {port} found for peer {peer}")]
    NoMatchingTunnel { peer: String, port: u16 },

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Failed to bind local listener on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::InvalidPort(_)
            | TunnelError::MissingPeer
            | TunnelError::NoMatchingTunnel { .. } => ErrorKind::Application,
            TunnelError::Api(e) if e.is_unauthorized() => ErrorKind::Authentication,
            TunnelError::Api(_) => ErrorKind::Transport,
            TunnelError::Session(e) => e.kind(),
            TunnelError::Bind { .. } => ErrorKind::LocalResource,
        }
    }
}

pub(crate) fn validate_port(port: u16, what: &str) -> Result<u16, TunnelError> {
    if port == 0 {
        return Err(TunnelError::InvalidPort(format!(
            "{} must be between 1 and 65535",
            what
        )));
    }
    Ok(port)
}

/// Collaborators and identity shared by both tunnel modes
#[derive(Debug, Clone)]
pub struct TunnelContext {
    pub api: ApiClient,
    pub connector: Arc<dyn RelayConnector>,
    /// Relay endpoint, e.g. `wss://relay.example/derp`
    pub relay_url: Url,
    pub device_id: String,
    pub hostname: String,
    pub tls_insecure: bool,
    pub token_timeout: Duration,
    pub mesh_ping_interval: Duration,
}

impl TunnelContext {
    pub fn new(
        api: ApiClient,
        connector: Arc<dyn RelayConnector>,
        relay_url: Url,
        device_id: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            api,
            connector,
            relay_url,
            device_id: device_id.into(),
            hostname: hostname.into(),
            tls_insecure: false,
            token_timeout: crate::credentials::TOKEN_FETCH_TIMEOUT,
            mesh_ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.tls_insecure = insecure;
        self
    }

    pub fn presence(&self) -> MeshPresence {
        MeshPresence::new(self.api.clone(), self.device_id.clone(), self.hostname.clone())
            .with_interval(self.mesh_ping_interval)
    }

    /// Acquire a credential and open a registered relay session.
    ///
    /// A relay endpoint pinned to the credential wins over `relay_url`.
    pub async fn open_session(&self) -> Result<RelaySession, SessionError> {
        let access = CredentialSource::new(&self.api)
            .with_timeout(self.token_timeout)
            .acquire_access(&self.device_id)
            .await;
        let endpoint = match access.endpoint {
            Some(pinned) => {
                debug!("Relay token is pinned to {}", pinned);
                pinned
            }
            None => self.relay_url.clone(),
        };
        debug!("Opening relay session with {}", access.credential.describe());

        let api_config = self.api.config();
        let config = SessionConfig::new(endpoint, self.device_id.clone(), access.credential)
            .with_session_id(api_config.session_id.clone())
            .with_org_id(api_config.org_id.clone())
            .with_insecure(self.tls_insecure);

        RelaySession::connect(config, self.connector.as_ref()).await
    }
}
