//! Mesh presence and peer lookup
//!
//! Presence is kept fresh out of band, against the backend registry, not
//! through the relay protocol.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ztmesh_api::{ApiClient, ApiError, MeshNode, RegisterNodeRequest};
use ztmesh_proto::Capability;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Registers this device with the mesh registry and keeps it marked online
#[derive(Debug, Clone)]
pub struct MeshPresence {
    api: ApiClient,
    device_id: String,
    hostname: String,
    interval: Duration,
}

impl MeshPresence {
    pub fn new(api: ApiClient, device_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            api,
            device_id: device_id.into(),
            hostname: hostname.into(),
            interval: DEFAULT_PING_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn register(&self, capabilities: &[Capability]) -> Result<(), ApiError> {
        self.api
            .register_mesh_node(&RegisterNodeRequest {
                device_id: self.device_id.clone(),
                hostname: self.hostname.clone(),
                node_type: "cli".to_string(),
                capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
                is_exit_node: false,
            })
            .await?;
        info!("Registered {} with the mesh as {}", self.device_id, self.hostname);
        Ok(())
    }

    /// Ping the registry every interval until `cancel` fires
    pub fn spawn_keepalive(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let presence = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(presence.interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match presence.api.ping_mesh_node(&presence.device_id).await {
                            Ok(()) => debug!("Mesh keepalive sent"),
                            Err(e) => warn!("Mesh keepalive failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}

/// Pick the node a human-given reference names: device id first, then
/// hostname or display name, case-insensitive.
pub fn find_peer<'a>(nodes: &'a [MeshNode], reference: &str) -> Option<&'a MeshNode> {
    nodes
        .iter()
        .find(|n| n.device_id == reference)
        .or_else(|| nodes.iter().find(|n| n.matches_reference(reference)))
}

/// Resolve a peer reference to a device id. References the registry does not
/// know, or cannot be checked, are used verbatim.
pub async fn resolve_peer(api: &ApiClient, reference: &str) -> String {
    match api.list_mesh_nodes().await {
        Ok(nodes) => match find_peer(&nodes, reference) {
            Some(node) => {
                if node.device_id != reference {
                    info!(
                        "Resolved peer '{}' to device {}",
                        reference, node.device_id
                    );
                }
                node.device_id.clone()
            }
            None => {
                debug!("Peer '{}' not in mesh registry, using as device id", reference);
                reference.to_string()
            }
        },
        Err(e) => {
            warn!("Could not list mesh peers ({}), using '{}' as device id", e, reference);
            reference.to_string()
        }
    }
}
