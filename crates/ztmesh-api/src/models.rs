//! Backend API models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An exposed local port, as recorded by the backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelRecord {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    /// Device that exposes the port
    #[serde(alias = "target_device_id")]
    pub device_id: String,
    #[serde(alias = "port")]
    pub local_port: u16,
    #[serde(default)]
    pub external_port: Option<u16>,
    /// Only this peer may connect, when set
    #[serde(default)]
    pub allowed_peer_device_id: Option<String>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

impl TunnelRecord {
    /// Whether this record serves `port` (local or external)
    pub fn matches_port(&self, port: u16) -> bool {
        self.local_port == port || self.external_port == Some(port)
    }

    /// Port connectors should request on the relay
    pub fn advertised_port(&self) -> u16 {
        self.external_port.unwrap_or(self.local_port)
    }
}

/// Body of `POST /tunnels`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateTunnelRequest {
    pub port: u16,
    pub name: String,
    pub target_device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_peer_device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,
    pub protocol: String,
    pub public: bool,
}

/// Short-lived relay credential from `GET /auth/derp-tunnel-token`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Relay endpoint the token is valid for, when the backend pins one
    #[serde(default)]
    pub relay_url: Option<String>,
}

/// A peer's registered presence in the mesh
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeshNode {
    pub device_id: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type", alias = "node_type")]
    pub node_type: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub is_exit_node: bool,
    #[serde(default)]
    pub advertise_exit_routes: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl MeshNode {
    /// Whether a human-given reference names this node
    pub fn matches_reference(&self, reference: &str) -> bool {
        self.device_id == reference
            || self
                .hostname
                .as_deref()
                .is_some_and(|h| h.eq_ignore_ascii_case(reference))
            || self
                .name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(reference))
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.hostname.as_deref())
            .unwrap_or(&self.device_id)
    }
}

/// Body of `POST /mesh/nodes/register`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterNodeRequest {
    pub device_id: String,
    pub hostname: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub capabilities: Vec<String>,
    pub is_exit_node: bool,
}

/// Body of `POST /mesh/nodes/ping`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PingNodeRequest {
    pub device_id: String,
}

/// List endpoints answer either with a bare array or a wrapped object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ListResponse<T> {
    Bare(Vec<T>),
    Wrapped {
        #[serde(alias = "tunnels", alias = "nodes", alias = "data")]
        items: Vec<T>,
    },
}

impl<T> ListResponse<T> {
    pub(crate) fn into_vec(self) -> Vec<T> {
        match self {
            ListResponse::Bare(items) => items,
            ListResponse::Wrapped { items } => items,
        }
    }
}

/// Error body returned by the backend
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(alias = "message")]
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunnel_record_minimal_json() {
        let record: TunnelRecord = serde_json::from_str(
            r#"{"id": 1, "port": 8080, "target_device_id": "A", "status": "active"}"#,
        )
        .unwrap();

        assert_eq!(record.id, 1);
        assert_eq!(record.local_port, 8080);
        assert_eq!(record.device_id, "A");
        assert_eq!(record.protocol, "TCP");
        assert!(record.matches_port(8080));
        assert!(!record.matches_port(9090));
        assert_eq!(record.advertised_port(), 8080);
    }

    #[test]
    fn test_external_port_matches() {
        let record = TunnelRecord {
            id: 7,
            name: "db".to_string(),
            device_id: "A".to_string(),
            local_port: 5432,
            external_port: Some(15432),
            allowed_peer_device_id: None,
            protocol: "TCP".to_string(),
            is_public: false,
            public_url: None,
            status: "active".to_string(),
            created_at: None,
            updated_at: None,
        };

        assert!(record.matches_port(5432));
        assert!(record.matches_port(15432));
        assert_eq!(record.advertised_port(), 15432);
    }

    #[test]
    fn test_list_response_shapes() {
        let bare: ListResponse<PingNodeRequest> =
            serde_json::from_str(r#"[{"device_id": "a"}]"#).unwrap();
        assert_eq!(bare.into_vec().len(), 1);

        let wrapped: ListResponse<PingNodeRequest> =
            serde_json::from_str(r#"{"nodes": [{"device_id": "a"}, {"device_id": "b"}]}"#)
                .unwrap();
        assert_eq!(wrapped.into_vec().len(), 2);
    }

    #[test]
    fn test_mesh_node_reference() {
        let node: MeshNode = serde_json::from_str(
            r#"{"device_id": "dev-123", "hostname": "Build-Box", "type": "cli", "status": "online"}"#,
        )
        .unwrap();

        assert!(node.matches_reference("dev-123"));
        assert!(node.matches_reference("build-box"));
        assert!(!node.matches_reference("other"));
        assert_eq!(node.display_name(), "Build-Box");
        assert_eq!(node.node_type.as_deref(), Some("cli"));
    }

    #[test]
    fn test_create_request_skips_empty_options() {
        let req = CreateTunnelRequest {
            port: 8080,
            name: "web".to_string(),
            target_device_id: "A".to_string(),
            allowed_peer_device_id: None,
            external_port: None,
            protocol: "TCP".to_string(),
            public: false,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("allowed_peer_device_id").is_none());
        assert!(json.get("external_port").is_none());
        assert_eq!(json["port"], 8080);
    }
}
