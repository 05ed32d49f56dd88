//! Relay frame types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Route identifier, unique within one relay session
pub type RouteId = String;

/// Frame kind discriminant (second byte of every encoded frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    RouteSetup = 1,
    TrafficData = 2,
    Control = 3,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameKind::RouteSetup),
            2 => Some(FrameKind::TrafficData),
            3 => Some(FrameKind::Control),
            _ => None,
        }
    }
}

/// A single frame on the relay connection
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    RouteSetup(RouteSetup),
    TrafficData(TrafficData),
    Control(ControlMessage),
}

impl RelayFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            RelayFrame::RouteSetup(_) => FrameKind::RouteSetup,
            RelayFrame::TrafficData(_) => FrameKind::TrafficData,
            RelayFrame::Control(_) => FrameKind::Control,
        }
    }

    /// Route this frame belongs to, if any
    pub fn route_id(&self) -> Option<&str> {
        match self {
            RelayFrame::RouteSetup(setup) => Some(&setup.route_id),
            RelayFrame::TrafficData(data) => Some(&data.route_id),
            RelayFrame::Control(ControlMessage::RouteReset { route_id, .. }) => Some(route_id),
            RelayFrame::Control(_) => None,
        }
    }
}

/// Transport protocol carried by a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteProtocol {
    Tcp,
}

impl RouteProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteProtocol::Tcp => "TCP",
        }
    }
}

impl fmt::Display for RouteProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sent by the initiating side; tells the receiving side to dial
/// `localhost:target_port` and start forwarding for `route_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSetup {
    pub route_id: RouteId,
    pub org_id: Option<String>,
    /// Device that originated the route (filled in by the connector)
    pub source_device: String,
    /// Device the relay should deliver this route to
    pub target_device: String,
    /// Port the tunnel record advertises
    pub external_port: u16,
    /// Port the exposing side dials on localhost
    pub target_port: u16,
    pub protocol: RouteProtocol,
}

/// A chunk of stream bytes for an established route.
///
/// An empty payload is the end-of-stream signal for the sending direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficData {
    pub route_id: RouteId,
    pub payload: Bytes,
}

impl TrafficData {
    pub fn new(route_id: impl Into<RouteId>, payload: Bytes) -> Self {
        Self {
            route_id: route_id.into(),
            payload,
        }
    }

    /// Half-close marker for `route_id`
    pub fn end_of_stream(route_id: impl Into<RouteId>) -> Self {
        Self::new(route_id, Bytes::new())
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Features a device declares when it registers with the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    ServiceDiscovery,
    HealthCheck,
    TcpForwarding,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ServiceDiscovery => "service_discovery",
            Capability::HealthCheck => "health_check",
            Capability::TcpForwarding => "tcp_forwarding",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "service_discovery" => Some(Capability::ServiceDiscovery),
            "health_check" => Some(Capability::HealthCheck),
            "tcp_forwarding" => Some(Capability::TcpForwarding),
            _ => None,
        }
    }

    /// Capabilities a tunnel-capable CLI registers with by default
    pub fn defaults() -> Vec<Capability> {
        vec![
            Capability::ServiceDiscovery,
            Capability::HealthCheck,
            Capability::TcpForwarding,
        ]
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration, keepalive and error notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// First frame a client sends after the transport is up
    Register {
        protocol_version: u8,
        device_id: String,
        capabilities: Vec<Capability>,
        client_version: String,
    },
    /// Relay accepted the registration
    Registered { session_id: String },
    /// Relay refused the credential or the registration
    Rejected { reason: String },
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
    Error { code: u32, message: String },
    /// The route cannot continue (dial failure, policy refusal, peer gone)
    RouteReset { route_id: RouteId, reason: String },
    /// The sender is closing the session
    Goodbye { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_of_stream_marker() {
        let eos = TrafficData::end_of_stream("r-1");
        assert!(eos.is_end_of_stream());

        let data = TrafficData::new("r-1", Bytes::from_static(b"x"));
        assert!(!data.is_end_of_stream());
    }

    #[test]
    fn test_frame_kind_from_u8() {
        assert_eq!(FrameKind::from_u8(1), Some(FrameKind::RouteSetup));
        assert_eq!(FrameKind::from_u8(2), Some(FrameKind::TrafficData));
        assert_eq!(FrameKind::from_u8(3), Some(FrameKind::Control));
        assert_eq!(FrameKind::from_u8(0), None);
        assert_eq!(FrameKind::from_u8(42), None);
    }

    #[test]
    fn test_capability_names() {
        for cap in Capability::defaults() {
            assert_eq!(Capability::parse(cap.as_str()), Some(cap));
        }
        assert_eq!(Capability::parse("exit_node"), None);
    }

    #[test]
    fn test_route_id_accessor() {
        let reset = RelayFrame::Control(ControlMessage::RouteReset {
            route_id: "abc".to_string(),
            reason: "refused".to_string(),
        });
        assert_eq!(reset.route_id(), Some("abc"));

        let ping = RelayFrame::Control(ControlMessage::Ping { timestamp: 1 });
        assert_eq!(ping.route_id(), None);
    }
}
