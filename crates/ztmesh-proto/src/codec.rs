//! Codec for encoding/decoding relay frames
//!
//! Format: `[version: u8][kind: u8][body]`
//!
//! - RouteSetup / Control: body is the bincode-serialized struct
//! - TrafficData: `[route_id_len: u16][route_id][payload...]`, where the
//!   payload runs to the end of the frame and may be empty (half-close)

use crate::frame::{ControlMessage, FrameKind, RelayFrame, RouteSetup, TrafficData};
use crate::{MAX_FRAME_SIZE, PROTOCOL_VERSION};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown frame kind: {0}")]
    UnknownKind(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Truncated frame")]
    Truncated,

    #[error("Invalid route id")]
    InvalidRouteId,
}

impl CodecError {
    /// Errors a receiver should log and skip rather than treat as fatal
    pub fn is_ignorable(&self) -> bool {
        matches!(
            self,
            CodecError::UnknownKind(_) | CodecError::UnsupportedVersion(_)
        )
    }
}

/// Relay frame codec
pub struct FrameCodec;

impl FrameCodec {
    /// Header size: version (1) + kind (1)
    pub const HEADER_SIZE: usize = 2;

    /// Encode a frame to bytes
    pub fn encode(frame: &RelayFrame) -> Result<Bytes, CodecError> {
        let buf = match frame {
            RelayFrame::RouteSetup(setup) => Self::encode_serialized(FrameKind::RouteSetup, setup)?,
            RelayFrame::Control(msg) => Self::encode_serialized(FrameKind::Control, msg)?,
            RelayFrame::TrafficData(data) => Self::encode_traffic(data)?,
        };

        if buf.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(buf.len()));
        }

        Ok(buf.freeze())
    }

    /// Decode one complete frame
    pub fn decode(mut buf: Bytes) -> Result<RelayFrame, CodecError> {
        if buf.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(buf.len()));
        }
        if buf.len() < Self::HEADER_SIZE {
            return Err(CodecError::Truncated);
        }

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let raw_kind = buf.get_u8();
        let kind = FrameKind::from_u8(raw_kind).ok_or(CodecError::UnknownKind(raw_kind))?;

        match kind {
            FrameKind::RouteSetup => {
                let setup: RouteSetup = bincode::deserialize(&buf)?;
                Ok(RelayFrame::RouteSetup(setup))
            }
            FrameKind::Control => {
                let msg: ControlMessage = bincode::deserialize(&buf)?;
                Ok(RelayFrame::Control(msg))
            }
            FrameKind::TrafficData => Self::decode_traffic(buf).map(RelayFrame::TrafficData),
        }
    }

    fn encode_serialized<T: serde::Serialize>(
        kind: FrameKind,
        value: &T,
    ) -> Result<BytesMut, CodecError> {
        let body = bincode::serialize(value)?;

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + body.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(kind as u8);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    fn encode_traffic(data: &TrafficData) -> Result<BytesMut, CodecError> {
        let route_id = data.route_id.as_bytes();
        if route_id.is_empty() || route_id.len() > u16::MAX as usize {
            return Err(CodecError::InvalidRouteId);
        }

        let mut buf =
            BytesMut::with_capacity(Self::HEADER_SIZE + 2 + route_id.len() + data.payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(FrameKind::TrafficData as u8);
        buf.put_u16(route_id.len() as u16);
        buf.extend_from_slice(route_id);
        buf.extend_from_slice(&data.payload);
        Ok(buf)
    }

    fn decode_traffic(mut buf: Bytes) -> Result<TrafficData, CodecError> {
        if buf.remaining() < 2 {
            return Err(CodecError::Truncated);
        }
        let id_len = buf.get_u16() as usize;
        if id_len == 0 {
            return Err(CodecError::InvalidRouteId);
        }
        if buf.remaining() < id_len {
            return Err(CodecError::Truncated);
        }

        let id_bytes = buf.split_to(id_len);
        let route_id =
            String::from_utf8(id_bytes.to_vec()).map_err(|_| CodecError::InvalidRouteId)?;

        // Remaining bytes are the payload, zero-copy
        Ok(TrafficData {
            route_id,
            payload: buf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Capability, RouteProtocol};

    fn setup_frame() -> RelayFrame {
        RelayFrame::RouteSetup(RouteSetup {
            route_id: "route-1".to_string(),
            org_id: Some("org-9".to_string()),
            source_device: "dev-b".to_string(),
            target_device: "dev-a".to_string(),
            external_port: 18080,
            target_port: 8080,
            protocol: RouteProtocol::Tcp,
        })
    }

    #[test]
    fn test_encode_decode_route_setup() {
        let frame = setup_frame();
        let encoded = FrameCodec::encode(&frame).unwrap();

        assert_eq!(encoded[0], PROTOCOL_VERSION);
        assert_eq!(encoded[1], FrameKind::RouteSetup as u8);
        assert_eq!(FrameCodec::decode(encoded).unwrap(), frame);
    }

    #[test]
    fn test_traffic_data_layout() {
        let frame = RelayFrame::TrafficData(TrafficData::new("ab", Bytes::from_static(b"ping")));
        let encoded = FrameCodec::encode(&frame).unwrap();

        assert_eq!(&encoded[..], &[1, 2, 0, 2, b'a', b'b', b'p', b'i', b'n', b'g']);
        assert_eq!(FrameCodec::decode(encoded).unwrap(), frame);
    }

    #[test]
    fn test_empty_payload_is_traffic_not_setup() {
        let frame = RelayFrame::TrafficData(TrafficData::end_of_stream("route-1"));
        let encoded = FrameCodec::encode(&frame).unwrap();

        match FrameCodec::decode(encoded).unwrap() {
            RelayFrame::TrafficData(data) => {
                assert_eq!(data.route_id, "route-1");
                assert!(data.is_end_of_stream());
            }
            other => panic!("Expected TrafficData, got {:?}", other),
        }
    }

    #[test]
    fn test_control_register() {
        let frame = RelayFrame::Control(ControlMessage::Register {
            protocol_version: PROTOCOL_VERSION,
            device_id: "dev-a".to_string(),
            capabilities: vec![Capability::ServiceDiscovery, Capability::HealthCheck],
            client_version: "0.1.0".to_string(),
        });
        let encoded = FrameCodec::encode(&frame).unwrap();
        assert_eq!(FrameCodec::decode(encoded).unwrap(), frame);
    }

    #[test]
    fn test_unknown_kind_is_ignorable() {
        let raw = Bytes::from(vec![PROTOCOL_VERSION, 0x7f, 1, 2, 3]);
        let err = FrameCodec::decode(raw).unwrap_err();

        assert!(matches!(err, CodecError::UnknownKind(0x7f)));
        assert!(err.is_ignorable());
    }

    #[test]
    fn test_future_version_rejected() {
        let raw = Bytes::from(vec![PROTOCOL_VERSION + 1, 2, 0, 1, b'a']);
        let err = FrameCodec::decode(raw).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedVersion(_)));
    }

    #[test]
    fn test_truncated_frames() {
        assert!(matches!(
            FrameCodec::decode(Bytes::from(vec![PROTOCOL_VERSION])),
            Err(CodecError::Truncated)
        ));
        // Route id length claims 10 bytes, only 1 present
        assert!(matches!(
            FrameCodec::decode(Bytes::from(vec![PROTOCOL_VERSION, 2, 0, 10, b'a'])),
            Err(CodecError::Truncated)
        ));
    }

    #[test]
    fn test_garbage_control_body() {
        let raw = Bytes::from(vec![PROTOCOL_VERSION, 3, 0xff, 0xff, 0xff, 0xff]);
        let err = FrameCodec::decode(raw).unwrap_err();
        assert!(matches!(err, CodecError::Serialization(_)));
        assert!(!err.is_ignorable());
    }

    #[test]
    fn test_empty_route_id_rejected() {
        let frame = RelayFrame::TrafficData(TrafficData::new("", Bytes::from_static(b"x")));
        assert!(matches!(
            FrameCodec::encode(&frame),
            Err(CodecError::InvalidRouteId)
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let payload = Bytes::from(vec![0u8; MAX_FRAME_SIZE]);
        let frame = RelayFrame::TrafficData(TrafficData::new("r", payload));
        assert!(matches!(
            FrameCodec::encode(&frame),
            Err(CodecError::FrameTooLarge(_))
        ));
    }
}
