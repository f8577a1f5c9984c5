//! Binary wire protocol shared by the session engine and the relay.
//!
//! Wire format (bincode-encoded, one envelope per WebSocket binary message):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Join traffic is always sent plain. Position payloads are compressed
//! with the codec negotiated during the join.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::compression::Compression;

/// Version carried in every join request. The relay refuses any other.
pub const PROTOCOL_VERSION: u16 = 1;

/// Longest room name (in bytes, after normalization) the relay accepts.
pub const MAX_ROOM_NAME_LEN: usize = 64;

/// Message types for the bubbles protocol. On the wire as the discriminant byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageType {
    /// Room join request (client → relay)
    Join = 1,
    /// Join accepted, carries the confirmed color and codec
    JoinAccepted = 2,
    /// Join refused, carries the reason
    JoinRejected = 3,
    /// Position and color report
    Position = 4,
    /// A participant left the room
    PeerLeft = 5,
    /// Liveness probe
    Ping = 6,
    /// Liveness probe answer
    Pong = 7,
}

impl From<MessageType> for u8 {
    fn from(msg_type: MessageType) -> Self {
        msg_type as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Join,
            2 => Self::JoinAccepted,
            3 => Self::JoinRejected,
            4 => Self::Position,
            5 => Self::PeerLeft,
            6 => Self::Ping,
            7 => Self::Pong,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// Payload of a `Join` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinRequest {
    pub room: String,
    pub protocol_version: u16,
    /// Codec the client would like to use for position payloads
    pub compression: Compression,
    /// Requested color (0 = let the relay pick)
    pub color: u32,
}

impl JoinRequest {
    pub fn new(room: impl Into<String>, compression: Compression, color: u32) -> Self {
        Self {
            room: room.into(),
            protocol_version: PROTOCOL_VERSION,
            compression,
            color,
        }
    }
}

/// Payload of a `JoinAccepted` message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinAccepted {
    pub color: u32,
    pub compression: Compression,
}

/// Why the relay refused a join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RejectReason {
    UnsupportedVersion { server_version: u16 },
    InvalidRoom,
    RoomFull,
    NoColor,
    AlreadyJoined,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedVersion { server_version } => {
                write!(f, "unsupported protocol version (relay speaks {server_version})")
            }
            Self::InvalidRoom => write!(f, "invalid room name"),
            Self::RoomFull => write!(f, "room is full"),
            Self::NoColor => write!(f, "no color available in room"),
            Self::AlreadyJoined => write!(f, "connection already joined a room"),
        }
    }
}

/// Position report for one participant, in logical session-space.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PositionReport {
    pub x: i32,
    pub y: i32,
    pub color: u32,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    /// Per-sender sequence number (diagnostic only)
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl WireMessage {
    /// Create a join request.
    pub fn join(peer_id: Uuid, request: &JoinRequest) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::Join,
            peer_id,
            seq: 0,
            payload: encode_payload(request)?,
        })
    }

    /// Create a join acceptance (sent by the relay, peer_id is nil).
    pub fn join_accepted(accepted: &JoinAccepted) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::JoinAccepted,
            peer_id: Uuid::nil(),
            seq: 0,
            payload: encode_payload(accepted)?,
        })
    }

    /// Create a join rejection.
    pub fn join_rejected(reason: &RejectReason) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type: MessageType::JoinRejected,
            peer_id: Uuid::nil(),
            seq: 0,
            payload: encode_payload(reason)?,
        })
    }

    /// Create a position report, compressing the payload with `compression`.
    pub fn position(
        peer_id: Uuid,
        seq: u64,
        report: &PositionReport,
        compression: Compression,
    ) -> Result<Self, ProtocolError> {
        let raw = encode_payload(report)?;
        Ok(Self {
            msg_type: MessageType::Position,
            peer_id,
            seq,
            payload: compression.compress(&raw),
        })
    }

    /// Create a peer-left notification.
    pub fn peer_left(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::PeerLeft,
            peer_id,
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            peer_id,
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a join request payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.expect(MessageType::Join)?;
        decode_payload(&self.payload)
    }

    /// Parse a join acceptance payload.
    pub fn accepted(&self) -> Result<JoinAccepted, ProtocolError> {
        self.expect(MessageType::JoinAccepted)?;
        decode_payload(&self.payload)
    }

    /// Parse a join rejection payload.
    pub fn rejection(&self) -> Result<RejectReason, ProtocolError> {
        self.expect(MessageType::JoinRejected)?;
        decode_payload(&self.payload)
    }

    /// Parse a position payload that was compressed with `compression`.
    pub fn position_report(&self, compression: Compression) -> Result<PositionReport, ProtocolError> {
        self.expect(MessageType::Position)?;
        let raw = compression.decompress(&self.payload)?;
        decode_payload(&raw)
    }

    fn expect(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != msg_type {
            return Err(ProtocolError::InvalidMessageType {
                expected: msg_type,
                got: self.msg_type,
            });
        }
        Ok(())
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors: malformed wire traffic and plot-cursor misuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("expected {expected:?} message, got {got:?}")]
    InvalidMessageType { expected: MessageType, got: MessageType },
    #[error("decompression failed: {0}")]
    Decompression(String),
    #[error("a plot cycle is already open")]
    PlotAlreadyOpen,
    #[error("no plot cycle is open")]
    NoOpenPlot,
    #[error("plot cursor is past the last participant")]
    CursorExhausted,
}

impl ProtocolError {
    /// Whether this error was caused by the caller rather than by traffic.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::PlotAlreadyOpen | Self::NoOpenPlot | Self::CursorExhausted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_roundtrip() {
        let peer = Uuid::new_v4();
        let request = JoinRequest::new("R1", Compression::Lz4, 0x00ff8800);

        let msg = WireMessage::join(peer, &request).unwrap();
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Join);
        assert_eq!(decoded.peer_id, peer);
        let parsed = decoded.join_request().unwrap();
        assert_eq!(parsed.room, "R1");
        assert_eq!(parsed.protocol_version, PROTOCOL_VERSION);
        assert_eq!(parsed.compression, Compression::Lz4);
    }

    #[test]
    fn test_position_plain_and_compressed() {
        let peer = Uuid::new_v4();
        let report = PositionReport { x: 5, y: -3, color: 0x123456 };

        for codec in [Compression::None, Compression::Lz4] {
            let msg = WireMessage::position(peer, 9, &report, codec).unwrap();
            let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded.seq, 9);
            assert_eq!(decoded.position_report(codec).unwrap(), report);
        }
    }

    #[test]
    fn test_compressed_position_needs_matching_codec() {
        let report = PositionReport { x: 1, y: 2, color: 3 };
        let msg = WireMessage::position(Uuid::new_v4(), 1, &report, Compression::Lz4).unwrap();
        // The size prefix makes the lz4 frame unparsable as a raw report.
        assert_ne!(msg.position_report(Compression::None).ok(), Some(report));
    }

    #[test]
    fn test_rejection_reason_roundtrip() {
        let reason = RejectReason::UnsupportedVersion { server_version: 1 };
        let msg = WireMessage::join_rejected(&reason).unwrap();
        let decoded = WireMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.rejection().unwrap(), reason);
        assert!(reason.to_string().contains("relay speaks 1"));
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = WireMessage::ping(Uuid::new_v4());
        assert!(matches!(
            msg.join_request(),
            Err(ProtocolError::InvalidMessageType { expected: MessageType::Join, got: MessageType::Ping })
        ));
        assert!(msg.position_report(Compression::None).is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            WireMessage::decode(&garbage),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_position_message_is_small() {
        let report = PositionReport { x: -500, y: 500, color: 0xffffff };
        let msg = WireMessage::position(Uuid::new_v4(), 1_000, &report, Compression::None).unwrap();
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 48, "position frame is {} bytes", encoded.len());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::JoinAccepted as u8, 2);
        assert_eq!(MessageType::JoinRejected as u8, 3);
        assert_eq!(MessageType::Position as u8, 4);
        assert_eq!(MessageType::PeerLeft as u8, 5);
        assert_eq!(MessageType::Ping as u8, 6);
        assert_eq!(MessageType::Pong as u8, 7);
    }

    #[test]
    fn test_message_type_is_first_byte_on_wire() {
        let peer = Uuid::new_v4();
        assert_eq!(WireMessage::ping(peer).encode().unwrap()[0], 6);
        assert_eq!(WireMessage::peer_left(peer).encode().unwrap()[0], 5);

        let mut frame = WireMessage::pong(peer).encode().unwrap();
        assert_eq!(frame[0], 7);
        for bad in [0u8, 8, 0xff] {
            frame[0] = bad;
            assert!(matches!(
                WireMessage::decode(&frame),
                Err(ProtocolError::Deserialization(_))
            ));
        }
        assert_eq!(MessageType::try_from(4), Ok(MessageType::Position));
        assert_eq!(MessageType::try_from(9), Err(ProtocolError::UnknownMessageType(9)));
    }

    #[test]
    fn test_misuse_classification() {
        assert!(ProtocolError::PlotAlreadyOpen.is_misuse());
        assert!(ProtocolError::NoOpenPlot.is_misuse());
        assert!(!ProtocolError::Deserialization("x".into()).is_misuse());
    }
}
