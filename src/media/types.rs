#![forbid(unsafe_code)]

// Common types and error handling for the media module

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy for signaling and media operations.
///
/// Request-scoped errors are returned only to the requesting peer via its
/// ack; they never affect sibling peers or the room.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Access denied: {0}")]
    AuthDenied(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Produce error: {0}")]
    Produce(String),

    #[error("Consume error: {0}")]
    Consume(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SignalError {
    /// Stable wire code surfaced in error acks.
    pub fn code(&self) -> &'static str {
        match self {
            SignalError::AuthDenied(_) => "AUTH_DENIED",
            SignalError::RoomNotFound(_) => "ROOM_NOT_FOUND",
            SignalError::Transport(_) => "TRANSPORT_ERROR",
            SignalError::ConnectionFailed(_) => "CONNECTION_FAILED",
            SignalError::Produce(_) => "PRODUCE_ERROR",
            SignalError::Consume(_) => "CONSUME_ERROR",
            SignalError::ProducerNotFound(_) => "PRODUCER_NOT_FOUND",
            SignalError::Timeout => "TIMEOUT",
            SignalError::Internal(_) => "INTERNAL",
        }
    }
}

/// Result type alias for signaling and media operations
pub type SignalResult<T> = Result<T, SignalError>;

/// Media kind of a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Application-level label distinguishing a peer's simultaneous video producers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaTag {
    Camera,
    Screen,
}

/// Direction of a transport, one per direction per peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// DTLS handshake state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Closed,
}

/// A single codec the router (or a producer) supports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
}

/// The set of codecs a router supports, exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
}

/// RTP parameters a client sends when producing a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
}

/// Server-side ICE parameters handed to the client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
}

/// A candidate address the client may reach the router on
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub ip: String,
    pub port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters — the router's (inside TransportParams) or the client's
/// (inside connect-transport)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Everything the client needs to set up its side of a transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub direction: TransportDirection,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Transport application data — ties the transport back to its lecture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportAppData {
    pub lecture_id: String,
}

/// Producer application data carried on produce and new-producer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAppData {
    pub media_tag: MediaTag,
}

/// Everything the client needs to attach media for a consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub producer_paused: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_taxonomy() {
        assert_eq!(SignalError::AuthDenied("x".into()).code(), "AUTH_DENIED");
        assert_eq!(SignalError::RoomNotFound("x".into()).code(), "ROOM_NOT_FOUND");
        assert_eq!(SignalError::ConnectionFailed("x".into()).code(), "CONNECTION_FAILED");
        assert_eq!(SignalError::ProducerNotFound("x".into()).code(), "PRODUCER_NOT_FOUND");
        assert_eq!(SignalError::Timeout.code(), "TIMEOUT");
    }

    #[test]
    fn media_labels_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&MediaTag::Screen).unwrap(), "\"screen\"");
        assert_eq!(serde_json::to_string(&MediaKind::Video).unwrap(), "\"video\"");
        assert_eq!(serde_json::to_string(&DtlsState::Connecting).unwrap(), "\"connecting\"");
    }
}
