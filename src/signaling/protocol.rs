#![forbid(unsafe_code)]

// Signaling protocol - message types for WebSocket communication

use crate::lecture::Role;
use crate::media::types::{
    ConsumerParams, DtlsParameters, MediaKind, ProducerAppData, RtpCapabilities, RtpParameters,
    TransportAppData, TransportDirection, TransportParams,
};
use serde::{Deserialize, Serialize};

/// Client-to-server requests. Every request is answered by exactly one ack
/// (a success variant below or `Error`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Open a room for a lecture (teacher only)
    #[serde(rename = "create-room", rename_all = "camelCase")]
    CreateRoom { lecture_id: String },

    /// Join a lecture room
    #[serde(rename = "join-room", rename_all = "camelCase")]
    JoinRoom { lecture_id: String },

    /// Leave the current room
    #[serde(rename = "leave-room")]
    LeaveRoom,

    /// End the lecture for everyone (teacher only)
    #[serde(rename = "end-lecture")]
    EndLecture,

    /// Create a send or receive transport
    #[serde(rename = "create-transport", rename_all = "camelCase")]
    CreateTransport {
        direction: TransportDirection,
        app_data: TransportAppData,
    },

    /// Connect a transport with the client's DTLS parameters
    #[serde(rename = "connect-transport", rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },

    /// Produce a media track on the send transport
    #[serde(rename = "produce", rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: ProducerAppData,
    },

    /// Consume another peer's producer
    #[serde(rename = "consume", rename_all = "camelCase")]
    Consume { producer_id: String },

    /// Pause a producer (camera/mic off) without closing its consumers
    #[serde(rename = "pause-producer", rename_all = "camelCase")]
    PauseProducer { producer_id: String },

    /// Resume a paused producer
    #[serde(rename = "resume-producer", rename_all = "camelCase")]
    ResumeProducer { producer_id: String },

    /// Close a producer, cascading closure to its consumers
    #[serde(rename = "close-producer", rename_all = "camelCase")]
    CloseProducer { producer_id: String },

    /// Send a chat message to the room
    #[serde(rename = "send-message", rename_all = "camelCase")]
    SendMessage {
        message: String,
        lecture_id: String,
    },
}

/// Server-to-client messages: request acks and room broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    // --- Acks ---
    #[serde(rename = "room-created")]
    RoomCreated { success: bool },

    #[serde(rename = "room-joined", rename_all = "camelCase")]
    RoomJoined {
        success: bool,
        rtp_capabilities: RtpCapabilities,
        existing_users: Vec<UserSummary>,
    },

    #[serde(rename = "room-left")]
    RoomLeft { success: bool },

    #[serde(rename = "transport-created", rename_all = "camelCase")]
    TransportCreated {
        #[serde(flatten)]
        params: TransportParams,
    },

    #[serde(rename = "transport-connected", rename_all = "camelCase")]
    TransportConnected { transport_id: String },

    #[serde(rename = "produced")]
    Produced { id: String },

    #[serde(rename = "producer-closed", rename_all = "camelCase")]
    ProducerClosed { producer_id: String },

    #[serde(rename = "consumed", rename_all = "camelCase")]
    Consumed {
        #[serde(flatten)]
        params: ConsumerParams,
    },

    /// Typed error ack, codes from the signaling taxonomy
    #[serde(rename = "error")]
    Error { code: String, message: String },

    // --- Broadcasts ---
    #[serde(rename = "new-user-joined", rename_all = "camelCase")]
    NewUserJoined {
        peer_id: String,
        user_id: String,
        username: String,
        role: Role,
    },

    #[serde(rename = "new-producer", rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        peer_id: String,
        kind: MediaKind,
        app_data: ProducerAppData,
    },

    #[serde(rename = "producer-paused", rename_all = "camelCase")]
    ProducerPaused { producer_id: String },

    #[serde(rename = "producer-resumed", rename_all = "camelCase")]
    ProducerResumed { producer_id: String },

    /// A producer this peer was consuming is gone; drop its consumer
    #[serde(rename = "removeProducerById", rename_all = "camelCase")]
    RemoveProducerById { producer_id: String },

    #[serde(rename = "peer-left", rename_all = "camelCase")]
    PeerLeft { peer_id: String, username: String },

    #[serde(rename = "lecture-ended")]
    LectureEnded {},

    #[serde(rename = "receive-message", rename_all = "camelCase")]
    ReceiveMessage { message: String, sender_id: String },
}

/// Peer identity snapshot handed to joiners (id + username + role only)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub peer_id: String,
    pub username: String,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::types::MediaTag;

    #[test]
    fn client_messages_use_kebab_case_event_names() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join-room","lectureId":"L1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::JoinRoom { lecture_id } if lecture_id == "L1"));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"send-message","message":"hi","lectureId":"L1"}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::SendMessage { .. }));
    }

    #[test]
    fn broadcast_event_names_match_wire_contract() {
        let json = serde_json::to_string(&ServerMessage::RemoveProducerById {
            producer_id: "p1".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"removeProducerById""#));
        assert!(json.contains(r#""producerId":"p1""#));

        let json = serde_json::to_string(&ServerMessage::LectureEnded {}).unwrap();
        assert!(json.contains(r#""type":"lecture-ended""#));
    }

    #[test]
    fn every_request_ack_has_a_wire_name() {
        let json = serde_json::to_string(&ServerMessage::RoomLeft { success: true }).unwrap();
        assert!(json.contains(r#""type":"room-left""#));

        let json = serde_json::to_string(&ServerMessage::ProducerClosed {
            producer_id: "p1".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"producer-closed""#));
        assert!(json.contains(r#""producerId":"p1""#));
    }

    #[test]
    fn new_producer_carries_media_tag() {
        let json = serde_json::to_string(&ServerMessage::NewProducer {
            producer_id: "p1".to_string(),
            peer_id: "peer".to_string(),
            kind: MediaKind::Video,
            app_data: ProducerAppData {
                media_tag: MediaTag::Camera,
            },
        })
        .unwrap();
        assert!(json.contains(r#""kind":"video""#));
        assert!(json.contains(r#""mediaTag":"camera""#));
    }
}
