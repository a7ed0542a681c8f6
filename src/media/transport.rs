#![forbid(unsafe_code)]

// Transport, producer and consumer resources.
//
// These are plain owned structs: the Room owns PeerSessions, which own their
// Transports/Producers/Consumers. Dropping a subtree releases everything in
// it, so a peer that vanishes mid-handshake leaves no dangling resources.

use crate::media::types::{
    DtlsParameters, DtlsState, MediaKind, MediaTag, RtpParameters, SignalError, SignalResult,
    TransportAppData, TransportDirection, TransportParams,
};
use tracing::{debug, info};

/// One bidirectional media transport for a peer, per direction.
#[derive(Debug)]
pub struct Transport {
    pub id: String,
    pub direction: TransportDirection,
    pub peer_id: String,
    pub app_data: TransportAppData,
    pub dtls_state: DtlsState,
    /// ICE/DTLS parameters handed to the client at creation time
    pub params: TransportParams,
}

impl Transport {
    pub fn new(
        params: TransportParams,
        peer_id: String,
        app_data: TransportAppData,
    ) -> Self {
        Self {
            id: params.id.clone(),
            direction: params.direction,
            peer_id,
            app_data,
            dtls_state: DtlsState::New,
            params,
        }
    }

    /// Runs the DTLS handshake against the client's parameters.
    ///
    /// NEW -> CONNECTING -> CONNECTED on success. On failure the transport
    /// transitions to CLOSED and every later produce/consume against it
    /// fails until the client recreates the transport.
    pub fn connect(&mut self, dtls_parameters: &DtlsParameters) -> SignalResult<()> {
        match self.dtls_state {
            DtlsState::New => {}
            DtlsState::Connecting | DtlsState::Connected => {
                return Err(SignalError::Transport(format!(
                    "Transport {} already connected",
                    self.id
                )));
            }
            DtlsState::Closed => {
                return Err(SignalError::Transport(format!(
                    "Transport {} is closed",
                    self.id
                )));
            }
        }

        self.dtls_state = DtlsState::Connecting;
        debug!("DTLS connecting on {:?} transport {}", self.direction, self.id);

        let handshake_ok = !dtls_parameters.fingerprints.is_empty()
            && dtls_parameters
                .fingerprints
                .iter()
                .all(|f| !f.algorithm.is_empty() && !f.value.is_empty());

        if !handshake_ok {
            self.dtls_state = DtlsState::Closed;
            return Err(SignalError::ConnectionFailed(format!(
                "DTLS handshake failed on transport {}",
                self.id
            )));
        }

        self.dtls_state = DtlsState::Connected;
        info!("Transport {} connected for peer {}", self.id, self.peer_id);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.dtls_state == DtlsState::Connected
    }

    pub fn close(&mut self) {
        self.dtls_state = DtlsState::Closed;
    }
}

/// A peer's outbound media track registered with the router.
#[derive(Debug, Clone)]
pub struct Producer {
    pub id: String,
    pub peer_id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub media_tag: MediaTag,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

impl Producer {
    pub fn new(
        peer_id: String,
        transport_id: String,
        kind: MediaKind,
        media_tag: MediaTag,
        rtp_parameters: RtpParameters,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer_id,
            transport_id,
            kind,
            media_tag,
            rtp_parameters,
            paused: false,
        }
    }
}

/// A peer's inbound handle onto another peer's producer.
/// Never outlives its producer: closing the producer closes the consumer.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: String,
    pub peer_id: String,
    pub producer_id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
    pub producer_paused: bool,
}

impl Consumer {
    pub fn new(peer_id: String, transport_id: String, producer: &Producer) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer_id,
            producer_id: producer.id.clone(),
            transport_id,
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
            paused: false,
            producer_paused: producer.paused,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::MediaConfig;
    use crate::media::router::Router;
    use crate::media::types::{DtlsFingerprint, DtlsRole};

    fn test_transport(direction: TransportDirection) -> Transport {
        let router = Router::new("lecture-1".to_string(), MediaConfig::default());
        router.allocate_transport("peer-1", direction, "lecture-1")
    }

    fn good_dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AB:CD:EF".to_string(),
            }],
        }
    }

    #[test]
    fn connect_walks_dtls_states() {
        let mut transport = test_transport(TransportDirection::Send);
        assert_eq!(transport.dtls_state, DtlsState::New);
        transport.connect(&good_dtls()).unwrap();
        assert_eq!(transport.dtls_state, DtlsState::Connected);
        assert!(transport.is_connected());
    }

    #[test]
    fn connect_with_no_fingerprints_closes_transport() {
        let mut transport = test_transport(TransportDirection::Send);
        let bad = DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![],
        };
        let err = transport.connect(&bad).unwrap_err();
        assert_eq!(err.code(), "CONNECTION_FAILED");
        assert_eq!(transport.dtls_state, DtlsState::Closed);

        // A closed transport stays closed
        let err = transport.connect(&good_dtls()).unwrap_err();
        assert_eq!(err.code(), "TRANSPORT_ERROR");
    }

    #[test]
    fn double_connect_is_rejected() {
        let mut transport = test_transport(TransportDirection::Recv);
        transport.connect(&good_dtls()).unwrap();
        let err = transport.connect(&good_dtls()).unwrap_err();
        assert_eq!(err.code(), "TRANSPORT_ERROR");
        assert!(transport.is_connected());
    }

    #[test]
    fn consumer_inherits_producer_pause_state() {
        let mut producer = Producer::new(
            "peer-a".to_string(),
            "t1".to_string(),
            MediaKind::Video,
            MediaTag::Camera,
            RtpParameters {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: None,
            },
        );
        producer.paused = true;
        let consumer = Consumer::new("peer-b".to_string(), "t2".to_string(), &producer);
        assert!(consumer.producer_paused);
        assert_eq!(consumer.producer_id, producer.id);
        assert_eq!(consumer.kind, MediaKind::Video);
    }
}
