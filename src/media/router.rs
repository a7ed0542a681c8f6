#![forbid(unsafe_code)]

// Per-room media router: capability negotiation and transport allocation

use crate::media::config::MediaConfig;
use crate::media::transport::{Producer, Transport};
use crate::media::types::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, RtpCapabilities,
    RtpParameters, TransportAppData, TransportDirection, TransportParams,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use tracing::{debug, info};

/// Routes media within a single room. Owns the RTP capabilities clients
/// negotiate against and allocates the transports their media flows over.
pub struct Router {
    pub id: String,
    lecture_id: String,
    rtp_capabilities: RtpCapabilities,
    config: MediaConfig,
    next_port: AtomicU16,
    closed: AtomicBool,
}

impl Router {
    pub fn new(lecture_id: String, config: MediaConfig) -> Self {
        let router = Self {
            id: uuid::Uuid::new_v4().to_string(),
            lecture_id,
            rtp_capabilities: config.router_capabilities(),
            next_port: AtomicU16::new(config.rtc_min_port),
            closed: AtomicBool::new(false),
            config,
        };
        info!("Created router {} for lecture {}", router.id, router.lecture_id);
        router
    }

    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    /// Whether a consumer can be paired with this producer under the
    /// router's capabilities (codec present and clock rates agree).
    pub fn can_consume(&self, producer: &Producer) -> bool {
        self.rtp_capabilities.codecs.iter().any(|codec| {
            codec.mime_type.eq_ignore_ascii_case(&producer.rtp_parameters.mime_type)
                && codec.clock_rate == producer.rtp_parameters.clock_rate
        })
    }

    /// Whether the RTP parameters of a produce request match a known codec.
    pub fn supports(&self, rtp_parameters: &RtpParameters) -> bool {
        self.rtp_capabilities.codecs.iter().any(|codec| {
            codec.mime_type.eq_ignore_ascii_case(&rtp_parameters.mime_type)
                && codec.clock_rate == rtp_parameters.clock_rate
        })
    }

    /// Allocates a transport under this router and returns it with the
    /// ICE/DTLS parameters the client needs.
    pub fn allocate_transport(
        &self,
        peer_id: &str,
        direction: TransportDirection,
        lecture_id: &str,
    ) -> Transport {
        let params = TransportParams {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            ice_parameters: IceParameters {
                username_fragment: random_token(8),
                password: random_token(22),
            },
            ice_candidates: vec![IceCandidate {
                ip: self.config.candidate_ip().to_string(),
                port: self.allocate_port(),
                protocol: "udp".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
        };

        debug!(
            "Allocated {:?} transport {} for peer {} on router {}",
            direction, params.id, peer_id, self.id
        );

        Transport::new(
            params,
            peer_id.to_string(),
            TransportAppData {
                lecture_id: lecture_id.to_string(),
            },
        )
    }

    /// Marks the router closed. Owned resources are torn down by the room
    /// dropping its peer sessions.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Closed router {} for lecture {}", self.id, self.lecture_id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn allocate_port(&self) -> u16 {
        let min = self.config.rtc_min_port;
        let max = self.config.rtc_max_port;
        // Inclusive range; widen so min == 0, max == 65535 cannot overflow
        let span = u32::from(max.saturating_sub(min)) + 1;
        let raw = self.next_port.fetch_add(1, Ordering::Relaxed);
        min + (u32::from(raw.wrapping_sub(min)) % span) as u16
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> String {
    let bytes: Vec<String> = (0..32)
        .map(|_| format!("{:02X}", rand::thread_rng().gen::<u8>()))
        .collect();
    bytes.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::types::{MediaKind, MediaTag};

    fn router() -> Router {
        Router::new("lecture-1".to_string(), MediaConfig::default())
    }

    #[test]
    fn allocates_distinct_transports() {
        let router = router();
        let a = router.allocate_transport("p1", TransportDirection::Send, "lecture-1");
        let b = router.allocate_transport("p1", TransportDirection::Recv, "lecture-1");
        assert_ne!(a.id, b.id);
        assert_ne!(
            a.params.ice_parameters.password,
            b.params.ice_parameters.password
        );
        assert_eq!(a.app_data.lecture_id, "lecture-1");
    }

    #[test]
    fn can_consume_matches_router_codecs() {
        let router = router();
        let vp8 = Producer::new(
            "p1".to_string(),
            "t1".to_string(),
            MediaKind::Video,
            MediaTag::Camera,
            RtpParameters {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: None,
            },
        );
        assert!(router.can_consume(&vp8));

        let unknown = Producer::new(
            "p1".to_string(),
            "t1".to_string(),
            MediaKind::Video,
            MediaTag::Camera,
            RtpParameters {
                mime_type: "video/AV1".to_string(),
                clock_rate: 90000,
                channels: None,
            },
        );
        assert!(!router.can_consume(&unknown));
    }

    #[test]
    fn port_allocation_covers_the_inclusive_range() {
        let config = MediaConfig {
            rtc_min_port: 40000,
            rtc_max_port: 40001,
            ..MediaConfig::default()
        };
        let router = Router::new("lecture-1".to_string(), config);
        let ports: Vec<u16> = (0..4)
            .map(|_| {
                router
                    .allocate_transport("p1", TransportDirection::Send, "lecture-1")
                    .params
                    .ice_candidates[0]
                    .port
            })
            .collect();
        assert!(ports.iter().all(|p| (40000..=40001).contains(p)));
        assert!(ports.contains(&40001));
    }

    #[test]
    fn close_is_idempotent() {
        let router = router();
        assert!(!router.is_closed());
        router.close();
        router.close();
        assert!(router.is_closed());
    }
}
