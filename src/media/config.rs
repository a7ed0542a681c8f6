#![forbid(unsafe_code)]

// Configuration for routers and transports

use crate::media::types::{MediaKind, RtpCapabilities, RtpCodecCapability};
use std::net::{IpAddr, Ipv4Addr};

/// Main media configuration
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// IP the router listens on
    pub listen_ip: IpAddr,
    /// IP announced to clients in ICE candidates (public address)
    pub announced_ip: Option<IpAddr>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            announced_ip: None,
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            media_codecs: default_codecs(),
        }
    }
}

impl MediaConfig {
    /// Sets the public IP address announced in ICE candidates
    pub fn with_announced_ip(mut self, announced_ip: IpAddr) -> Self {
        self.announced_ip = Some(announced_ip);
        self
    }

    /// The capabilities a router built from this config advertises
    pub fn router_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self.media_codecs.clone(),
        }
    }

    /// The address clients are told to reach the router on
    pub fn candidate_ip(&self) -> IpAddr {
        self.announced_ip.unwrap_or(self.listen_ip)
    }
}

/// Default codec capabilities for audio and video
pub fn default_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            preferred_payload_type: Some(111),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            preferred_payload_type: Some(96),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP9".to_string(),
            clock_rate: 90000,
            channels: None,
            preferred_payload_type: Some(98),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            channels: None,
            preferred_payload_type: Some(102),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capabilities_cover_audio_and_video() {
        let caps = MediaConfig::default().router_capabilities();
        assert!(caps.codecs.iter().any(|c| c.kind == MediaKind::Audio));
        assert!(caps.codecs.iter().any(|c| c.kind == MediaKind::Video));
    }

    #[test]
    fn announced_ip_overrides_candidate_ip() {
        let config = MediaConfig::default().with_announced_ip("203.0.113.7".parse().unwrap());
        assert_eq!(config.candidate_ip().to_string(), "203.0.113.7");
    }
}
