#![forbid(unsafe_code)]

// Per-connection peer session: identity, role, and the media resources it
// owns (arena-style: the room owns sessions, sessions own their resources)

use crate::lecture::Role;
use crate::media::transport::{Consumer, Producer, Transport};
use crate::media::types::{
    MediaTag, SignalError, SignalResult, TransportDirection,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;

/// Session lifecycle. `Left` is terminal; a reconnecting client gets a
/// fresh session with a fresh peer id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Joining,
    Joined,
    Left,
}

/// Gate on capability negotiation: the client must load the router's RTP
/// capabilities (delivered in the join ack) before it can build transports,
/// and produce/consume are blocked until the gate is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityNegotiation {
    NotLoaded,
    Loaded,
}

/// One peer's state within a room.
pub struct PeerSession {
    pub peer_id: String,
    pub user_id: String,
    pub username: String,
    pub role: Role,
    pub state: PeerState,
    pub negotiation: CapabilityNegotiation,
    /// Set when a signaling request for this peer timed out; a second
    /// timeout makes the peer eligible for forced disconnect.
    pub unhealthy: bool,
    pub sender: mpsc::Sender<Arc<String>>,
    pub send_transport: Option<Transport>,
    pub recv_transport: Option<Transport>,
    pub producers: HashMap<String, Producer>,
    pub consumers: HashMap<String, Consumer>,
    pub joined_at: SystemTime,
    pub left_at: Option<SystemTime>,
}

impl PeerSession {
    pub fn new(
        peer_id: String,
        user_id: String,
        username: String,
        role: Role,
        sender: mpsc::Sender<Arc<String>>,
    ) -> Self {
        Self {
            peer_id,
            user_id,
            username,
            role,
            state: PeerState::Joining,
            negotiation: CapabilityNegotiation::NotLoaded,
            unhealthy: false,
            sender,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            joined_at: SystemTime::now(),
            left_at: None,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.state == PeerState::Joined
    }

    pub fn mark_joined(&mut self) {
        if self.state == PeerState::Joining {
            self.state = PeerState::Joined;
        }
    }

    /// Transitions to `Left` and closes every owned resource.
    /// Idempotent: returns false if the peer had already left.
    pub fn mark_left(&mut self) -> bool {
        if self.state == PeerState::Left {
            return false;
        }
        self.state = PeerState::Left;
        self.left_at = Some(SystemTime::now());
        if let Some(t) = self.send_transport.as_mut() {
            t.close();
        }
        if let Some(t) = self.recv_transport.as_mut() {
            t.close();
        }
        self.producers.clear();
        self.consumers.clear();
        true
    }

    /// Installs a transport for its direction. At most one per direction:
    /// an existing transport for that direction is closed and replaced,
    /// which is the client's recreate path after CONNECTION_FAILED.
    pub fn install_transport(&mut self, transport: Transport) {
        let slot = match transport.direction {
            TransportDirection::Send => &mut self.send_transport,
            TransportDirection::Recv => &mut self.recv_transport,
        };
        if let Some(old) = slot.as_mut() {
            old.close();
        }
        *slot = Some(transport);
        self.negotiation = CapabilityNegotiation::Loaded;
    }

    pub fn transport_mut(&mut self, transport_id: &str) -> Option<&mut Transport> {
        if let Some(t) = self.send_transport.as_mut() {
            if t.id == transport_id {
                return Some(t);
            }
        }
        if let Some(t) = self.recv_transport.as_mut() {
            if t.id == transport_id {
                return Some(t);
            }
        }
        None
    }

    /// The send transport, required Connected for produce.
    pub fn connected_send_transport(&self, transport_id: &str) -> SignalResult<&Transport> {
        let transport = self
            .send_transport
            .as_ref()
            .filter(|t| t.id == transport_id)
            .ok_or_else(|| {
                SignalError::Transport(format!("Send transport not found: {transport_id}"))
            })?;
        if !transport.is_connected() {
            return Err(SignalError::Transport(format!(
                "Send transport {transport_id} is not connected"
            )));
        }
        Ok(transport)
    }

    /// The recv transport, required Connected for consume.
    pub fn connected_recv_transport(&self) -> SignalResult<&Transport> {
        let transport = self
            .recv_transport
            .as_ref()
            .ok_or_else(|| SignalError::Transport("Receive transport not found".to_string()))?;
        if !transport.is_connected() {
            return Err(SignalError::Transport(
                "Receive transport is not connected".to_string(),
            ));
        }
        Ok(transport)
    }

    /// The peer's currently open screen producer, if any.
    pub fn active_screen_producer(&self) -> Option<&Producer> {
        self.producers
            .values()
            .find(|p| p.media_tag == MediaTag::Screen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::MediaConfig;
    use crate::media::router::Router;

    fn session() -> PeerSession {
        let (tx, _rx) = mpsc::channel(8);
        PeerSession::new(
            "peer-1".to_string(),
            "user-1".to_string(),
            "alice".to_string(),
            Role::Student,
            tx,
        )
    }

    #[test]
    fn at_most_one_transport_per_direction() {
        let router = Router::new("L1".to_string(), MediaConfig::default());
        let mut peer = session();

        let first = router.allocate_transport("peer-1", TransportDirection::Send, "L1");
        let first_id = first.id.clone();
        peer.install_transport(first);

        let second = router.allocate_transport("peer-1", TransportDirection::Send, "L1");
        let second_id = second.id.clone();
        peer.install_transport(second);

        let held = peer.send_transport.as_ref().unwrap();
        assert_eq!(held.id, second_id);
        assert_ne!(held.id, first_id);
        assert!(peer.recv_transport.is_none());
    }

    #[test]
    fn install_transport_satisfies_negotiation_gate() {
        let router = Router::new("L1".to_string(), MediaConfig::default());
        let mut peer = session();
        assert_eq!(peer.negotiation, CapabilityNegotiation::NotLoaded);
        peer.install_transport(router.allocate_transport(
            "peer-1",
            TransportDirection::Recv,
            "L1",
        ));
        assert_eq!(peer.negotiation, CapabilityNegotiation::Loaded);
    }

    #[test]
    fn mark_left_is_terminal_and_idempotent() {
        let router = Router::new("L1".to_string(), MediaConfig::default());
        let mut peer = session();
        peer.mark_joined();
        peer.install_transport(router.allocate_transport(
            "peer-1",
            TransportDirection::Send,
            "L1",
        ));

        assert!(peer.mark_left());
        assert!(!peer.mark_left());
        assert_eq!(peer.state, PeerState::Left);
        assert!(peer.producers.is_empty());
        assert!(peer.consumers.is_empty());
    }
}
