#![forbid(unsafe_code)]

// Room module - per-lecture room state machine, peer tracking, and the
// producer/consumer graph

pub mod peer;

use crate::lecture::{Collaborators, Role};
use crate::media::config::MediaConfig;
use crate::media::router::Router;
use crate::media::transport::{Consumer, Producer};
use crate::media::types::{
    ConsumerParams, DtlsParameters, MediaKind, ProducerAppData, RtpCapabilities, RtpParameters,
    SignalError, SignalResult, TransportDirection, TransportParams,
};
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{ServerMessage, UserSummary};
use peer::{CapabilityNegotiation, PeerSession};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

/// Room lifecycle. `Ended` is terminal and never re-entered; a later join
/// for the same lecture id allocates a fresh room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Pending,
    Active,
    Ended,
}

/// Join ack payload: router capabilities plus a membership snapshot taken
/// at the instant the join was processed.
#[derive(Debug)]
pub struct JoinAck {
    pub rtp_capabilities: RtpCapabilities,
    pub existing_users: Vec<UserSummary>,
}

/// Room state for one lecture
pub struct Room {
    pub id: String,
    pub state: RoomState,
    router: Router,
    pub peers: HashMap<String, PeerSession>,
    /// Producer index: producer id -> owning peer id
    producer_owners: HashMap<String, String>,
    pub created_at: SystemTime,
}

impl Room {
    fn new(id: String, media_config: MediaConfig) -> Self {
        let router = Router::new(id.clone(), media_config);
        Self {
            id,
            state: RoomState::Pending,
            router,
            peers: HashMap::new(),
            producer_owners: HashMap::new(),
            created_at: SystemTime::now(),
        }
    }

    /// Broadcast a message to all joined peers except the sender
    fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for (id, peer) in &self.peers {
            if id != sender_id && peer.is_joined() {
                self.deliver(id, &peer.sender, json.clone());
            }
        }
    }

    /// Broadcast a message to all peers, joined or leaving
    fn broadcast_all(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for (id, peer) in &self.peers {
            self.deliver(id, &peer.sender, json.clone());
        }
    }

    /// Send a message to a specific peer
    fn send_to(&self, peer_id: &str, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize message: {}", e);
                return;
            }
        };
        if let Some(peer) = self.peers.get(peer_id) {
            self.deliver(peer_id, &peer.sender, json);
        }
    }

    /// Non-blocking delivery: a slow or dead peer never blocks the room.
    fn deliver(&self, peer_id: &str, sender: &mpsc::Sender<Arc<String>>, json: Arc<String>) {
        match sender.try_send(json) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Channel full for peer {} in room {}, dropping message", peer_id, self.id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel closed for peer {} in room {} (disconnected)", peer_id, self.id);
            }
        }
    }

    /// Closes a producer: removes it from the index and the owner's map,
    /// closes every consumer referencing it, and notifies each consumer's
    /// owning peer. Returns the producer if it was still registered.
    fn close_producer_cascade(&mut self, producer_id: &str) -> Option<Producer> {
        let owner_id = self.producer_owners.remove(producer_id)?;
        let producer = self
            .peers
            .get_mut(&owner_id)
            .and_then(|p| p.producers.remove(producer_id));

        let affected: Vec<String> = self
            .peers
            .iter_mut()
            .filter_map(|(id, peer)| {
                let before = peer.consumers.len();
                peer.consumers.retain(|_, c| c.producer_id != producer_id);
                (peer.consumers.len() != before).then(|| id.clone())
            })
            .collect();

        for peer_id in affected {
            self.send_to(
                &peer_id,
                &ServerMessage::RemoveProducerById {
                    producer_id: producer_id.to_string(),
                },
            );
        }

        debug!("Closed producer {} in room {}", producer_id, self.id);
        producer
    }

    /// Terminal transition. Broadcasts `lecture-ended` best-effort to every
    /// still-connected peer before resources are released, then closes the
    /// router. Guarded so the transition happens exactly once.
    fn end(&mut self, collaborators: &Collaborators) -> bool {
        if self.state == RoomState::Ended {
            return false;
        }
        let was_active = self.state == RoomState::Active;
        self.state = RoomState::Ended;

        self.broadcast_all(&ServerMessage::LectureEnded {});

        for peer in self.peers.values_mut() {
            peer.mark_left();
        }
        self.producer_owners.clear();
        self.router.close();

        if was_active {
            collaborators.lifecycle.lecture_completed(&self.id);
        }
        info!("Lecture {} ended", self.id);
        true
    }

    fn joined_peer(&self, peer_id: &str) -> SignalResult<&PeerSession> {
        self.peers
            .get(peer_id)
            .filter(|p| p.is_joined())
            .ok_or_else(|| SignalError::AuthDenied(format!("Peer {peer_id} is not in this lecture")))
    }
}

/// Manages all lecture rooms.
///
/// Uses per-room locking: the outer HashMap is protected by a
/// std::sync::RwLock (held only for brief lookups/inserts, never across
/// await points), while each room is protected by its own
/// tokio::sync::RwLock. The room's write lock is its serialization queue:
/// all mutations for one lecture happen in order, and rooms for distinct
/// lectures proceed fully in parallel.
pub struct RoomManager {
    rooms: Arc<StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>>,
    media_config: MediaConfig,
    collaborators: Collaborators,
    metrics: ServerMetrics,
}

impl RoomManager {
    pub fn new(
        media_config: MediaConfig,
        collaborators: Collaborators,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            rooms: Arc::new(StdRwLock::new(HashMap::new())),
            media_config,
            collaborators,
            metrics,
        }
    }

    /// Gets a room lock by lecture id (brief outer read lock, no await)
    fn get_room(&self, lecture_id: &str) -> SignalResult<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(lecture_id)
            .cloned()
            .ok_or_else(|| SignalError::RoomNotFound(lecture_id.to_string()))
    }

    /// Idempotent: returns the existing room or allocates a fresh Pending
    /// one with a fresh router.
    fn get_or_create_room(&self, lecture_id: &str) -> Arc<TokioRwLock<Room>> {
        // Fast path: room exists (brief outer read lock)
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(lecture_id) {
                return room.clone();
            }
        }

        // Slow path: insert under write lock (re-check for concurrent creation)
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = rooms.get(lecture_id) {
            return existing.clone();
        }
        info!("Creating new room for lecture: {}", lecture_id);
        self.metrics.inc_rooms_created();
        let room = Arc::new(TokioRwLock::new(Room::new(
            lecture_id.to_string(),
            self.media_config.clone(),
        )));
        rooms.insert(lecture_id.to_string(), room.clone());
        room
    }

    /// Removes the registry entry for a room that is being ended, but only
    /// if the entry still points at that room (a fresh replacement for the
    /// same lecture id must not be evicted). Synchronous, so callers can
    /// unmap while still holding the room's write lock: the outer lock is
    /// never held across an await, so inner-then-outer cannot deadlock.
    fn remove_stale_room(&self, lecture_id: &str, stale: &Arc<TokioRwLock<Room>>) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if rooms.get(lecture_id).is_some_and(|r| Arc::ptr_eq(r, stale)) {
            rooms.remove(lecture_id);
        }
    }

    /// Closes the room's router and removes the entry. Safe to call twice:
    /// a missing lecture id is a no-op.
    pub async fn destroy_room(&self, lecture_id: &str) {
        let removed = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.remove(lecture_id)
        };
        if let Some(room_lock) = removed {
            let mut room = room_lock.write().await;
            if room.end(&self.collaborators) {
                self.metrics.inc_lectures_ended();
            }
            info!("Destroyed room for lecture {}", lecture_id);
        }
    }

    /// Opens a room for a lecture ahead of students joining (teacher only).
    pub async fn create_room(
        &self,
        lecture_id: &str,
        user_id: &str,
        requested_role: Role,
    ) -> SignalResult<()> {
        let role = self
            .collaborators
            .access
            .authorize(user_id, lecture_id, requested_role)
            .map_err(|denied| SignalError::AuthDenied(denied.reason))?;
        if !role.can_manage_lecture() {
            return Err(SignalError::AuthDenied(
                "Only the teacher can open a lecture room".to_string(),
            ));
        }
        self.get_or_create_room(lecture_id);
        Ok(())
    }

    /// Adds a peer to a room (creating the room if needed) and returns the
    /// join ack: router capabilities plus the membership snapshot at the
    /// instant this join was processed. Peers joining after the snapshot
    /// are announced via `new-user-joined`.
    pub async fn join_room(
        &self,
        lecture_id: &str,
        peer_id: &str,
        user_id: &str,
        username: &str,
        requested_role: Role,
        sender: mpsc::Sender<Arc<String>>,
    ) -> SignalResult<JoinAck> {
        let role = self
            .collaborators
            .access
            .authorize(user_id, lecture_id, requested_role)
            .map_err(|denied| SignalError::AuthDenied(denied.reason))?;

        // An Ended room still present in the registry (its destroyer may
        // have been cancelled mid-teardown) counts as absent: evict it and
        // allocate a fresh room for the lecture.
        let mut room = loop {
            let candidate = self.get_or_create_room(lecture_id);
            let guard = candidate.clone().write_owned().await;
            if guard.state == RoomState::Ended {
                drop(guard);
                self.remove_stale_room(lecture_id, &candidate);
                continue;
            }
            break guard;
        };

        if room.peers.contains_key(peer_id) {
            return Err(SignalError::Internal(format!(
                "Peer {peer_id} already joined lecture {lecture_id}"
            )));
        }

        let mut session = PeerSession::new(
            peer_id.to_string(),
            user_id.to_string(),
            username.to_string(),
            role,
            sender,
        );
        session.mark_joined();
        room.peers.insert(peer_id.to_string(), session);

        if room.state == RoomState::Pending {
            room.state = RoomState::Active;
            self.collaborators.lifecycle.lecture_started(lecture_id);
            info!("Lecture {} is now active", lecture_id);
        }

        // Snapshot before announcing, so the joiner never appears in its
        // own snapshot and later joiners arrive via new-user-joined.
        let existing_users: Vec<UserSummary> = room
            .peers
            .values()
            .filter(|p| p.peer_id != peer_id && p.is_joined())
            .map(|p| UserSummary {
                peer_id: p.peer_id.clone(),
                username: p.username.clone(),
                role: p.role,
            })
            .collect();

        room.broadcast_except(
            peer_id,
            &ServerMessage::NewUserJoined {
                peer_id: peer_id.to_string(),
                user_id: user_id.to_string(),
                username: username.to_string(),
                role,
            },
        );

        // Tell the joiner, once each, about producers that were already
        // live; producers created later arrive via the broadcast.
        let already_live: Vec<ServerMessage> = room
            .peers
            .values()
            .filter(|p| p.peer_id != peer_id && p.is_joined())
            .flat_map(|p| p.producers.values())
            .map(|producer| ServerMessage::NewProducer {
                producer_id: producer.id.clone(),
                peer_id: producer.peer_id.clone(),
                kind: producer.kind,
                app_data: ProducerAppData {
                    media_tag: producer.media_tag,
                },
            })
            .collect();
        for announcement in &already_live {
            room.send_to(peer_id, announcement);
        }

        self.collaborators
            .attendance
            .peer_joined(lecture_id, user_id, SystemTime::now());
        self.metrics.inc_joins();
        info!("Peer {} ({}) joined lecture {}", peer_id, username, lecture_id);

        Ok(JoinAck {
            rtp_capabilities: room.router.rtp_capabilities().clone(),
            existing_users,
        })
    }

    /// Removes a peer from a room. Idempotent: the second call for the same
    /// peer is a no-op with no broadcast and no error.
    ///
    /// Closes all of the peer's producers (cascading consumer closure),
    /// closes both transports, broadcasts `peer-left` exactly once, and
    /// runs the room-ending rules (teacher departure or empty room).
    pub async fn leave_room(&self, lecture_id: &str, peer_id: &str) -> SignalResult<()> {
        let room_lock = match self.get_room(lecture_id) {
            Ok(lock) => lock,
            Err(_) => return Ok(()), // room already gone
        };

        {
            let mut room = room_lock.write().await;

            let mut session = match room.peers.remove(peer_id) {
                Some(s) => s,
                None => return Ok(()), // already left
            };

            let producer_ids: Vec<String> = session.producers.keys().cloned().collect();
            let was_teacher = session.role == Role::Teacher;
            let username = session.username.clone();
            let user_id = session.user_id.clone();
            session.mark_left();
            drop(session); // transports and consumers released here

            for producer_id in &producer_ids {
                room.close_producer_cascade(producer_id);
            }

            room.broadcast_all(&ServerMessage::PeerLeft {
                peer_id: peer_id.to_string(),
                username,
            });

            self.collaborators
                .attendance
                .peer_left(lecture_id, &user_id, SystemTime::now());
            self.metrics.inc_leaves();
            info!("Peer {} left lecture {}", peer_id, lecture_id);

            let now_empty = room.peers.is_empty();
            if was_teacher || now_empty {
                // Unmap before ending, without releasing the room lock:
                // a caller cancelled between the two steps must not leave
                // an Ended room stranded in the registry
                self.remove_stale_room(lecture_id, &room_lock);
                if room.end(&self.collaborators) {
                    self.metrics.inc_lectures_ended();
                }
                info!("Destroyed room for lecture {}", lecture_id);
            }
        }
        Ok(())
    }

    /// Ends the lecture for everyone, regardless of remaining peers
    /// (teacher or admin only).
    pub async fn end_lecture(&self, lecture_id: &str, peer_id: &str) -> SignalResult<()> {
        let room_lock = self.get_room(lecture_id)?;
        let mut room = room_lock.write().await;
        let requester = room.joined_peer(peer_id)?;
        if !requester.role.can_manage_lecture() {
            return Err(SignalError::AuthDenied(
                "Only the teacher can end the lecture".to_string(),
            ));
        }
        // Unmap first, still under the room lock, so cancellation cannot
        // strand an Ended room in the registry
        self.remove_stale_room(lecture_id, &room_lock);
        if room.end(&self.collaborators) {
            self.metrics.inc_lectures_ended();
        }
        Ok(())
    }

    /// Allocates a transport under the room's router and installs it on the
    /// peer session (at most one per direction; replacement closes the old
    /// transport first).
    pub async fn create_transport(
        &self,
        lecture_id: &str,
        peer_id: &str,
        direction: TransportDirection,
    ) -> SignalResult<TransportParams> {
        let room_lock = self.get_room(lecture_id)?;
        let mut room = room_lock.write().await;
        room.joined_peer(peer_id)?;

        let transport = room.router.allocate_transport(peer_id, direction, lecture_id);
        let params = transport.params.clone();

        let peer = room
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SignalError::Internal("peer vanished during create-transport".into()))?;
        let replaced_id = match direction {
            TransportDirection::Send => peer.send_transport.as_ref().map(|t| t.id.clone()),
            TransportDirection::Recv => peer.recv_transport.as_ref().map(|t| t.id.clone()),
        };
        peer.install_transport(transport);

        // Recreating a transport tears down whatever rode on the old one:
        // producers on a replaced send transport (cascading to their
        // consumers), consumers on a replaced recv transport.
        let orphaned: Vec<String> = match (replaced_id, direction) {
            (Some(old_id), TransportDirection::Send) => peer
                .producers
                .values()
                .filter(|p| p.transport_id == old_id)
                .map(|p| p.id.clone())
                .collect(),
            (Some(old_id), TransportDirection::Recv) => {
                peer.consumers.retain(|_, c| c.transport_id != old_id);
                Vec::new()
            }
            (None, _) => Vec::new(),
        };
        for producer_id in orphaned {
            room.close_producer_cascade(&producer_id);
        }

        debug!("Created {:?} transport {} for peer {}", direction, params.id, peer_id);
        Ok(params)
    }

    /// Runs the DTLS handshake for a transport. On failure the transport is
    /// closed and the peer must recreate it; sibling peers are unaffected.
    pub async fn connect_transport(
        &self,
        lecture_id: &str,
        peer_id: &str,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> SignalResult<()> {
        let room_lock = self.get_room(lecture_id)?;
        let mut room = room_lock.write().await;
        let peer = room
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SignalError::AuthDenied(format!("Peer {peer_id} is not in this lecture")))?;
        let transport = peer
            .transport_mut(transport_id)
            .ok_or_else(|| SignalError::Transport(format!("Transport not found: {transport_id}")))?;
        transport.connect(dtls_parameters)
    }

    /// Creates a producer on the peer's connected send transport and
    /// broadcasts `new-producer` to every other joined peer — only after
    /// the producer is registered in the room's index.
    ///
    /// Screen policy: a peer holds at most one active screen producer; a
    /// second screen produce replaces the first (full close cascade).
    pub async fn produce(
        &self,
        lecture_id: &str,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: ProducerAppData,
    ) -> SignalResult<String> {
        let room_lock = self.get_room(lecture_id)?;
        let mut room = room_lock.write().await;

        if !room.router.supports(&rtp_parameters) {
            return Err(SignalError::Produce(format!(
                "Unsupported codec: {}",
                rtp_parameters.mime_type
            )));
        }

        let peer = room.joined_peer(peer_id)?;
        if peer.negotiation != CapabilityNegotiation::Loaded {
            return Err(SignalError::Produce(
                "RTP capabilities not negotiated".to_string(),
            ));
        }
        peer.connected_send_transport(transport_id)?;

        // Replace-not-reject: close a previous screen producer before
        // registering the new one.
        let replaced_screen = if app_data.media_tag == crate::media::types::MediaTag::Screen {
            peer.active_screen_producer().map(|p| p.id.clone())
        } else {
            None
        };
        if let Some(old_id) = replaced_screen {
            room.close_producer_cascade(&old_id);
            info!("Replaced screen producer {} for peer {}", old_id, peer_id);
        }

        let producer = Producer::new(
            peer_id.to_string(),
            transport_id.to_string(),
            kind,
            app_data.media_tag,
            rtp_parameters,
        );
        let producer_id = producer.id.clone();

        let peer = room
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SignalError::Internal("peer vanished during produce".into()))?;
        peer.producers.insert(producer_id.clone(), producer);
        room.producer_owners
            .insert(producer_id.clone(), peer_id.to_string());

        // Broadcast only now that the producer is durably registered
        room.broadcast_except(
            peer_id,
            &ServerMessage::NewProducer {
                producer_id: producer_id.clone(),
                peer_id: peer_id.to_string(),
                kind,
                app_data,
            },
        );

        self.metrics.inc_producers_created();
        info!("Created {:?} producer {} for peer {} in lecture {}", kind, producer_id, peer_id, lecture_id);
        Ok(producer_id)
    }

    /// Pairs a consumer with a producer on the peer's connected recv
    /// transport. A producer that closed between broadcast and this request
    /// is the normal, non-fatal PRODUCER_NOT_FOUND outcome.
    pub async fn consume(
        &self,
        lecture_id: &str,
        peer_id: &str,
        producer_id: &str,
    ) -> SignalResult<ConsumerParams> {
        let room_lock = self.get_room(lecture_id)?;
        let mut room = room_lock.write().await;

        let peer = room.joined_peer(peer_id)?;
        if peer.negotiation != CapabilityNegotiation::Loaded {
            return Err(SignalError::Consume(
                "RTP capabilities not negotiated".to_string(),
            ));
        }
        let transport_id = peer.connected_recv_transport()?.id.clone();

        let owner_id = room
            .producer_owners
            .get(producer_id)
            .cloned()
            .ok_or_else(|| SignalError::ProducerNotFound(producer_id.to_string()))?;
        let producer = room
            .peers
            .get(&owner_id)
            .and_then(|p| p.producers.get(producer_id))
            .ok_or_else(|| SignalError::ProducerNotFound(producer_id.to_string()))?;

        if !room.router.can_consume(producer) {
            return Err(SignalError::Consume(format!(
                "Capability mismatch for producer {producer_id}"
            )));
        }

        let consumer = Consumer::new(peer_id.to_string(), transport_id, producer);
        let params = ConsumerParams {
            id: consumer.id.clone(),
            producer_id: consumer.producer_id.clone(),
            kind: consumer.kind,
            rtp_parameters: consumer.rtp_parameters.clone(),
            producer_paused: consumer.producer_paused,
        };

        let peer = room
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SignalError::Internal("peer vanished during consume".into()))?;
        peer.consumers.insert(consumer.id.clone(), consumer);

        self.metrics.inc_consumers_created();
        debug!("Created consumer {} for peer {} in lecture {}", params.id, peer_id, lecture_id);
        Ok(params)
    }

    /// Pauses or resumes a producer. Consumers stay open — only their
    /// producer-paused flag flips — and the notification goes solely to
    /// peers holding consumers of that producer.
    pub async fn set_producer_paused(
        &self,
        lecture_id: &str,
        peer_id: &str,
        producer_id: &str,
        paused: bool,
    ) -> SignalResult<()> {
        let room_lock = self.get_room(lecture_id)?;
        let mut room = room_lock.write().await;

        if room.producer_owners.get(producer_id).map(String::as_str) != Some(peer_id) {
            return Err(SignalError::ProducerNotFound(producer_id.to_string()));
        }

        let producer = room
            .peers
            .get_mut(peer_id)
            .and_then(|p| p.producers.get_mut(producer_id))
            .ok_or_else(|| SignalError::ProducerNotFound(producer_id.to_string()))?;
        producer.paused = paused;

        let watchers: Vec<String> = room
            .peers
            .iter_mut()
            .filter_map(|(id, peer)| {
                let mut holds = false;
                for consumer in peer.consumers.values_mut() {
                    if consumer.producer_id == producer_id {
                        consumer.producer_paused = paused;
                        holds = true;
                    }
                }
                holds.then(|| id.clone())
            })
            .collect();

        let message = if paused {
            ServerMessage::ProducerPaused {
                producer_id: producer_id.to_string(),
            }
        } else {
            ServerMessage::ProducerResumed {
                producer_id: producer_id.to_string(),
            }
        };
        for watcher in watchers {
            room.send_to(&watcher, &message);
        }

        debug!(
            "Producer {} {} in lecture {}",
            producer_id,
            if paused { "paused" } else { "resumed" },
            lecture_id
        );
        Ok(())
    }

    /// Closes a producer, cascading closure to every consumer referencing
    /// it and notifying each consumer's owner.
    pub async fn close_producer(
        &self,
        lecture_id: &str,
        peer_id: &str,
        producer_id: &str,
    ) -> SignalResult<()> {
        let room_lock = self.get_room(lecture_id)?;
        let mut room = room_lock.write().await;

        if room.producer_owners.get(producer_id).map(String::as_str) != Some(peer_id) {
            return Err(SignalError::ProducerNotFound(producer_id.to_string()));
        }
        room.close_producer_cascade(producer_id);
        info!("Closed producer {} for peer {} in lecture {}", producer_id, peer_id, lecture_id);
        Ok(())
    }

    /// Chat relay: fans a message out to every other peer in the room.
    /// No persistence; delivery order is the room's queue order.
    pub async fn send_message(
        &self,
        lecture_id: &str,
        peer_id: &str,
        message: String,
    ) -> SignalResult<()> {
        let room_lock = self.get_room(lecture_id)?;
        let room = room_lock.read().await;
        room.joined_peer(peer_id)?;

        room.broadcast_except(
            peer_id,
            &ServerMessage::ReceiveMessage {
                message,
                sender_id: peer_id.to_string(),
            },
        );
        self.metrics.inc_chat_messages();
        Ok(())
    }

    /// Marks a peer unhealthy after a request timeout. Returns true when
    /// the peer was already unhealthy, i.e. eligible for forced disconnect.
    pub async fn mark_unhealthy(&self, lecture_id: &str, peer_id: &str) -> bool {
        let room_lock = match self.get_room(lecture_id) {
            Ok(lock) => lock,
            Err(_) => return false,
        };
        let mut room = room_lock.write().await;
        match room.peers.get_mut(peer_id) {
            Some(peer) => {
                let already = peer.unhealthy;
                peer.unhealthy = true;
                already
            }
            None => false,
        }
    }

    /// Gracefully ends every room (server shutdown).
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");
        let all_rooms: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };
        for (lecture_id, room_lock) in &all_rooms {
            let mut room = room_lock.write().await;
            if room.end(&self.collaborators) {
                self.metrics.inc_lectures_ended();
            }
            info!("Shut down room for lecture {}", lecture_id);
        }
        info!("All rooms shut down ({} total)", all_rooms.len());
    }

    /// Gets current room count
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Gets total peer count across all rooms
    pub async fn total_peer_count(&self) -> usize {
        let room_locks: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        let mut total = 0;
        for room_lock in room_locks {
            if let Ok(room) = room_lock.try_read() {
                total += room.peers.len();
            }
        }
        total
    }
}
