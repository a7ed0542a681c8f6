#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientMessage, ServerMessage};
use crate::lecture::Role;
use crate::media::types::{SignalError, SignalResult};
use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale — drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout — close connection if no message received within this duration.
/// Prevents Slowloris-style attacks that hold semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Per-request processing deadline. A request that exceeds it gets a TIMEOUT
/// error ack and marks the peer unhealthy; a second timeout on the same peer
/// forces a disconnect.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

const MAX_LECTURE_ID_LEN: usize = 128;
const MAX_CHAT_LEN: usize = 4096;

/// Who this connection claims to be. Taken from the upgrade request's query
/// string; the access-control collaborator decides what it may actually do.
#[derive(Clone)]
pub struct ConnectionIdentity {
    pub user_id: String,
    pub username: String,
    pub role: Role,
}

/// Serialize a ServerMessage and send it through the channel as pre-serialized JSON.
fn send_json(sender: &mpsc::Sender<Arc<String>>, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

fn send_error(sender: &mpsc::Sender<Arc<String>>, err: &SignalError) {
    let _ = send_json(
        sender,
        &ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        },
    );
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    room_manager: Arc<RoomManager>,
    identity: ConnectionIdentity,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {} ({})", peer_id, identity.username);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    // Clone for the send task
    let peer_id_clone = peer_id.clone();
    let send_metrics = metrics.clone();

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_signals_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for peer: {}", peer_id_clone);
    });

    // Handle incoming messages
    let mut current_lecture_id: Option<String> = None;
    let mut timed_out_once = false;

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        // Idle timeout: close connection if no message within IDLE_TIMEOUT
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for peer {}", peer_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_signals_received();

                // Token bucket rate limiting
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                // Refill: RATE_LIMIT_REFILL_RATE tokens per second = that many token-microseconds per microsecond
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    // Rate limited
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for peer {}", peer_id);
                        send_error(
                            &tx,
                            &SignalError::Internal(format!(
                                "Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"
                            )),
                        );
                    }
                    continue;
                }

                let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Invalid message format from {}: {}", peer_id, e);
                        metrics.inc_errors();
                        send_error(
                            &tx,
                            &SignalError::Internal(format!("Invalid message format: {e}")),
                        );
                        continue;
                    }
                };

                let start = Instant::now();
                let handled = tokio::time::timeout(
                    REQUEST_TIMEOUT,
                    handle_client_message(
                        &client_msg,
                        &peer_id,
                        &identity,
                        &mut current_lecture_id,
                        &tx,
                        &room_manager,
                    ),
                )
                .await;
                metrics.observe_signal_handling(start.elapsed());

                match handled {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!("Request from {} failed: {}", peer_id, err);
                        metrics.inc_errors();
                        // If channel is closed, send task has exited — break
                        if tx.is_closed() {
                            break;
                        }
                        send_error(&tx, &err);
                    }
                    Err(_elapsed) => {
                        warn!("Request from {} hit the {}s deadline", peer_id, REQUEST_TIMEOUT.as_secs());
                        metrics.inc_request_timeouts();
                        send_error(&tx, &SignalError::Timeout);
                        let force_disconnect = if let Some(lecture_id) = current_lecture_id.as_ref() {
                            room_manager.mark_unhealthy(lecture_id, &peer_id).await
                        } else {
                            timed_out_once
                        };
                        timed_out_once = true;
                        if force_disconnect {
                            warn!("Forcing disconnect of unhealthy peer {}", peer_id);
                            break;
                        }
                    }
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", peer_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", peer_id);
            }
        }
    }

    // Disconnect equals departure: release the peer's room resources now.
    // A reconnecting client starts a fresh session with a fresh peer id.
    if let Some(lecture_id) = current_lecture_id.take() {
        info!("Peer {} disconnected from lecture {}, cleaning up", peer_id, lecture_id);
        if let Err(e) = room_manager.leave_room(&lecture_id, &peer_id).await {
            warn!("Error removing peer {} after disconnect: {}", peer_id, e);
        }
    }

    // _conn_guard dropped here → dec_connections_active
    // _permit dropped here → release semaphore

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for peer: {}", peer_id);
}

/// Handle a single client message. Every request gets exactly one ack:
/// the success message sent here, or the typed error the caller sends
/// from the returned SignalError.
async fn handle_client_message(
    message: &ClientMessage,
    peer_id: &str,
    identity: &ConnectionIdentity,
    current_lecture_id: &mut Option<String>,
    sender: &mpsc::Sender<Arc<String>>,
    room_manager: &Arc<RoomManager>,
) -> SignalResult<()> {
    match message {
        ClientMessage::CreateRoom { lecture_id } => {
            validate_lecture_id(lecture_id)?;
            room_manager
                .create_room(lecture_id, &identity.user_id, identity.role)
                .await?;
            let _ = send_json(sender, &ServerMessage::RoomCreated { success: true });
        }

        ClientMessage::JoinRoom { lecture_id } => {
            validate_lecture_id(lecture_id)?;
            // Leave the current lecture first: one room per connection
            if let Some(old_lecture_id) = current_lecture_id.take() {
                room_manager.leave_room(&old_lecture_id, peer_id).await?;
            }

            let ack = room_manager
                .join_room(
                    lecture_id,
                    peer_id,
                    &identity.user_id,
                    &identity.username,
                    identity.role,
                    sender.clone(),
                )
                .await?;

            *current_lecture_id = Some(lecture_id.clone());
            let _ = send_json(
                sender,
                &ServerMessage::RoomJoined {
                    success: true,
                    rtp_capabilities: ack.rtp_capabilities,
                    existing_users: ack.existing_users,
                },
            );
        }

        ClientMessage::LeaveRoom => {
            if let Some(lecture_id) = current_lecture_id.take() {
                room_manager.leave_room(&lecture_id, peer_id).await?;
            }
            let _ = send_json(sender, &ServerMessage::RoomLeft { success: true });
        }

        ClientMessage::EndLecture => {
            let lecture_id = require_lecture(current_lecture_id)?;
            room_manager.end_lecture(&lecture_id, peer_id).await?;
            *current_lecture_id = None;
        }

        ClientMessage::CreateTransport { direction, app_data: _ } => {
            let lecture_id = require_lecture(current_lecture_id)?;
            let params = room_manager
                .create_transport(&lecture_id, peer_id, *direction)
                .await?;
            let _ = send_json(sender, &ServerMessage::TransportCreated { params });
        }

        ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            let lecture_id = require_lecture(current_lecture_id)?;
            room_manager
                .connect_transport(&lecture_id, peer_id, transport_id, dtls_parameters)
                .await?;
            let _ = send_json(
                sender,
                &ServerMessage::TransportConnected {
                    transport_id: transport_id.clone(),
                },
            );
        }

        ClientMessage::Produce {
            transport_id,
            kind,
            rtp_parameters,
            app_data,
        } => {
            let lecture_id = require_lecture(current_lecture_id)?;
            let producer_id = room_manager
                .produce(
                    &lecture_id,
                    peer_id,
                    transport_id,
                    *kind,
                    rtp_parameters.clone(),
                    app_data.clone(),
                )
                .await?;
            let _ = send_json(sender, &ServerMessage::Produced { id: producer_id });
        }

        ClientMessage::Consume { producer_id } => {
            let lecture_id = require_lecture(current_lecture_id)?;
            let params = room_manager.consume(&lecture_id, peer_id, producer_id).await?;
            let _ = send_json(sender, &ServerMessage::Consumed { params });
        }

        ClientMessage::PauseProducer { producer_id } => {
            let lecture_id = require_lecture(current_lecture_id)?;
            room_manager
                .set_producer_paused(&lecture_id, peer_id, producer_id, true)
                .await?;
            let _ = send_json(
                sender,
                &ServerMessage::ProducerPaused {
                    producer_id: producer_id.clone(),
                },
            );
        }

        ClientMessage::ResumeProducer { producer_id } => {
            let lecture_id = require_lecture(current_lecture_id)?;
            room_manager
                .set_producer_paused(&lecture_id, peer_id, producer_id, false)
                .await?;
            let _ = send_json(
                sender,
                &ServerMessage::ProducerResumed {
                    producer_id: producer_id.clone(),
                },
            );
        }

        ClientMessage::CloseProducer { producer_id } => {
            let lecture_id = require_lecture(current_lecture_id)?;
            room_manager
                .close_producer(&lecture_id, peer_id, producer_id)
                .await?;
            let _ = send_json(
                sender,
                &ServerMessage::ProducerClosed {
                    producer_id: producer_id.clone(),
                },
            );
        }

        ClientMessage::SendMessage { message, lecture_id } => {
            if message.is_empty() || message.len() > MAX_CHAT_LEN {
                return Err(SignalError::Internal(format!(
                    "Invalid chat message: must be 1-{MAX_CHAT_LEN} characters"
                )));
            }
            // The room a peer chats into is the one it joined on this
            // connection, whatever lecture id the payload carries
            let joined = require_lecture(current_lecture_id)?;
            if &joined != lecture_id {
                return Err(SignalError::RoomNotFound(lecture_id.clone()));
            }
            room_manager
                .send_message(&joined, peer_id, message.clone())
                .await?;
        }
    }

    Ok(())
}

fn require_lecture(current: &Option<String>) -> SignalResult<String> {
    current
        .clone()
        .ok_or_else(|| SignalError::RoomNotFound("Not in a lecture".to_string()))
}

fn validate_lecture_id(lecture_id: &str) -> SignalResult<()> {
    if lecture_id.is_empty() || lecture_id.len() > MAX_LECTURE_ID_LEN {
        return Err(SignalError::Internal(format!(
            "Invalid lecture id: must be 1-{MAX_LECTURE_ID_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lecture::Collaborators;
    use crate::media::config::MediaConfig;

    fn deps() -> (Arc<RoomManager>, ConnectionIdentity) {
        let manager = Arc::new(RoomManager::new(
            MediaConfig::default(),
            Collaborators::permissive(),
            ServerMetrics::new(),
        ));
        let identity = ConnectionIdentity {
            user_id: "u1".to_string(),
            username: "alice".to_string(),
            role: Role::Teacher,
        };
        (manager, identity)
    }

    #[tokio::test]
    async fn join_acks_with_capabilities_and_tracks_lecture() {
        let (manager, identity) = deps();
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut current = None;

        handle_client_message(
            &ClientMessage::JoinRoom {
                lecture_id: "L1".to_string(),
            },
            "p1",
            &identity,
            &mut current,
            &tx,
            &manager,
        )
        .await
        .unwrap();

        assert_eq!(current.as_deref(), Some("L1"));
        let ack: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(ack["type"], "room-joined");
        assert_eq!(ack["success"], true);
        assert!(ack["rtpCapabilities"]["codecs"].as_array().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn media_requests_outside_a_lecture_are_room_not_found() {
        let (manager, identity) = deps();
        let (tx, _rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut current = None;

        let err = handle_client_message(
            &ClientMessage::Consume {
                producer_id: "p".to_string(),
            },
            "p1",
            &identity,
            &mut current,
            &tx,
            &manager,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "ROOM_NOT_FOUND");
    }

    #[tokio::test]
    async fn chat_into_a_different_lecture_is_rejected() {
        let (manager, identity) = deps();
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut current = None;

        handle_client_message(
            &ClientMessage::JoinRoom {
                lecture_id: "L1".to_string(),
            },
            "p1",
            &identity,
            &mut current,
            &tx,
            &manager,
        )
        .await
        .unwrap();
        let _ = rx.try_recv();

        let err = handle_client_message(
            &ClientMessage::SendMessage {
                message: "hi".to_string(),
                lecture_id: "L2".to_string(),
            },
            "p1",
            &identity,
            &mut current,
            &tx,
            &manager,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "ROOM_NOT_FOUND");
    }

    #[tokio::test]
    async fn joining_a_second_lecture_leaves_the_first() {
        let (manager, identity) = deps();
        let (tx, _rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut current = None;

        for lecture in ["L1", "L2"] {
            handle_client_message(
                &ClientMessage::JoinRoom {
                    lecture_id: lecture.to_string(),
                },
                "p1",
                &identity,
                &mut current,
                &tx,
                &manager,
            )
            .await
            .unwrap();
        }

        assert_eq!(current.as_deref(), Some("L2"));
        // L1 emptied out and was destroyed; only L2 remains
        assert_eq!(manager.room_count(), 1);
    }

    #[tokio::test]
    async fn leave_room_is_acked_even_when_idle() {
        let (manager, identity) = deps();
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut current = None;

        handle_client_message(
            &ClientMessage::JoinRoom {
                lecture_id: "L1".to_string(),
            },
            "p1",
            &identity,
            &mut current,
            &tx,
            &manager,
        )
        .await
        .unwrap();
        let _ = rx.try_recv();

        // One ack per request: both the real leave and the idle repeat
        for _ in 0..2 {
            handle_client_message(
                &ClientMessage::LeaveRoom,
                "p1",
                &identity,
                &mut current,
                &tx,
                &manager,
            )
            .await
            .unwrap();
            let ack: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(ack["type"], "room-left");
            assert_eq!(ack["success"], true);
        }
        assert!(current.is_none());
    }

    #[tokio::test]
    async fn empty_lecture_id_is_rejected() {
        let (manager, identity) = deps();
        let (tx, _rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut current = None;

        let err = handle_client_message(
            &ClientMessage::JoinRoom {
                lecture_id: String::new(),
            },
            "p1",
            &identity,
            &mut current,
            &tx,
            &manager,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "INTERNAL");
        assert!(current.is_none());
    }
}
