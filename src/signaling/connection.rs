#![forbid(unsafe_code)]

// WebSocket connection handler. One task per socket: receive loop here,
// egress on a spawned send task draining the bounded per-connection queue.
// The authenticated identity is bound before this handler runs; every
// dispatched event carries it.

use super::gateway::ConnRegistry;
use super::protocol::{ClientMessage, ServerMessage};
use crate::auth::Identity;
use crate::error::HubError;
use crate::metrics::HubMetrics;
use crate::room::relay::Signal;
use crate::room::RoomRegistry;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Bounded egress queue per client. Overflow force-closes the connection
/// (the client treats it as a lost connection and reconnects); this is the
/// only place the hub drops messages.
const SEND_QUEUE_CAPACITY: usize = 64;

/// Idle timeout: close the connection if nothing arrives within this
/// window. Prevents dead sockets from holding permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Serialize a ServerMessage and queue it on this connection's own channel.
fn send_json(sender: &mpsc::Sender<Arc<String>>, msg: &ServerMessage) {
    if let Ok(json) = serde_json::to_string(msg) {
        let _ = sender.try_send(Arc::new(json));
    }
}

/// Handles a single authenticated WebSocket connection.
pub async fn handle_connection(
    socket: WebSocket,
    registry: Arc<RoomRegistry>,
    metrics: HubMetrics,
    identity: Identity,
    _permit: OwnedSemaphorePermit,
) {
    let conn_id = Uuid::new_v4().to_string();
    info!("New connection {} for user {}", conn_id, identity.user_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let conns: ConnRegistry = registry.conns().clone();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Arc<String>>(SEND_QUEUE_CAPACITY);
    let kill = Arc::new(Notify::new());

    // The identity binding must exist before any event from this socket is
    // dispatched.
    conns.register(&conn_id, identity.clone(), tx.clone(), kill.clone());

    let send_conn_id = conn_id.clone();
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection {}", send_conn_id);
    });

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        let msg = tokio::select! {
            _ = kill.notified() => {
                info!("Force-closing connection {} (send queue overflow)", conn_id);
                break;
            }
            recv = tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()) => match recv {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(_))) | Ok(None) => break, // stream error or closed
                Err(_) => {
                    warn!("Idle timeout for connection {}", conn_id);
                    break;
                }
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                // Token bucket rate limiting
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for connection {}", conn_id);
                        send_json(&tx, &ServerMessage::Error {
                            message: format!(
                                "Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"
                            ),
                        });
                    }
                    continue;
                }

                let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Invalid frame from {}: {}", conn_id, e);
                        metrics.inc_errors();
                        send_json(&tx, &ServerMessage::Error {
                            message: format!("Invalid message format: {e}"),
                        });
                        continue;
                    }
                };

                let start = Instant::now();
                let outcome = AssertUnwindSafe(handle_client_message(
                    &registry,
                    &conn_id,
                    &identity,
                    &client_msg,
                ))
                .catch_unwind()
                .await;
                metrics.observe_message_handling(start.elapsed());

                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        metrics.inc_errors();
                        debug!("Handler error for {}: {}", conn_id, e);
                        if tx.is_closed() {
                            break;
                        }
                        send_json(&tx, &ServerMessage::Error { message: e.to_string() });
                    }
                    Err(_) => {
                        // A panic inside a room handler poisons that room;
                        // everything else keeps running.
                        error!("Handler panicked for connection {}", conn_id);
                        metrics.inc_errors();
                        let room_id = room_id_of(&client_msg)
                            .map(str::to_string)
                            .or_else(|| conns.room_of(&conn_id));
                        if let Some(room_id) = room_id {
                            registry.poison_room(&room_id).await;
                        }
                        send_json(&tx, &ServerMessage::Error {
                            message: "internal error".to_string(),
                        });
                    }
                }
            }
            Message::Close(_) => {
                info!("Connection {} closed by client", conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // handled by the protocol layer
            }
            _ => {
                warn!("Unexpected message type from connection {}", conn_id);
            }
        }
    }

    // Exactly-once disconnect: room bookkeeping first, then the index entry.
    registry.handle_disconnect(&conn_id).await;
    conns.unregister(&conn_id);

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for {}", conn_id);
}

/// Room a message addresses directly, for poison targeting. Relay frames
/// carry no room id; the sender's reverse-index entry covers those.
fn room_id_of(msg: &ClientMessage) -> Option<&str> {
    match msg {
        ClientMessage::RequestJoinRoom { room_id, .. }
        | ClientMessage::UpdateWaitingSocket { room_id, .. }
        | ClientMessage::ApproveJoinRequest { room_id, .. }
        | ClientMessage::DenyJoinRequest { room_id, .. }
        | ClientMessage::AdmitAllWaiting { room_id, .. }
        | ClientMessage::JoinRoom { room_id, .. }
        | ClientMessage::LeaveRoom { room_id, .. }
        | ClientMessage::EndMeeting { room_id }
        | ClientMessage::ToggleMedia { room_id, .. }
        | ClientMessage::RecordingStatus { room_id, .. }
        | ClientMessage::SendMessage { room_id, .. }
        | ClientMessage::TranscriptionEntry { room_id, .. }
        | ClientMessage::TranscriptionInterim { room_id, .. }
        | ClientMessage::RequestTranscriptionHistory { room_id }
        | ClientMessage::SetMeetingStartTime { room_id, .. }
        | ClientMessage::RequestMeetingStartTime { room_id } => Some(room_id),
        ClientMessage::Offer { .. }
        | ClientMessage::Answer { .. }
        | ClientMessage::IceCandidate { .. }
        | ClientMessage::RequestRenegotiation { .. } => None,
    }
}

/// Routes one parsed frame into the room registry.
async fn handle_client_message(
    registry: &Arc<RoomRegistry>,
    conn_id: &str,
    identity: &Identity,
    message: &ClientMessage,
) -> Result<(), HubError> {
    match message {
        ClientMessage::RequestJoinRoom { room_id, is_rejoin, .. } => {
            registry.request_join(room_id, conn_id, identity, *is_rejoin).await
        }

        ClientMessage::UpdateWaitingSocket { room_id, user_id } => {
            registry.update_waiting_conn(room_id, conn_id, identity, user_id).await
        }

        ClientMessage::ApproveJoinRequest { room_id, user_id, approver_user_id } => {
            registry
                .approve(room_id, conn_id, identity, approver_user_id, user_id)
                .await
        }

        ClientMessage::DenyJoinRequest { room_id, user_id, reason, approver_user_id } => {
            registry
                .deny(room_id, conn_id, identity, approver_user_id, user_id, reason.as_deref())
                .await
        }

        ClientMessage::AdmitAllWaiting { room_id, approver_user_id } => {
            registry.admit_all(room_id, conn_id, identity, approver_user_id).await
        }

        ClientMessage::JoinRoom { room_id, media_state, .. } => {
            registry.join_room(room_id, conn_id, identity, *media_state).await
        }

        ClientMessage::LeaveRoom { room_id, .. } => {
            registry.leave_room(room_id, conn_id).await
        }

        ClientMessage::EndMeeting { room_id } => {
            registry.end_meeting(room_id, conn_id, identity).await
        }

        ClientMessage::Offer { to, payload, user_name, user_id, .. } => {
            registry
                .relay_signal(conn_id, to, Signal::Offer {
                    payload: payload.clone(),
                    user_name: user_name.clone(),
                    user_id: user_id.clone(),
                })
                .await
        }

        ClientMessage::Answer { to, payload, user_name, user_id, .. } => {
            registry
                .relay_signal(conn_id, to, Signal::Answer {
                    payload: payload.clone(),
                    user_name: user_name.clone(),
                    user_id: user_id.clone(),
                })
                .await
        }

        ClientMessage::IceCandidate { to, candidate, .. } => {
            registry
                .relay_signal(conn_id, to, Signal::IceCandidate { candidate: candidate.clone() })
                .await
        }

        ClientMessage::RequestRenegotiation { to, .. } => {
            registry.relay_signal(conn_id, to, Signal::Renegotiation).await
        }

        ClientMessage::ToggleMedia { room_id, media_type, enabled } => {
            registry.toggle_media(room_id, conn_id, *media_type, *enabled).await
        }

        ClientMessage::RecordingStatus { room_id, is_recording, .. } => {
            registry.recording_status(room_id, conn_id, *is_recording).await
        }

        ClientMessage::SendMessage { room_id, message, .. } => {
            registry.chat(room_id, conn_id, message).await
        }

        ClientMessage::TranscriptionEntry {
            room_id,
            entry_id,
            user_id,
            text,
            timestamp,
            seconds_into_meeting,
            confidence,
            ..
        } => {
            registry
                .transcription_entry(
                    room_id,
                    conn_id,
                    identity,
                    user_id,
                    entry_id,
                    text,
                    *timestamp,
                    *seconds_into_meeting,
                    *confidence,
                )
                .await
        }

        ClientMessage::TranscriptionInterim { room_id, user_id, text, .. } => {
            registry
                .transcription_interim(room_id, conn_id, identity, user_id, text)
                .await
        }

        ClientMessage::RequestTranscriptionHistory { room_id } => {
            registry.transcription_history(room_id, conn_id).await
        }

        ClientMessage::SetMeetingStartTime { room_id, start_time } => {
            registry.set_meeting_start_time(room_id, identity, *start_time).await
        }

        ClientMessage::RequestMeetingStartTime { room_id } => {
            registry.request_meeting_start_time(room_id, conn_id).await
        }
    }
}
