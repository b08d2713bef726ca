#![forbid(unsafe_code)]

// Signaling Broker: stateless relay of WebRTC negotiation frames between
// two connections of the same room. The hub never inspects SDP or ICE
// contents; glare resolution belongs to the clients. Ordering holds per
// (sender, receiver) pair because each connection's events are processed in
// arrival order and each target queue is FIFO.

use crate::error::{HubError, HubResult};
use crate::signaling::protocol::ServerMessage;
use serde_json::Value;
use tracing::debug;

use super::RoomRegistry;

/// Per-message payload cap for signaling and transcription bodies.
pub const MAX_SIGNAL_PAYLOAD_BYTES: usize = 64 * 1024;

/// A negotiation frame to relay. `from` is always overridden with the
/// sender's real connection id; the client-asserted value is ignored.
#[derive(Debug)]
pub enum Signal {
    Offer {
        payload: Value,
        user_name: Option<String>,
        user_id: Option<String>,
    },
    Answer {
        payload: Value,
        user_name: Option<String>,
        user_id: Option<String>,
    },
    IceCandidate {
        candidate: Value,
    },
    Renegotiation,
}

impl Signal {
    fn payload_size(&self) -> usize {
        match self {
            Signal::Offer { payload, .. } | Signal::Answer { payload, .. } => {
                payload.to_string().len()
            }
            Signal::IceCandidate { candidate } => candidate.to_string().len(),
            Signal::Renegotiation => 0,
        }
    }

    fn into_message(self, from: &str) -> ServerMessage {
        match self {
            Signal::Offer { payload, user_name, user_id } => ServerMessage::Offer {
                from: from.to_string(),
                payload,
                user_name,
                user_id,
            },
            Signal::Answer { payload, user_name, user_id } => ServerMessage::Answer {
                from: from.to_string(),
                payload,
                user_name,
                user_id,
            },
            Signal::IceCandidate { candidate } => ServerMessage::IceCandidate {
                from: from.to_string(),
                candidate,
            },
            Signal::Renegotiation => ServerMessage::RenegotiationNeeded {
                from: from.to_string(),
            },
        }
    }
}

impl RoomRegistry {
    /// Relays one signaling frame from `sender_conn_id` to `to_conn_id`.
    /// Both endpoints must be live participants of the sender's room; the
    /// payload must fit the cap. Fire-and-forget beyond those checks.
    pub async fn relay_signal(
        &self,
        sender_conn_id: &str,
        to_conn_id: &str,
        signal: Signal,
    ) -> HubResult<()> {
        let size = signal.payload_size();
        if size > MAX_SIGNAL_PAYLOAD_BYTES {
            return Err(HubError::PayloadTooLarge { size, limit: MAX_SIGNAL_PAYLOAD_BYTES });
        }

        let Some(room_id) = self.conns().room_of(sender_conn_id) else {
            return Err(HubError::InvalidState("not in a room".to_string()));
        };
        let room_lock = self.get_room(&room_id)?;
        let room = room_lock.read().await;

        if !room.participants.contains_key(sender_conn_id) {
            return Err(HubError::InvalidState(
                "not a participant of this room".to_string(),
            ));
        }
        let Some(target) = room.participants.get(to_conn_id) else {
            return Err(HubError::InvalidState(format!(
                "target connection {to_conn_id} is not in the room"
            )));
        };

        let message = signal.into_message(sender_conn_id);
        let json = std::sync::Arc::new(serde_json::to_string(&message)?);
        room.deliver(target, json);
        self.metrics.inc_relays();
        debug!(
            "Relayed signal {} -> {} in room {}",
            sender_conn_id, to_conn_id, room_id
        );
        Ok(())
    }
}
