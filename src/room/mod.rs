#![forbid(unsafe_code)]

// Room state and the process-wide room registry. Each room is serialized by
// its own async lock; the outer map lock is held only for lookups and
// inserts, never across an await. Store calls happen strictly outside room
// locks.

pub mod admission;
pub mod relay;
pub mod transcript;

use crate::auth::{normalize_user_id, Identity};
use crate::error::{HubError, HubResult};
use crate::metrics::HubMetrics;
use crate::signaling::gateway::ConnRegistry;
use crate::signaling::protocol::{MediaKind, MediaState, ParticipantInfo, ServerMessage};
use crate::store::{MeetingStore, RecordingMeta};
use admission::{AdmissionState, ApproveOutcome, DenyOutcome, JoinDecision, PENDING_TTL_MS};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};
use transcript::{TranscriptEntry, TranscriptLog};

/// How long an empty room lingers after its last socket drops, so a
/// refreshing host finds the approved set and queue still intact.
const EMPTY_ROOM_GRACE: Duration = Duration::from_secs(30);

/// Expired-pending sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_DISPLAY_NAME_LEN: usize = 64;
const MAX_CHAT_LEN: usize = 4096;

const DEFAULT_DENY_REASON: &str = "Your request to join was declined";
const EXPIRED_MESSAGE: &str = "Your request to join timed out. Please request again.";

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One live socket inside a room.
pub struct Participant {
    pub conn_id: String,
    pub user_id: String,
    pub display_name: String,
    pub is_host: bool,
    pub media_state: MediaState,
    pub joined_at: u64,
    sender: mpsc::Sender<Arc<String>>,
    kill: Arc<Notify>,
}

impl Participant {
    fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            conn_id: self.conn_id.clone(),
            user_id: self.user_id.clone(),
            user_name: self.display_name.clone(),
            is_host: self.is_host,
            media_state: self.media_state,
        }
    }
}

/// Aggregate state for one meeting.
pub struct Room {
    pub id: String,
    pub created_at: u64,
    pub waiting_room_enabled: bool,
    /// Connection of the host while present; may go stale across host
    /// reconnects (refreshed on every host rejoin).
    host_conn_id: Option<String>,
    meeting_start_time: Option<u64>,
    pub admission: AdmissionState,
    pub participants: HashMap<String, Participant>,
    pub transcript: TranscriptLog,
}

impl Room {
    fn new(id: &str, host_user_id: &str, waiting_room_enabled: bool, now: u64) -> Self {
        Self {
            id: id.to_string(),
            created_at: now,
            waiting_room_enabled,
            host_conn_id: None,
            meeting_start_time: None,
            admission: AdmissionState::new(host_user_id),
            participants: HashMap::new(),
            transcript: TranscriptLog::new(),
        }
    }

    fn deliver(&self, participant: &Participant, json: Arc<String>) {
        match participant.sender.try_send(json) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Send queue full for {} in room {}, force-closing",
                    participant.conn_id, self.id
                );
                participant.kill.notify_one();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    "Connection {} in room {} already closed",
                    participant.conn_id, self.id
                );
            }
        }
    }

    /// Broadcast to every participant except one connection.
    fn broadcast_except(&self, skip_conn_id: &str, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for (conn_id, participant) in &self.participants {
            if conn_id != skip_conn_id {
                self.deliver(participant, json.clone());
            }
        }
    }

    /// Broadcast to every participant.
    fn broadcast_all(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for participant in self.participants.values() {
            self.deliver(participant, json.clone());
        }
    }

    fn participant_infos_except(&self, skip_conn_id: &str) -> Vec<ParticipantInfo> {
        self.participants
            .values()
            .filter(|p| p.conn_id != skip_conn_id)
            .map(Participant::info)
            .collect()
    }

    /// A room is idle (eligible for destruction) when nobody is inside,
    /// nobody is waiting, and no live host connection is mid-handshake.
    fn is_idle(&self, conns: &ConnRegistry) -> bool {
        self.participants.is_empty()
            && !self.admission.has_pending()
            && self
                .host_conn_id
                .as_deref()
                .map(|c| !conns.is_live(c))
                .unwrap_or(true)
    }
}

/// Process-wide indexed collection of rooms. All mutations of one room are
/// serialized by that room's lock; rooms are fully independent.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>>,
    conns: ConnRegistry,
    store: MeetingStore,
    metrics: HubMetrics,
}

impl RoomRegistry {
    pub fn new(conns: ConnRegistry, store: MeetingStore, metrics: HubMetrics) -> Self {
        Self {
            rooms: Arc::new(StdRwLock::new(HashMap::new())),
            conns,
            store,
            metrics,
        }
    }

    pub fn conns(&self) -> &ConnRegistry {
        &self.conns
    }

    /// Gets a room lock by ID (brief outer read lock, no await).
    fn get_room(&self, room_id: &str) -> HubResult<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(room_id)
            .cloned()
            .ok_or_else(|| HubError::UnknownRoom(room_id.to_string()))
    }

    fn lookup(&self, room_id: &str) -> Option<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    /// Gets or lazily creates a room with the requester as host. The store
    /// read for `waiting_room_enabled` happens before any lock is taken;
    /// insertion re-checks for a concurrent creator.
    async fn get_or_create_room(
        &self,
        room_id: &str,
        host: &Identity,
    ) -> (Arc<TokioRwLock<Room>>, bool) {
        if let Some(room) = self.lookup(room_id) {
            return (room, false);
        }

        let waiting_room_enabled = match self.store.load_meeting(room_id).await {
            Ok(Some(record)) => record.waiting_room_enabled,
            Ok(None) => true,
            Err(e) => {
                warn!("Meeting store read failed for room {}: {}", room_id, e);
                true
            }
        };

        let now = now_ms();
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = rooms.get(room_id) {
            // Lost the creation race; the other requester is host.
            return (existing.clone(), false);
        }
        let room = Arc::new(TokioRwLock::new(Room::new(
            room_id,
            &host.user_id,
            waiting_room_enabled,
            now,
        )));
        rooms.insert(room_id.to_string(), room.clone());
        (room, true)
    }

    // --- Admission ---

    /// `request-join-room`: runs the admission decision tree for the
    /// connection's authenticated identity. Client-asserted user fields are
    /// ignored.
    pub async fn request_join(
        &self,
        room_id: &str,
        conn_id: &str,
        identity: &Identity,
        is_rejoin: bool,
    ) -> HubResult<()> {
        if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
            return Err(HubError::InvalidState(format!(
                "room id must be 1-{MAX_ROOM_ID_LEN} characters"
            )));
        }
        if identity.display_name.is_empty() || identity.display_name.len() > MAX_DISPLAY_NAME_LEN {
            return Err(HubError::InvalidState(format!(
                "display name must be 1-{MAX_DISPLAY_NAME_LEN} characters"
            )));
        }

        let (room_lock, created) = self.get_or_create_room(room_id, identity).await;

        if created {
            self.metrics.inc_rooms_created();
            let mut room = room_lock.write().await;
            room.host_conn_id = Some(conn_id.to_string());
            self.conns.set_room(conn_id, Some(room_id));
            info!("Room {} created, host {}", room_id, identity.user_id);
            self.conns.send(
                conn_id,
                &ServerMessage::JoinApproved { is_host: true, message: None, pending_requests: None },
            );
            return Ok(());
        }

        let now = now_ms();
        let mut room = room_lock.write().await;
        let waiting_room_enabled = room.waiting_room_enabled;
        let decision = room.admission.decide_join(
            &identity.user_id,
            &identity.display_name,
            conn_id,
            is_rejoin,
            waiting_room_enabled,
            now,
        );

        match decision {
            JoinDecision::HostRejoin { pending } => {
                room.host_conn_id = Some(conn_id.to_string());
                self.conns.set_room(conn_id, Some(room_id));
                info!("Host {} rejoined room {}", identity.user_id, room_id);
                self.conns.send(
                    conn_id,
                    &ServerMessage::JoinApproved {
                        is_host: true,
                        message: None,
                        pending_requests: Some(pending),
                    },
                );
            }
            JoinDecision::Denied { reason } => {
                self.conns.send(
                    conn_id,
                    &ServerMessage::JoinDenied { reason, permanent: false },
                );
            }
            JoinDecision::AlreadyApproved { rejoin } => {
                self.conns.set_room(conn_id, Some(room_id));
                let message = if rejoin { "reconnected" } else { "admitted" };
                self.conns.send(
                    conn_id,
                    &ServerMessage::JoinApproved {
                        is_host: false,
                        message: Some(message.to_string()),
                        pending_requests: None,
                    },
                );
            }
            JoinDecision::AutoApproved => {
                self.conns.set_room(conn_id, Some(room_id));
                self.conns.send(
                    conn_id,
                    &ServerMessage::JoinApproved {
                        is_host: false,
                        message: Some("admitted".to_string()),
                        pending_requests: None,
                    },
                );
            }
            JoinDecision::DuplicatePending { position } => {
                self.conns.set_room(conn_id, Some(room_id));
                self.conns.send(
                    conn_id,
                    &ServerMessage::WaitingForApproval { position, is_duplicate: true },
                );
            }
            JoinDecision::Queued { position } => {
                self.conns.set_room(conn_id, Some(room_id));
                self.metrics.inc_join_requests();
                info!(
                    "User {} waiting for approval in room {} (position {})",
                    identity.user_id, room_id, position
                );
                self.conns.send(
                    conn_id,
                    &ServerMessage::WaitingForApproval { position, is_duplicate: false },
                );
                if let Some(host_conn) = room.host_conn_id.clone() {
                    self.conns.send(
                        &host_conn,
                        &ServerMessage::JoinRequest {
                            user_id: identity.user_id.clone(),
                            user_name: identity.display_name.clone(),
                            requested_at: now,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    /// `update-waiting-socket`: reattach a refreshed socket to its pending
    /// request without resetting the clock or re-notifying the host.
    pub async fn update_waiting_conn(
        &self,
        room_id: &str,
        conn_id: &str,
        identity: &Identity,
        asserted_user_id: &str,
    ) -> HubResult<()> {
        if !identity.matches(asserted_user_id) {
            return Err(HubError::Authorization(
                "asserted user does not match authenticated identity".to_string(),
            ));
        }
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;
        if room.admission.rebind_waiting_conn(&identity.user_id, conn_id) {
            self.conns.set_room(conn_id, Some(room_id));
            debug!("Rebound waiting socket for {} in room {}", identity.user_id, room_id);
            Ok(())
        } else {
            Err(HubError::InvalidState(format!(
                "no pending join request for user {}",
                identity.user_id
            )))
        }
    }

    /// Verifies the double authorization rule for host-only admission
    /// events: the asserted approver must be the authenticated identity,
    /// and the authenticated identity must be the room's immutable host.
    fn verify_host(
        room: &Room,
        identity: &Identity,
        asserted_approver: &str,
    ) -> HubResult<()> {
        if !identity.matches(asserted_approver) {
            return Err(HubError::Authorization(
                "asserted approver does not match authenticated identity".to_string(),
            ));
        }
        if !room.admission.is_host(&identity.user_id) {
            return Err(HubError::Authorization(
                "only the host can manage join requests".to_string(),
            ));
        }
        Ok(())
    }

    /// `approve-join-request` (host only).
    pub async fn approve(
        &self,
        room_id: &str,
        actor_conn_id: &str,
        identity: &Identity,
        asserted_approver: &str,
        target_user_id: &str,
    ) -> HubResult<()> {
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;
        Self::verify_host(&room, identity, asserted_approver)?;

        let target = normalize_user_id(target_user_id);
        match room.admission.approve(target) {
            Ok(ApproveOutcome::Approved { conn_id }) => {
                self.metrics.inc_approvals();
                info!("Host approved {} for room {}", target, room_id);
                if let Some(waiting_conn) = conn_id {
                    self.conns.send(
                        &waiting_conn,
                        &ServerMessage::JoinApproved {
                            is_host: false,
                            message: Some("admitted".to_string()),
                            pending_requests: None,
                        },
                    );
                }
                self.conns.send(
                    actor_conn_id,
                    &ServerMessage::JoinRequestProcessed {
                        user_id: target.to_string(),
                        action: "approved".to_string(),
                    },
                );
                Ok(())
            }
            Ok(ApproveOutcome::AlreadyApproved) => {
                debug!("Repeat approval of {} in room {} ignored", target, room_id);
                Ok(())
            }
            Err(user) => Err(HubError::InvalidState(format!(
                "user {user} has no pending join request"
            ))),
        }
    }

    /// `deny-join-request` (host only).
    pub async fn deny(
        &self,
        room_id: &str,
        actor_conn_id: &str,
        identity: &Identity,
        asserted_approver: &str,
        target_user_id: &str,
        reason: Option<&str>,
    ) -> HubResult<()> {
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;
        Self::verify_host(&room, identity, asserted_approver)?;

        let target = normalize_user_id(target_user_id);
        let reason = reason.unwrap_or(DEFAULT_DENY_REASON);
        match room.admission.deny(target, reason, now_ms()) {
            Ok(DenyOutcome::Denied { conn_id, reason }) => {
                self.metrics.inc_denials();
                info!("Host denied {} for room {}: {}", target, room_id, reason);
                if let Some(waiting_conn) = conn_id {
                    self.conns.send(
                        &waiting_conn,
                        &ServerMessage::JoinDenied { reason, permanent: false },
                    );
                }
                self.conns.send(
                    actor_conn_id,
                    &ServerMessage::JoinRequestProcessed {
                        user_id: target.to_string(),
                        action: "denied".to_string(),
                    },
                );
                Ok(())
            }
            Ok(DenyOutcome::ApprovedStays) => {
                debug!("Deny of approved user {} in room {} ignored", target, room_id);
                Ok(())
            }
            Ok(DenyOutcome::AlreadyDenied) => {
                debug!("Repeat denial of {} in room {} ignored", target, room_id);
                Ok(())
            }
            Err(user) => Err(HubError::InvalidState(format!(
                "user {user} has no pending join request"
            ))),
        }
    }

    /// `admit-all-waiting` (host only): approve every pending request
    /// atomically.
    pub async fn admit_all(
        &self,
        room_id: &str,
        actor_conn_id: &str,
        identity: &Identity,
        asserted_approver: &str,
    ) -> HubResult<()> {
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;
        Self::verify_host(&room, identity, asserted_approver)?;

        let admitted = room.admission.admit_all();
        for request in &admitted {
            self.metrics.inc_approvals();
            if let Some(waiting_conn) = &request.conn_id {
                self.conns.send(
                    waiting_conn,
                    &ServerMessage::JoinApproved {
                        is_host: false,
                        message: Some("admitted".to_string()),
                        pending_requests: None,
                    },
                );
            }
        }
        info!("Host admitted all ({}) in room {}", admitted.len(), room_id);
        self.conns.send(actor_conn_id, &ServerMessage::AllAdmitted { count: admitted.len() });
        Ok(())
    }

    // --- Membership ---

    /// `join-room`: enter the room as a live participant. Requires prior
    /// admission. Replaces any stale connection of the same user, hinting
    /// peers with `user-disconnected` so they tear down the old peer
    /// connection.
    pub async fn join_room(
        &self,
        room_id: &str,
        conn_id: &str,
        identity: &Identity,
        media_state: MediaState,
    ) -> HubResult<()> {
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;

        if !room.admission.is_approved(&identity.user_id) {
            return Err(HubError::Authorization(
                "not admitted to this room".to_string(),
            ));
        }
        let is_host = room.admission.is_host(&identity.user_id);

        let stale = room
            .participants
            .values()
            .find(|p| p.user_id == identity.user_id && p.conn_id != conn_id)
            .map(|p| p.conn_id.clone());
        if let Some(old_conn) = stale {
            room.participants.remove(&old_conn);
            self.conns.set_room(&old_conn, None);
            room.broadcast_all(&ServerMessage::UserDisconnected {
                conn_id: old_conn.clone(),
                user_id: identity.user_id.clone(),
            });
            debug!("Cleared stale connection {} for {} in room {}", old_conn, identity.user_id, room_id);
        }

        let Some((sender, kill)) = self.conns.sender_of(conn_id) else {
            return Err(HubError::InvalidState("connection is not registered".to_string()));
        };

        let participant = Participant {
            conn_id: conn_id.to_string(),
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            is_host,
            media_state,
            joined_at: now_ms(),
            sender,
            kill,
        };
        let info = participant.info();
        room.participants.insert(conn_id.to_string(), participant);
        if is_host {
            room.host_conn_id = Some(conn_id.to_string());
        }
        self.conns.set_room(conn_id, Some(room_id));
        self.metrics.inc_joins();

        info!(
            "Participant {} ({}) joined room {}",
            conn_id, identity.user_id, room_id
        );

        self.conns.send(
            conn_id,
            &ServerMessage::ExistingParticipants {
                participants: room.participant_infos_except(conn_id),
            },
        );
        if is_host && room.admission.has_pending() {
            self.conns.send(
                conn_id,
                &ServerMessage::PendingJoinRequests {
                    requests: room.admission.pending_snapshot(),
                },
            );
        }
        room.broadcast_except(
            conn_id,
            &ServerMessage::UserJoined {
                conn_id: info.conn_id,
                user_id: info.user_id,
                user_name: info.user_name,
                is_host: info.is_host,
                media_state: info.media_state,
            },
        );
        Ok(())
    }

    /// `leave-room`: explicit exit. Idempotent for connections that already
    /// left.
    pub async fn leave_room(&self, room_id: &str, conn_id: &str) -> HubResult<()> {
        let room_lock = self.get_room(room_id)?;
        let destroy = {
            let mut room = room_lock.write().await;
            let Some(participant) = room.participants.remove(conn_id) else {
                return Ok(());
            };
            self.conns.set_room(conn_id, None);
            self.metrics.inc_leaves();
            info!("Participant {} left room {}", conn_id, room_id);

            room.broadcast_all(&ServerMessage::UserLeft {
                conn_id: conn_id.to_string(),
                user_id: participant.user_id.clone(),
                user_name: participant.display_name.clone(),
            });
            if participant.is_host && room.host_conn_id.as_deref() == Some(conn_id) {
                room.host_conn_id = None;
                room.broadcast_all(&ServerMessage::HostLeft {
                    user_id: participant.user_id.clone(),
                    user_name: participant.display_name.clone(),
                });
            }
            room.is_idle(&self.conns)
        };
        if destroy {
            self.destroy_room(room_id, None, false).await;
        }
        Ok(())
    }

    /// `end-meeting` (host only): evict everyone, including waiting
    /// requesters, and destroy the room.
    pub async fn end_meeting(
        &self,
        room_id: &str,
        _conn_id: &str,
        identity: &Identity,
    ) -> HubResult<()> {
        let room_lock = self.get_room(room_id)?;
        {
            let room = room_lock.read().await;
            if !room.admission.is_host(&identity.user_id) {
                return Err(HubError::Authorization(
                    "only the host can end the meeting".to_string(),
                ));
            }
        }
        info!("Host ended meeting in room {}", room_id);
        self.destroy_room(room_id, None, true).await;
        Ok(())
    }

    /// Socket dropped without `leave-room`. Participants are removed within
    /// bounded time; a waiting requester's queue entry survives with its
    /// conn nulled; fully idle rooms are destroyed after a grace period.
    pub async fn handle_disconnect(&self, conn_id: &str) {
        let Some(room_id) = self.conns.room_of(conn_id) else {
            return;
        };
        let Ok(room_lock) = self.get_room(&room_id) else {
            return;
        };
        let idle = {
            let mut room = room_lock.write().await;
            if let Some(participant) = room.participants.remove(conn_id) {
                self.metrics.inc_leaves();
                info!(
                    "Participant {} ({}) disconnected from room {}",
                    conn_id, participant.user_id, room_id
                );
                room.broadcast_all(&ServerMessage::UserLeft {
                    conn_id: conn_id.to_string(),
                    user_id: participant.user_id.clone(),
                    user_name: participant.display_name.clone(),
                });
                if participant.is_host && room.host_conn_id.as_deref() == Some(conn_id) {
                    room.host_conn_id = None;
                    room.broadcast_all(&ServerMessage::HostLeft {
                        user_id: participant.user_id.clone(),
                        user_name: participant.display_name.clone(),
                    });
                }
            } else {
                room.admission.detach_conn(conn_id);
            }
            if room.host_conn_id.as_deref() == Some(conn_id) {
                room.host_conn_id = None;
            }
            room.is_idle(&self.conns)
        };
        if idle {
            self.schedule_destroy_if_idle(room_id);
        }
    }

    /// Deferred destruction of an idle room: gives a refreshing host a
    /// window to return before state is discarded.
    fn schedule_destroy_if_idle(&self, room_id: String) {
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(EMPTY_ROOM_GRACE).await;
            let still_idle = match registry.lookup(&room_id) {
                Some(room_lock) => room_lock.read().await.is_idle(&registry.conns),
                None => false,
            };
            if still_idle {
                debug!("Room {} idle past grace period, cleaning up", room_id);
                registry.destroy_room(&room_id, None, false).await;
            }
        });
    }

    /// Removes the room from the map, optionally announcing `meeting-ended`
    /// to participants and waiting requesters, then persists the transcript
    /// (after all locks are released).
    async fn destroy_room(&self, room_id: &str, reason: Option<&str>, announce: bool) {
        let removed = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.remove(room_id)
        };
        let Some(room_lock) = removed else {
            return;
        };

        let entries: Vec<TranscriptEntry> = {
            let mut room = room_lock.write().await;
            if announce {
                let message = ServerMessage::MeetingEnded {
                    reason: reason.map(str::to_string),
                };
                room.broadcast_all(&message);
                for waiting_conn in room.admission.pending_conn_ids() {
                    self.conns.send(&waiting_conn, &message);
                }
            }
            for conn_id in room.participants.keys() {
                self.conns.set_room(conn_id, None);
            }
            for waiting_conn in room.admission.pending_conn_ids() {
                self.conns.set_room(&waiting_conn, None);
            }
            room.participants.clear();
            room.transcript.entries().to_vec()
        };

        info!("Room {} destroyed", room_id);
        if let Err(e) = self.store.persist_transcript(room_id, &entries).await {
            warn!("Failed to persist transcript for room {}: {}", room_id, e);
        }
    }

    /// A handler panicked inside this room: destroy it, telling every
    /// member the meeting ended on an internal error. Other rooms are
    /// unaffected.
    pub async fn poison_room(&self, room_id: &str) {
        warn!("Room {} poisoned by a handler panic, destroying", room_id);
        self.destroy_room(room_id, Some("internal error"), true).await;
    }

    // --- Side-channel fanout ---

    /// `toggle-media`: update the participant's media state and tell peers.
    pub async fn toggle_media(
        &self,
        room_id: &str,
        conn_id: &str,
        media_type: MediaKind,
        enabled: bool,
    ) -> HubResult<()> {
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;
        let Some(participant) = room.participants.get_mut(conn_id) else {
            return Err(HubError::InvalidState(
                "not a participant of this room".to_string(),
            ));
        };
        match media_type {
            MediaKind::Audio => participant.media_state.audio = enabled,
            MediaKind::Video => participant.media_state.video = enabled,
        }
        let user_id = participant.user_id.clone();
        room.broadcast_except(
            conn_id,
            &ServerMessage::UserMediaToggle {
                conn_id: conn_id.to_string(),
                user_id,
                media_type,
                enabled,
            },
        );
        Ok(())
    }

    /// `recording-status`: roomwide announcement plus best-effort metadata
    /// persistence (outside the room lock).
    pub async fn recording_status(
        &self,
        room_id: &str,
        conn_id: &str,
        is_recording: bool,
    ) -> HubResult<()> {
        let user_name = {
            let room_lock = self.get_room(room_id)?;
            let room = room_lock.read().await;
            let Some(participant) = room.participants.get(conn_id) else {
                return Err(HubError::InvalidState(
                    "not a participant of this room".to_string(),
                ));
            };
            let user_name = participant.display_name.clone();
            room.broadcast_all(&ServerMessage::RecordingStatusChanged {
                is_recording,
                user_name: user_name.clone(),
            });
            user_name
        };

        let meta = RecordingMeta { is_recording, user_name, changed_at: now_ms() };
        if let Err(e) = self.store.persist_recording(room_id, &meta).await {
            warn!("Failed to persist recording metadata for room {}: {}", room_id, e);
        }
        Ok(())
    }

    /// `send-message`: ephemeral chat echo to the whole room. Durable chat
    /// is a REST path, not the hub's business.
    pub async fn chat(&self, room_id: &str, conn_id: &str, message: &str) -> HubResult<()> {
        if message.is_empty() {
            return Err(HubError::InvalidState("empty chat message".to_string()));
        }
        if message.len() > MAX_CHAT_LEN {
            return Err(HubError::PayloadTooLarge { size: message.len(), limit: MAX_CHAT_LEN });
        }
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.read().await;
        let Some(participant) = room.participants.get(conn_id) else {
            return Err(HubError::InvalidState(
                "not a participant of this room".to_string(),
            ));
        };
        room.broadcast_all(&ServerMessage::ReceiveMessage {
            message: message.to_string(),
            user_name: participant.display_name.clone(),
            user_id: participant.user_id.clone(),
            timestamp: now_ms(),
        });
        Ok(())
    }

    // --- Transcription ---

    /// `transcription-entry`: append a finalized utterance and fan it out
    /// to everyone but the speaker. Spoofed speaker identities are
    /// rejected; duplicate entry ids are ignored.
    #[allow(clippy::too_many_arguments)]
    pub async fn transcription_entry(
        &self,
        room_id: &str,
        conn_id: &str,
        identity: &Identity,
        asserted_user_id: &str,
        entry_id: &str,
        text: &str,
        timestamp: u64,
        seconds_into_meeting: f64,
        confidence: f32,
    ) -> HubResult<()> {
        if text.len() > relay::MAX_SIGNAL_PAYLOAD_BYTES {
            return Err(HubError::PayloadTooLarge {
                size: text.len(),
                limit: relay::MAX_SIGNAL_PAYLOAD_BYTES,
            });
        }
        if !identity.matches(asserted_user_id) {
            return Err(HubError::Authorization(
                "transcription user does not match authenticated identity".to_string(),
            ));
        }
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;
        if !room.participants.contains_key(conn_id) {
            return Err(HubError::InvalidState(
                "not a participant of this room".to_string(),
            ));
        }

        let Some(entry) = room.transcript.append_final(
            entry_id,
            &identity.user_id,
            &identity.display_name,
            text,
            timestamp,
            seconds_into_meeting,
            confidence,
        ) else {
            debug!("Duplicate transcript entry {} in room {} ignored", entry_id, room_id);
            return Ok(());
        };

        self.metrics.inc_transcript_entries();
        room.broadcast_except(conn_id, &ServerMessage::TranscriptionUpdate { entry });
        Ok(())
    }

    /// `transcription-interim`: overwrite the speaker's live caption and
    /// fan it out; empty text clears the slot (and tells peers to clear).
    pub async fn transcription_interim(
        &self,
        room_id: &str,
        conn_id: &str,
        identity: &Identity,
        asserted_user_id: &str,
        text: &str,
    ) -> HubResult<()> {
        if text.len() > relay::MAX_SIGNAL_PAYLOAD_BYTES {
            return Err(HubError::PayloadTooLarge {
                size: text.len(),
                limit: relay::MAX_SIGNAL_PAYLOAD_BYTES,
            });
        }
        if !identity.matches(asserted_user_id) {
            return Err(HubError::Authorization(
                "transcription user does not match authenticated identity".to_string(),
            ));
        }
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;
        if !room.participants.contains_key(conn_id) {
            return Err(HubError::InvalidState(
                "not a participant of this room".to_string(),
            ));
        }

        room.transcript.set_interim(&identity.user_id, &identity.display_name, text, now_ms());
        room.broadcast_except(
            conn_id,
            &ServerMessage::TranscriptionInterim {
                user_id: identity.user_id.clone(),
                user_name: identity.display_name.clone(),
                text: text.to_string(),
            },
        );
        Ok(())
    }

    /// `request-transcription-history`: full immutable log, served to any
    /// live participant (late joiners included).
    pub async fn transcription_history(&self, room_id: &str, conn_id: &str) -> HubResult<()> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.read().await;
        if !room.participants.contains_key(conn_id) {
            return Err(HubError::InvalidState(
                "not a participant of this room".to_string(),
            ));
        }
        let entries = room.transcript.entries().to_vec();
        let count = entries.len();
        self.conns.send(conn_id, &ServerMessage::TranscriptionHistory { entries, count });
        Ok(())
    }

    /// `set-meeting-start-time` (host only): set once, later writes ignored.
    pub async fn set_meeting_start_time(
        &self,
        room_id: &str,
        identity: &Identity,
        start_time: u64,
    ) -> HubResult<()> {
        let room_lock = self.get_room(room_id)?;
        let mut room = room_lock.write().await;
        if !room.admission.is_host(&identity.user_id) {
            return Err(HubError::Authorization(
                "only the host can set the meeting start time".to_string(),
            ));
        }
        if room.meeting_start_time.is_none() {
            room.meeting_start_time = Some(start_time);
        }
        Ok(())
    }

    /// `request-meeting-start-time`.
    pub async fn request_meeting_start_time(&self, room_id: &str, conn_id: &str) -> HubResult<()> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.read().await;
        self.conns.send(
            conn_id,
            &ServerMessage::MeetingStartTime { start_time: room.meeting_start_time },
        );
        Ok(())
    }

    // --- Background maintenance ---

    /// One sweep pass: expire pending requests past their TTL, telling
    /// still-connected requesters, then clean up rooms left idle.
    pub async fn sweep_expired(&self) {
        let now = now_ms();
        let room_locks: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.iter().map(|(id, lock)| (id.clone(), lock.clone())).collect()
        };

        for (room_id, room_lock) in room_locks {
            let idle = {
                let mut room = room_lock.write().await;
                let expired = room.admission.expire_pending(now, PENDING_TTL_MS);
                for request in &expired {
                    self.metrics.inc_requests_expired();
                    info!(
                        "Join request from {} expired in room {}",
                        request.user_id, room_id
                    );
                    if let Some(waiting_conn) = &request.conn_id {
                        self.conns.send(
                            waiting_conn,
                            &ServerMessage::JoinRequestExpired {
                                message: EXPIRED_MESSAGE.to_string(),
                            },
                        );
                        self.conns.set_room(waiting_conn, None);
                    }
                }
                room.is_idle(&self.conns)
            };
            if idle {
                self.destroy_room(&room_id, None, false).await;
            }
        }
    }

    /// Spawns the once-per-minute expiry sweeper.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // skip the immediate tick
            loop {
                interval.tick().await;
                registry.sweep_expired().await;
            }
        })
    }

    /// Graceful shutdown: end every meeting and persist transcripts.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");
        let room_ids: Vec<String> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.keys().cloned().collect()
        };
        for room_id in &room_ids {
            self.destroy_room(room_id, Some("server shutting down"), true).await;
        }
        info!("All rooms shut down ({} total)", room_ids.len());
    }

    // --- Gauges ---

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub async fn total_participant_count(&self) -> usize {
        let room_locks: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        let mut total = 0;
        for room_lock in room_locks {
            if let Ok(room) = room_lock.try_read() {
                total += room.participants.len();
            }
        }
        total
    }
}

#[cfg(test)]
mod tests;
