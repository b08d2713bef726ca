#![forbid(unsafe_code)]

// Wire protocol. Every frame is `{"type": <kebab-case event>, ...payload}`.
// The hub never trusts `user_id`/`user_name` fields inside frames on their
// own; handlers compare them against the connection's authenticated identity.

use crate::room::transcript::TranscriptEntry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Media track kind for toggle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Audio/video mute state carried by a participant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MediaState {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaState {
    fn default() -> Self {
        Self { audio: true, video: true }
    }
}

/// Participant snapshot sent to joiners and in roomwide announcements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub conn_id: String,
    pub user_id: String,
    pub user_name: String,
    pub is_host: bool,
    pub media_state: MediaState,
}

/// Pending join request snapshot, as shown to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInfo {
    pub user_id: String,
    pub user_name: String,
    pub requested_at: u64,
}

/// Client-to-hub messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    RequestJoinRoom {
        room_id: String,
        user_id: String,
        user_name: String,
        #[serde(default)]
        is_rejoin: bool,
    },
    /// Rebind the connection of an already-pending request after a refresh.
    UpdateWaitingSocket {
        room_id: String,
        user_id: String,
    },
    ApproveJoinRequest {
        room_id: String,
        user_id: String,
        approver_user_id: String,
    },
    DenyJoinRequest {
        room_id: String,
        user_id: String,
        #[serde(default)]
        reason: Option<String>,
        approver_user_id: String,
    },
    AdmitAllWaiting {
        room_id: String,
        approver_user_id: String,
    },
    JoinRoom {
        room_id: String,
        user_id: String,
        user_name: String,
        #[serde(default)]
        media_state: MediaState,
    },
    LeaveRoom {
        room_id: String,
        user_id: String,
    },
    EndMeeting {
        room_id: String,
    },
    /// WebRTC SDP offer, relayed verbatim to the `to` connection.
    Offer {
        to: String,
        from: String,
        payload: Value,
        #[serde(default)]
        user_name: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    Answer {
        to: String,
        from: String,
        payload: Value,
        #[serde(default)]
        user_name: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    IceCandidate {
        to: String,
        from: String,
        candidate: Value,
    },
    RequestRenegotiation {
        to: String,
        from: String,
    },
    ToggleMedia {
        room_id: String,
        media_type: MediaKind,
        enabled: bool,
    },
    RecordingStatus {
        room_id: String,
        is_recording: bool,
        user_name: String,
    },
    SendMessage {
        room_id: String,
        message: String,
        user_name: String,
    },
    /// Finalized utterance for the room transcript.
    TranscriptionEntry {
        room_id: String,
        entry_id: String,
        user_id: String,
        user_name: String,
        text: String,
        timestamp: u64,
        seconds_into_meeting: f64,
        confidence: f32,
    },
    /// Live caption, overwrite-in-place per speaker, never persisted.
    TranscriptionInterim {
        room_id: String,
        user_id: String,
        user_name: String,
        text: String,
        #[serde(default)]
        timestamp: Option<u64>,
    },
    RequestTranscriptionHistory {
        room_id: String,
    },
    SetMeetingStartTime {
        room_id: String,
        start_time: u64,
    },
    RequestMeetingStartTime {
        room_id: String,
    },
}

/// Hub-to-client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    JoinApproved {
        is_host: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Queue snapshot, included on host (re)join only.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pending_requests: Option<Vec<PendingInfo>>,
    },
    JoinDenied {
        reason: String,
        permanent: bool,
    },
    WaitingForApproval {
        position: usize,
        #[serde(default)]
        is_duplicate: bool,
    },
    /// New join request, sent to the host connection.
    JoinRequest {
        user_id: String,
        user_name: String,
        requested_at: u64,
    },
    JoinRequestProcessed {
        user_id: String,
        action: String,
    },
    JoinRequestExpired {
        message: String,
    },
    PendingJoinRequests {
        requests: Vec<PendingInfo>,
    },
    AllAdmitted {
        count: usize,
    },
    ExistingParticipants {
        participants: Vec<ParticipantInfo>,
    },
    UserJoined {
        conn_id: String,
        user_id: String,
        user_name: String,
        is_host: bool,
        media_state: MediaState,
    },
    UserLeft {
        conn_id: String,
        user_id: String,
        user_name: String,
    },
    /// Hint that a stale connection for an already-rejoined user was
    /// cleared, so peers can tear down the old peer connection.
    UserDisconnected {
        conn_id: String,
        user_id: String,
    },
    UserMediaToggle {
        conn_id: String,
        user_id: String,
        media_type: MediaKind,
        enabled: bool,
    },
    Offer {
        from: String,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Answer {
        from: String,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    IceCandidate {
        from: String,
        candidate: Value,
    },
    RenegotiationNeeded {
        from: String,
    },
    RecordingStatusChanged {
        is_recording: bool,
        user_name: String,
    },
    /// Ephemeral chat echo to the whole room; durable chat is a REST path.
    ReceiveMessage {
        message: String,
        user_name: String,
        user_id: String,
        timestamp: u64,
    },
    TranscriptionUpdate {
        #[serde(flatten)]
        entry: TranscriptEntry,
    },
    TranscriptionInterim {
        user_id: String,
        user_name: String,
        text: String,
    },
    TranscriptionHistory {
        entries: Vec<TranscriptEntry>,
        count: usize,
    },
    MeetingStartTime {
        start_time: Option<u64>,
    },
    MeetingEnded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    HostLeft {
        user_id: String,
        user_name: String,
    },
    Error {
        message: String,
    },
}
