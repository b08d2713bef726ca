#![forbid(unsafe_code)]

// Admission state machine for one room. A user id is in at most one of
// {approved, pending, denied} at any time; approval is terminal for the
// room's life. All clock inputs are explicit epoch-millis parameters so the
// dedup and expiry windows are exact under test.

use crate::signaling::protocol::PendingInfo;
use std::collections::{HashMap, HashSet};

/// Rapid re-requests inside this window do not re-notify the host.
pub const DEDUP_WINDOW_MS: u64 = 5_000;
/// Pending requests older than this are swept out.
pub const PENDING_TTL_MS: u64 = 5 * 60 * 1_000;

/// A user waiting for a host decision. Keyed by user id, so a refresh never
/// duplicates the queue entry; `conn_id` goes stale (None) if the waiting
/// socket drops and is reattached by `update-waiting-socket`.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub user_id: String,
    pub display_name: String,
    pub conn_id: Option<String>,
    pub requested_at: u64,
}

#[derive(Debug, Clone)]
pub struct DenyRecord {
    pub denied_at: u64,
    pub reason: String,
}

/// Outcome of a join request against the current admission state.
#[derive(Debug)]
pub enum JoinDecision {
    /// The host re-entered; caller refreshes `host_conn_id` and hands the
    /// host the current queue snapshot.
    HostRejoin { pending: Vec<PendingInfo> },
    Denied { reason: String },
    AlreadyApproved { rejoin: bool },
    /// Same user re-asked within the dedup window; host not re-notified.
    DuplicatePending { position: usize },
    /// Fresh (or refreshed-outside-window) request; host gets `join-request`.
    Queued { position: usize },
    /// Waiting room disabled for this meeting; approved without queueing.
    AutoApproved,
}

#[derive(Debug)]
pub enum ApproveOutcome {
    /// Moved to approved; `conn_id` is the waiting socket to notify, when
    /// one is still attached.
    Approved { conn_id: Option<String> },
    /// Second approval of the same user; nothing to do.
    AlreadyApproved,
}

#[derive(Debug)]
pub enum DenyOutcome {
    Denied { conn_id: Option<String>, reason: String },
    /// Approved users cannot be denied; approval is sticky.
    ApprovedStays,
    AlreadyDenied,
}

/// Per-room admission sets. `host_user_id` is immutable for the room's life.
#[derive(Debug)]
pub struct AdmissionState {
    host_user_id: String,
    approved: HashSet<String>,
    denied: HashMap<String, DenyRecord>,
    pending: HashMap<String, PendingRequest>,
}

impl AdmissionState {
    /// New room: the creator is host and starts approved.
    pub fn new(host_user_id: &str) -> Self {
        let mut approved = HashSet::new();
        approved.insert(host_user_id.to_string());
        Self {
            host_user_id: host_user_id.to_string(),
            approved,
            denied: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn host_user_id(&self) -> &str {
        &self.host_user_id
    }

    pub fn is_host(&self, user_id: &str) -> bool {
        self.host_user_id == user_id
    }

    pub fn is_approved(&self, user_id: &str) -> bool {
        self.approved.contains(user_id)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_conn_ids(&self) -> Vec<String> {
        self.pending.values().filter_map(|p| p.conn_id.clone()).collect()
    }

    /// Queue snapshot ordered by request time.
    pub fn pending_snapshot(&self) -> Vec<PendingInfo> {
        let mut reqs: Vec<&PendingRequest> = self.pending.values().collect();
        reqs.sort_by(|a, b| (a.requested_at, &a.user_id).cmp(&(b.requested_at, &b.user_id)));
        reqs.iter()
            .map(|r| PendingInfo {
                user_id: r.user_id.clone(),
                user_name: r.display_name.clone(),
                requested_at: r.requested_at,
            })
            .collect()
    }

    /// 1-based queue position of a pending user.
    fn position_of(&self, user_id: &str) -> usize {
        let Some(me) = self.pending.get(user_id) else { return 0 };
        1 + self
            .pending
            .values()
            .filter(|p| (p.requested_at, &p.user_id) < (me.requested_at, &me.user_id))
            .count()
    }

    /// Runs the join-request decision tree. Lazy room creation happens in
    /// the registry before this state exists, so the host path here is
    /// always a rejoin.
    pub fn decide_join(
        &mut self,
        user_id: &str,
        display_name: &str,
        conn_id: &str,
        is_rejoin: bool,
        waiting_room_enabled: bool,
        now_ms: u64,
    ) -> JoinDecision {
        if self.is_host(user_id) {
            return JoinDecision::HostRejoin { pending: self.pending_snapshot() };
        }

        if let Some(record) = self.denied.get(user_id) {
            return JoinDecision::Denied { reason: record.reason.clone() };
        }

        if self.approved.contains(user_id) {
            return JoinDecision::AlreadyApproved { rejoin: is_rejoin };
        }

        if let Some(existing) = self.pending.get_mut(user_id) {
            if now_ms.saturating_sub(existing.requested_at) < DEDUP_WINDOW_MS {
                existing.conn_id = Some(conn_id.to_string());
                return JoinDecision::DuplicatePending { position: self.position_of(user_id) };
            }
        }

        if !waiting_room_enabled {
            self.pending.remove(user_id);
            self.approved.insert(user_id.to_string());
            return JoinDecision::AutoApproved;
        }

        self.pending.insert(
            user_id.to_string(),
            PendingRequest {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                conn_id: Some(conn_id.to_string()),
                requested_at: now_ms,
            },
        );
        JoinDecision::Queued { position: self.position_of(user_id) }
    }

    /// Moves a user into the approved set, out of pending or denied.
    /// Approving an unknown user is an invalid-state condition handled by
    /// the caller (returns Err with the user id).
    pub fn approve(&mut self, user_id: &str) -> Result<ApproveOutcome, String> {
        if self.approved.contains(user_id) {
            return Ok(ApproveOutcome::AlreadyApproved);
        }
        if let Some(req) = self.pending.remove(user_id) {
            self.approved.insert(user_id.to_string());
            return Ok(ApproveOutcome::Approved { conn_id: req.conn_id });
        }
        if self.denied.remove(user_id).is_some() {
            self.approved.insert(user_id.to_string());
            return Ok(ApproveOutcome::Approved { conn_id: None });
        }
        Err(user_id.to_string())
    }

    /// Moves a pending user into the denied set. Approved users stay
    /// approved; repeat denials are no-ops.
    pub fn deny(&mut self, user_id: &str, reason: &str, now_ms: u64) -> Result<DenyOutcome, String> {
        if self.approved.contains(user_id) {
            return Ok(DenyOutcome::ApprovedStays);
        }
        if self.denied.contains_key(user_id) {
            return Ok(DenyOutcome::AlreadyDenied);
        }
        if let Some(req) = self.pending.remove(user_id) {
            self.denied.insert(
                user_id.to_string(),
                DenyRecord { denied_at: now_ms, reason: reason.to_string() },
            );
            return Ok(DenyOutcome::Denied { conn_id: req.conn_id, reason: reason.to_string() });
        }
        Err(user_id.to_string())
    }

    /// Approves every pending request atomically. Returns what was admitted,
    /// in queue order.
    pub fn admit_all(&mut self) -> Vec<PendingRequest> {
        let mut admitted: Vec<PendingRequest> = self.pending.drain().map(|(_, v)| v).collect();
        admitted.sort_by(|a, b| (a.requested_at, &a.user_id).cmp(&(b.requested_at, &b.user_id)));
        for req in &admitted {
            self.approved.insert(req.user_id.clone());
        }
        admitted
    }

    /// Reattaches the waiting socket of an existing pending request without
    /// resetting `requested_at` or re-notifying the host.
    pub fn rebind_waiting_conn(&mut self, user_id: &str, conn_id: &str) -> bool {
        match self.pending.get_mut(user_id) {
            Some(req) => {
                req.conn_id = Some(conn_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Nulls the stored conn of any pending request held by this socket.
    /// The request itself stays queued and expires normally.
    pub fn detach_conn(&mut self, conn_id: &str) {
        for req in self.pending.values_mut() {
            if req.conn_id.as_deref() == Some(conn_id) {
                req.conn_id = None;
            }
        }
    }

    /// Removes pending requests that have aged out (now - requested_at >= ttl)
    /// and returns them so still-connected requesters can be told.
    pub fn expire_pending(&mut self, now_ms: u64, ttl_ms: u64) -> Vec<PendingRequest> {
        let expired_ids: Vec<String> = self
            .pending
            .values()
            .filter(|p| now_ms.saturating_sub(p.requested_at) >= ttl_ms)
            .map(|p| p.user_id.clone())
            .collect();
        expired_ids
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect()
    }

    /// Rewinds a pending request's clock so expiry paths are exercisable
    /// without waiting out the TTL.
    #[cfg(test)]
    pub(crate) fn backdate_pending(&mut self, user_id: &str, requested_at: u64) {
        if let Some(req) = self.pending.get_mut(user_id) {
            req.requested_at = requested_at;
        }
    }

    /// One-of-three-sets check, asserted by tests after every transition.
    #[cfg(test)]
    fn holds_exclusivity(&self) -> bool {
        self.approved.iter().all(|u| !self.pending.contains_key(u) && !self.denied.contains_key(u))
            && self.pending.keys().all(|u| !self.denied.contains_key(u))
    }
}
