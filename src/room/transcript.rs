#![forbid(unsafe_code)]

// Per-room transcript state: an append-only log of finalized utterances
// plus one overwrite-in-place interim slot per speaker. Finals are immutable
// once appended, so the history endpoint can serve them at any time.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A finalized, identified utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub entry_id: String,
    pub user_id: String,
    pub user_name: String,
    pub text: String,
    /// Wall-clock time of the utterance, unix epoch milliseconds.
    pub timestamp: u64,
    pub seconds_into_meeting: f64,
    pub confidence: f32,
    pub is_final: bool,
    /// Server-assigned sequence, strictly increasing within a room.
    pub seq: u64,
}

/// An in-progress caption for one speaker. Replaced on every update,
/// removed when that speaker's final arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterimEntry {
    pub user_id: String,
    pub user_name: String,
    pub text: String,
    pub last_update: u64,
}

/// Transcript log plus interim slots for one room.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    entries: Vec<TranscriptEntry>,
    seen_ids: HashSet<String>,
    interim_by_user: HashMap<String, InterimEntry>,
    next_seq: u64,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a finalized entry, assigning the next sequence number and
    /// clearing the speaker's interim slot. Returns the stored entry, or
    /// `None` when `entry_id` was already seen (duplicate delivery).
    pub fn append_final(
        &mut self,
        entry_id: &str,
        user_id: &str,
        user_name: &str,
        text: &str,
        timestamp: u64,
        seconds_into_meeting: f64,
        confidence: f32,
    ) -> Option<TranscriptEntry> {
        if !self.seen_ids.insert(entry_id.to_string()) {
            return None;
        }

        let entry = TranscriptEntry {
            entry_id: entry_id.to_string(),
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            text: text.to_string(),
            timestamp,
            seconds_into_meeting,
            confidence,
            is_final: true,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.entries.push(entry.clone());
        self.interim_by_user.remove(user_id);
        Some(entry)
    }

    /// Writes or clears the speaker's interim slot. Empty text removes the
    /// slot. Returns true when there is an interim to broadcast.
    pub fn set_interim(&mut self, user_id: &str, user_name: &str, text: &str, now_ms: u64) -> bool {
        if text.is_empty() {
            self.interim_by_user.remove(user_id);
            return false;
        }
        self.interim_by_user.insert(
            user_id.to_string(),
            InterimEntry {
                user_id: user_id.to_string(),
                user_name: user_name.to_string(),
                text: text.to_string(),
                last_update: now_ms,
            },
        );
        true
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn interim_for(&self, user_id: &str) -> Option<&InterimEntry> {
        self.interim_by_user.get(user_id)
    }
}
