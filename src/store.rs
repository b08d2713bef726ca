#![forbid(unsafe_code)]

// Meeting Store Adapter: the hub's only outbound interface to the REST/DB
// layer. Three narrow operations; everything else about persistence lives
// outside this process. Room locks are never held across these calls.

use crate::room::transcript::TranscriptEntry;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

/// Stored meeting record, as far as the hub cares.
#[derive(Debug, Clone)]
pub struct MeetingRecord {
    pub room_id: String,
    pub waiting_room_enabled: bool,
}

/// Recording metadata reported by clients via `recording-status`.
#[derive(Debug, Clone)]
pub struct RecordingMeta {
    pub is_recording: bool,
    pub user_name: String,
    pub changed_at: u64,
}

/// Narrow outbound interface to the meeting document store. Runs storeless
/// (all methods are cheap no-ops / defaults) when `DATABASE_URL` is unset.
#[derive(Clone)]
pub struct MeetingStore {
    pool: Option<PgPool>,
}

impl MeetingStore {
    /// Connects using `DATABASE_URL`, or returns a disabled store when the
    /// variable is unset.
    pub async fn connect() -> anyhow::Result<Self> {
        let url = match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                info!("DATABASE_URL not set — running without meeting store");
                return Ok(Self { pool: None });
            }
        };

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(3))
            .connect(&url)
            .await?;

        info!("Connected to meeting store");

        Ok(Self { pool: Some(pool) })
    }

    /// Store with no backing database; every read returns defaults and
    /// every write is dropped. Used in tests and storeless deployments.
    pub fn disabled() -> Self {
        Self { pool: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// Reads the meeting record for a room, if one was provisioned by the
    /// REST layer. `None` means the room is ad-hoc (defaults apply).
    pub async fn load_meeting(&self, room_id: &str) -> anyhow::Result<Option<MeetingRecord>> {
        let Some(pool) = &self.pool else {
            return Ok(None);
        };

        let row = sqlx::query_as::<_, (String, bool)>(
            "SELECT id, waiting_room_enabled FROM meetings WHERE id = $1",
        )
        .bind(room_id)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|(id, waiting_room_enabled)| MeetingRecord {
            room_id: id,
            waiting_room_enabled,
        }))
    }

    /// Persists the finalized transcript for a meeting. Best-effort: called
    /// on room destruction so late joiners of a future meeting never see it.
    pub async fn persist_transcript(
        &self,
        room_id: &str,
        entries: &[TranscriptEntry],
    ) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        if entries.is_empty() {
            return Ok(());
        }

        let payload = serde_json::to_value(entries)?;
        sqlx::query(
            "INSERT INTO transcripts (meeting_id, entries, entry_count)
             VALUES ($1, $2, $3)
             ON CONFLICT (meeting_id) DO UPDATE SET entries = $2, entry_count = $3",
        )
        .bind(room_id)
        .bind(payload)
        .bind(entries.len() as i64)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Records a recording start/stop transition against the meeting.
    pub async fn persist_recording(
        &self,
        room_id: &str,
        meta: &RecordingMeta,
    ) -> anyhow::Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };

        sqlx::query(
            "INSERT INTO recording_events (meeting_id, is_recording, started_by, changed_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(room_id)
        .bind(meta.is_recording)
        .bind(&meta.user_name)
        .bind(meta.changed_at as i64)
        .execute(pool)
        .await?;

        Ok(())
    }
}
