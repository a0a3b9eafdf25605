//! Recording, progress and clip values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Seconds subtracted from "now" when a recording reports an implausible start.
const FALLBACK_START_OFFSET_SECS: i64 = 60;

/// A recording as reported by one poll of the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub id: String,
    pub channel_id: String,
    /// Start time in epoch seconds (best-effort).
    pub start_time: i64,
    /// Length hint in milliseconds. Frequently zero.
    pub duration_hint_ms: u64,
    /// Size hint in bytes. Frequently zero.
    pub size_hint_bytes: u64,
}

impl Recording {
    pub fn new(id: impl Into<String>, channel_id: impl Into<String>, start_time: i64) -> Self {
        Self {
            id: id.into(),
            channel_id: channel_id.into(),
            start_time,
            duration_hint_ms: 0,
            size_hint_bytes: 0,
        }
    }

    /// Replace a non-positive or future start time with `now - 60`.
    pub fn plausible_start_time(raw: i64, now: i64) -> i64 {
        if raw <= 0 || raw > now {
            now - FALLBACK_START_OFFSET_SECS
        } else {
            raw
        }
    }
}

/// Ingestion progress of one recording.
///
/// Values handed out by the store are snapshots; mutation happens only
/// inside [`ProgressStore`](crate::store::ProgressStore).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentProgress {
    /// Keyed by the map entry when persisted.
    #[serde(skip)]
    pub recording_id: String,
    /// Start of the next fragment to fetch.
    pub next_offset_ms: u64,
    pub fragments_sent: u32,
    /// Epoch seconds of the last fetch attempt.
    pub last_attempt_time: f64,
    pub consecutive_fails: u32,
    pub is_completed: bool,
    /// Running estimate of the total length; 0 when unknown.
    pub estimated_duration_ms: u64,
    /// Epoch seconds of the last poll that listed this recording.
    pub last_seen_time: f64,
    pub full_duration_checked: bool,
}

impl FragmentProgress {
    pub fn new(recording_id: impl Into<String>, now: f64) -> Self {
        Self {
            recording_id: recording_id.into(),
            last_seen_time: now,
            ..Default::default()
        }
    }

    /// Milliseconds left before the estimated end, if an estimate exists.
    pub fn remaining_ms(&self) -> Option<i64> {
        (self.estimated_duration_ms > 0)
            .then(|| self.estimated_duration_ms as i64 - self.next_offset_ms as i64)
    }
}

/// A fragment downloaded to local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalClip {
    path: PathBuf,
    size_bytes: u64,
}

impl LocalClip {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Remove the clip from disk. Failures are logged only.
    pub async fn discard(self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Discarded fragment clip"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove fragment clip"
            ),
        }
    }
}
