//! Durable progress store.
//!
//! Holds one [`FragmentProgress`] per tracked recording plus a bounded,
//! insertion-ordered set of completed ids. Every mutation runs under a single
//! async mutex and rewrites the state file wholesale (temp file + rename)
//! before the lock is released, so writes reach disk in mutation order.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::model::FragmentProgress;
use crate::{Error, Result};

/// Store tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum number of completed ids retained.
    pub completed_limit: usize,
    /// Estimate applied by `mark_fragment_sent` on the first delivered
    /// fragment when no estimate exists yet.
    pub default_estimated_duration_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            completed_limit: 1000,
            default_estimated_duration_ms: 30_000,
        }
    }
}

/// Aggregate counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StoreStats {
    pub active_recordings: usize,
    pub completed_recordings: usize,
    pub total_fragments_sent: u64,
}

/// On-disk layout.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct PersistedState {
    completed_ids: Vec<String>,
    progress: BTreeMap<String, FragmentProgress>,
    /// Fragments delivered over the store's lifetime.
    total_fragments_sent: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_at: Option<String>,
}

/// Completed ids, oldest first.
#[derive(Debug, Default)]
struct CompletedIds {
    order: VecDeque<String>,
    index: HashSet<String>,
}

impl CompletedIds {
    fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    fn insert(&mut self, id: &str) -> bool {
        if !self.index.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        true
    }

    /// Drop the oldest ids until at most `limit` remain.
    fn trim(&mut self, limit: usize) -> usize {
        let mut dropped = 0;
        while self.order.len() > limit {
            if let Some(oldest) = self.order.pop_front() {
                self.index.remove(&oldest);
                dropped += 1;
            }
        }
        dropped
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug, Default)]
struct StoreState {
    progress: BTreeMap<String, FragmentProgress>,
    completed: CompletedIds,
    total_fragments_sent: u64,
}

impl StoreState {
    fn from_persisted(persisted: PersistedState) -> Self {
        let mut state = StoreState::default();
        // Files written before the counter existed only know their entries.
        let entry_total: u64 = persisted
            .progress
            .values()
            .map(|p| u64::from(p.fragments_sent))
            .sum();
        state.total_fragments_sent = persisted.total_fragments_sent.max(entry_total);
        for id in persisted.completed_ids {
            state.completed.insert(&id);
        }
        for (id, mut progress) in persisted.progress {
            if progress.is_completed {
                // Terminal entries only live in the completed set.
                state.completed.insert(&id);
                continue;
            }
            progress.recording_id = id.clone();
            state.progress.insert(id, progress);
        }
        state
    }

    fn to_persisted(&self) -> PersistedState {
        PersistedState {
            completed_ids: self.completed.order.iter().cloned().collect(),
            progress: self.progress.clone(),
            total_fragments_sent: self.total_fragments_sent,
            updated_at: Some(chrono::Local::now().to_rfc3339()),
        }
    }
}

/// Crash-safe progress store backed by a JSON file.
pub struct ProgressStore {
    path: PathBuf,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<StoreState>,
}

impl ProgressStore {
    /// Load the store from `path`.
    ///
    /// A missing file yields an empty store. An unreadable or corrupt file is
    /// logged and also yields an empty store.
    pub async fn load(path: impl Into<PathBuf>, config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        let path = path.into();
        let state = match read_snapshot(&path).await {
            Ok(Some(persisted)) => {
                let state = StoreState::from_persisted(persisted);
                info!(
                    path = %path.display(),
                    active = state.progress.len(),
                    completed = state.completed.len(),
                    "Loaded progress state"
                );
                state
            }
            Ok(None) => {
                debug!(path = %path.display(), "No progress state found, starting empty");
                StoreState::default()
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to load progress state, starting empty"
                );
                StoreState::default()
            }
        };

        Self {
            path,
            config,
            clock,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the full store.
    pub async fn save(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.write_snapshot(&state).await
    }

    /// True if `id` is in the completed set or its entry is terminal.
    pub async fn is_completed(&self, id: &str) -> bool {
        let state = self.state.lock().await;
        state.completed.contains(id)
            || state.progress.get(id).is_some_and(|p| p.is_completed)
    }

    /// Snapshot of the entry for `id`, if tracked.
    pub async fn get(&self, id: &str) -> Option<FragmentProgress> {
        self.state.lock().await.progress.get(id).cloned()
    }

    /// Fetch or create the entry for `id`, refreshing its `last_seen_time`.
    ///
    /// The new or refreshed entry is persisted before returning.
    pub async fn get_or_create(&self, id: &str) -> FragmentProgress {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if state.completed.contains(id) {
            let mut progress = FragmentProgress::new(id, now);
            progress.is_completed = true;
            return progress;
        }

        let progress = state.progress.entry(id.to_string()).or_insert_with(|| {
            info!(recording_id = %id, "Started tracking recording");
            FragmentProgress::new(id, now)
        });
        progress.last_seen_time = now;
        let snapshot = progress.clone();

        self.persist_logged(&state).await;
        snapshot
    }

    /// Record the initial duration estimate of a recording.
    pub async fn seed_estimate(&self, id: &str, estimated_duration_ms: u64) -> Option<FragmentProgress> {
        self.mutate(id, |progress, _| {
            progress.estimated_duration_ms = estimated_duration_ms;
            progress.full_duration_checked = true;
        })
        .await
    }

    /// Record a delivered fragment and move the cursor to `next_offset`.
    pub async fn mark_fragment_sent(
        &self,
        id: &str,
        next_offset: u64,
        actual_duration_ms: u64,
    ) -> Option<FragmentProgress> {
        let default_estimate = self.config.default_estimated_duration_ms;
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let Some(progress) = state.progress.get_mut(id) else {
            debug!(recording_id = %id, "Ignoring update for untracked recording");
            return None;
        };
        progress.next_offset_ms = progress.next_offset_ms.max(next_offset);
        progress.fragments_sent += 1;
        progress.last_attempt_time = now;
        progress.consecutive_fails = 0;

        if progress.estimated_duration_ms == 0
            && progress.fragments_sent == 1
            && actual_duration_ms > 0
        {
            progress.estimated_duration_ms = default_estimate;
        }
        let snapshot = progress.clone();
        state.total_fragments_sent += 1;

        self.persist_logged(&state).await;
        Some(snapshot)
    }

    /// Record a failed fetch or delivery attempt.
    pub async fn mark_fragment_failed(&self, id: &str) -> Option<FragmentProgress> {
        self.mutate(id, |progress, now| {
            progress.last_attempt_time = now;
            progress.consecutive_fails += 1;
        })
        .await
    }

    /// Move `id` to the completed set and drop its active entry.
    pub async fn mark_completed(&self, id: &str) {
        let mut state = self.state.lock().await;

        // Insert before removing so the id is never absent from both.
        state.completed.insert(id);
        let removed = state.progress.remove(id);

        self.persist_logged(&state).await;
        info!(
            recording_id = %id,
            fragments_sent = removed.map(|p| p.fragments_sent).unwrap_or(0),
            "Recording marked completed"
        );
    }

    /// Purge entries not seen for `max_age` and trim the completed set.
    ///
    /// Returns the number of purged active entries.
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let max_age = max_age.as_secs_f64();
        let mut state = self.state.lock().await;

        let before = state.progress.len();
        state
            .progress
            .retain(|_, progress| now - progress.last_seen_time <= max_age);
        let purged = before - state.progress.len();

        let trimmed = state.completed.trim(self.config.completed_limit);

        if purged > 0 || trimmed > 0 {
            info!(purged, trimmed, "Cleaned up progress state");
        }

        self.persist_logged(&state).await;
        purged
    }

    /// Ids of all non-terminal tracked recordings.
    pub async fn active_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .progress
            .values()
            .filter(|p| !p.is_completed)
            .map(|p| p.recording_id.clone())
            .collect()
    }

    pub async fn stats(&self) -> StoreStats {
        let state = self.state.lock().await;
        StoreStats {
            active_recordings: state.progress.values().filter(|p| !p.is_completed).count(),
            completed_recordings: state.completed.len(),
            total_fragments_sent: state.total_fragments_sent,
        }
    }

    /// Apply `f` to a tracked entry and persist. Unknown ids are ignored.
    async fn mutate<F>(&self, id: &str, f: F) -> Option<FragmentProgress>
    where
        F: FnOnce(&mut FragmentProgress, f64),
    {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let Some(progress) = state.progress.get_mut(id) else {
            debug!(recording_id = %id, "Ignoring update for untracked recording");
            return None;
        };
        f(progress, now);
        let snapshot = progress.clone();

        self.persist_logged(&state).await;
        Some(snapshot)
    }

    async fn persist_logged(&self, state: &StoreState) {
        if let Err(e) = self.write_snapshot(state).await {
            error!(path = %self.path.display(), error = %e, "Failed to save progress state");
        }
    }

    async fn write_snapshot(&self, state: &StoreState) -> Result<()> {
        let json = serde_json::to_string_pretty(&state.to_persisted())?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io_path("creating state directory", parent, e))?;
        }

        let temp_path = temp_path_for(&self.path);
        tokio::fs::write(&temp_path, json.as_bytes())
            .await
            .map_err(|e| Error::io_path("writing state file", &temp_path, e))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| Error::io_path("replacing state file", &self.path, e))?;

        debug!(path = %self.path.display(), "Progress state saved");
        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn read_snapshot(path: &Path) -> Result<Option<PersistedState>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io_path("reading state file", path, e)),
    };
    Ok(Some(serde_json::from_str(&raw)?))
}
