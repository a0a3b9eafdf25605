//! In-memory collaborators and a wiring helper for engine tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use fragment_ingest::{
    DeliverySink, DurationProbe, Error, FragmentFetcher, FragmentScheduler, LocalClip,
    ManualClock, ProgressStore, ReconcileConfig, Reconciler, Recording, RecordingSource, Result,
    SchedulerConfig, StoreConfig,
};

pub const T0: f64 = 1_700_000_000.0;

/// Source returning whatever listing was set last.
#[derive(Default)]
pub struct MockSource {
    listing: Mutex<Vec<Recording>>,
    fail: Mutex<bool>,
    pub calls: AtomicUsize,
}

impl MockSource {
    pub fn set(&self, recordings: Vec<Recording>) {
        *self.listing.lock() = recordings;
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

#[async_trait]
impl RecordingSource for MockSource {
    async fn list_recordings(
        &self,
        _channel_id: &str,
        _from_time: i64,
        _to_time: i64,
        limit: usize,
    ) -> Result<Vec<Recording>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail.lock() {
            return Err(Error::source_failed("server unreachable"));
        }
        Ok(self.listing.lock().iter().take(limit).cloned().collect())
    }
}

/// Fetcher writing the clip length (ms) into a real file.
pub struct MockFetcher {
    dir: PathBuf,
    /// Clips are never longer than this.
    pub max_clip_ms: Mutex<Option<u64>>,
    pub unavailable: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<(String, u64, u64)>>,
}

impl MockFetcher {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            max_clip_ms: Mutex::new(None),
            unavailable: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_unavailable(&self, id: &str, unavailable: bool) {
        let mut set = self.unavailable.lock();
        if unavailable {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }

    pub fn calls_for(&self, id: &str) -> Vec<(u64, u64)> {
        self.calls
            .lock()
            .iter()
            .filter(|(rid, _, _)| rid == id)
            .map(|(_, offset, duration)| (*offset, *duration))
            .collect()
    }
}

#[async_trait]
impl FragmentFetcher for MockFetcher {
    async fn fetch_fragment(
        &self,
        recording_id: &str,
        offset_ms: u64,
        duration_ms: u64,
    ) -> Option<LocalClip> {
        self.calls
            .lock()
            .push((recording_id.to_string(), offset_ms, duration_ms));
        if self.unavailable.lock().contains(recording_id) {
            return None;
        }

        let clip_ms = match *self.max_clip_ms.lock() {
            Some(max) => duration_ms.min(max),
            None => duration_ms,
        };
        let path = self
            .dir
            .join(format!("{recording_id}_{offset_ms}_{duration_ms}.mp4"));
        let body = clip_ms.to_string();
        tokio::fs::write(&path, body.as_bytes()).await.ok()?;
        Some(LocalClip::new(path, body.len() as u64))
    }
}

/// Probe reading the length written by [`MockFetcher`].
#[derive(Default)]
pub struct MockProbe {
    pub broken: Mutex<bool>,
}

#[async_trait]
impl DurationProbe for MockProbe {
    async fn probe_duration(&self, clip: &LocalClip) -> (f64, bool) {
        if *self.broken.lock() {
            return (0.0, false);
        }
        match tokio::fs::read_to_string(clip.path()).await {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) => (ms as f64 / 1000.0, true),
                Err(_) => (0.0, false),
            },
            Err(_) => (0.0, false),
        }
    }
}

/// Sink recording deliveries; can be told to reject the next N clips.
#[derive(Default)]
pub struct MockSink {
    pub reject_next: AtomicUsize,
    pub delivered: Mutex<Vec<(String, String)>>,
}

impl MockSink {
    pub fn delivered_files(&self) -> Vec<String> {
        self.delivered.lock().iter().map(|(f, _)| f.clone()).collect()
    }
}

#[async_trait]
impl DeliverySink for MockSink {
    async fn deliver(&self, clip: &LocalClip, caption: &str) -> bool {
        let rejected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return false;
        }
        let name = clip
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.delivered.lock().push((name, caption.to_string()));
        true
    }
}

/// Fully wired engine over mock collaborators.
pub struct Harness {
    pub dir: TempDir,
    pub clock: ManualClock,
    pub source: Arc<MockSource>,
    pub fetcher: Arc<MockFetcher>,
    pub probe: Arc<MockProbe>,
    pub sink: Arc<MockSink>,
    pub store: Arc<ProgressStore>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(SchedulerConfig::default(), ReconcileConfig::default()).await
    }

    pub async fn with_config(scheduler: SchedulerConfig, reconcile: ReconcileConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = ManualClock::new(T0);
        let clips = dir.path().join("clips");
        std::fs::create_dir_all(&clips).expect("clip dir");

        let store = Arc::new(
            ProgressStore::load(
                dir.path().join("state.json"),
                StoreConfig {
                    default_estimated_duration_ms: scheduler.default_estimated_duration_ms,
                    ..Default::default()
                },
                Arc::new(clock.clone()),
            )
            .await,
        );

        let source = Arc::new(MockSource::default());
        let fetcher = Arc::new(MockFetcher::new(clips));
        let probe = Arc::new(MockProbe::default());
        let sink = Arc::new(MockSink::default());

        let fragment_scheduler = FragmentScheduler::new(
            store.clone(),
            fetcher.clone(),
            probe.clone(),
            sink.clone(),
            Arc::new(clock.clone()),
            scheduler,
            "Porch",
        );
        let reconciler = Reconciler::new(
            source.clone(),
            store.clone(),
            fragment_scheduler,
            Arc::new(clock.clone()),
            reconcile,
        );

        Self {
            dir,
            clock,
            source,
            fetcher,
            probe,
            sink,
            store,
            reconciler,
        }
    }

    /// Advance the clock by one fragment interval.
    pub fn tick(&self) {
        self.clock.advance(Duration::from_secs(10).as_secs_f64());
    }

    pub fn clip_dir_is_empty(&self) -> bool {
        std::fs::read_dir(self.dir.path().join("clips"))
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }
}

pub fn recording(id: &str) -> Recording {
    Recording::new(id, "5", T0 as i64 - 30)
}
