//! The polling loop.
//!
//! Each cycle lists the recent recordings of one channel, drives the
//! [`FragmentScheduler`] over every recording that is not yet completed, and
//! completes tracked recordings that have been missing from the listing for
//! longer than the lost timeout. Cleanup and stats run on a coarser cadence.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;
use crate::clock::Clock;
use crate::collaborators::RecordingSource;
use crate::model::Recording;
use crate::scheduler::{FragmentRequest, FragmentScheduler, Prepared, StepOutcome};
use crate::store::{ProgressStore, StoreStats};

/// Upper bound for concurrent fragment downloads within one cycle.
pub const MAX_FETCH_CONCURRENCY: usize = 3;

/// Loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub channel_id: String,
    /// Pause between cycles.
    pub poll_interval: Duration,
    /// How far back each poll looks.
    pub lookback: Duration,
    /// Maximum recordings requested per poll.
    pub poll_limit: usize,
    /// Absence from the poll after which a tracked recording is completed.
    pub lost_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Age after which unseen entries are purged by cleanup.
    pub retention: Duration,
    /// Concurrent downloads per cycle, `1..=MAX_FETCH_CONCURRENCY`.
    pub fetch_concurrency: usize,
    /// Pause after a failed cycle.
    pub error_backoff: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            channel_id: "5".to_string(),
            poll_interval: Duration::from_secs(10),
            lookback: Duration::from_secs(600),
            poll_limit: 30,
            lost_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(300),
            retention: Duration::from_secs(24 * 60 * 60),
            fetch_concurrency: 1,
            error_backoff: Duration::from_secs(10),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Distinct recordings returned by the poll.
    pub polled: usize,
    /// Recordings handed to the scheduler.
    pub scheduled: usize,
    pub delivered: usize,
    /// Recordings completed by the scheduler.
    pub completed: usize,
    /// Recordings completed because they vanished from the poll.
    pub lost: usize,
    /// Entries purged, when cleanup ran this cycle.
    pub cleaned: Option<usize>,
    /// The cycle stopped early because shutdown was requested.
    pub interrupted: bool,
}

impl CycleReport {
    fn record(&mut self, outcome: StepOutcome) {
        if outcome.delivered() {
            self.delivered += 1;
        }
        if outcome.completed() {
            self.completed += 1;
        }
    }
}

/// Drives polling, scheduling and lost-recording detection.
pub struct Reconciler {
    source: Arc<dyn RecordingSource>,
    store: Arc<ProgressStore>,
    scheduler: FragmentScheduler,
    clock: Arc<dyn Clock>,
    config: ReconcileConfig,
    last_cleanup: f64,
    session_fragments: u64,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn RecordingSource>,
        store: Arc<ProgressStore>,
        scheduler: FragmentScheduler,
        clock: Arc<dyn Clock>,
        mut config: ReconcileConfig,
    ) -> Self {
        config.fetch_concurrency = config.fetch_concurrency.clamp(1, MAX_FETCH_CONCURRENCY);
        let last_cleanup = clock.now();
        Self {
            source,
            store,
            scheduler,
            clock,
            config,
            last_cleanup,
            session_fragments: 0,
        }
    }

    pub fn store(&self) -> &Arc<ProgressStore> {
        &self.store
    }

    /// Fragments delivered since this loop was created.
    pub fn session_fragments(&self) -> u64 {
        self.session_fragments
    }

    /// Run cycles until `shutdown` is cancelled.
    pub async fn run(&mut self, shutdown: &CancellationToken) {
        info!(
            channel_id = %self.config.channel_id,
            interval_secs = self.config.poll_interval.as_secs_f64(),
            fragment_ms = self.scheduler.config().fragment_duration_ms(),
            fetch_concurrency = self.config.fetch_concurrency,
            "Starting reconciliation loop"
        );

        while !shutdown.is_cancelled() {
            let pause = match self.run_cycle(shutdown).await {
                Ok(report) => {
                    debug!(?report, "Cycle finished");
                    self.config.poll_interval
                }
                Err(e) => {
                    error!(error = %e, "Cycle failed");
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(
            session_fragments = self.session_fragments,
            "Reconciliation loop stopped"
        );
    }

    /// Run a single poll/schedule/sweep cycle.
    pub async fn run_cycle(&mut self, shutdown: &CancellationToken) -> Result<CycleReport> {
        let now = self.clock.now();
        let to_time = now as i64;
        let from_time = to_time - self.config.lookback.as_secs() as i64;

        let listed = self
            .source
            .list_recordings(&self.config.channel_id, from_time, to_time, self.config.poll_limit)
            .await?;

        let mut seen = HashSet::with_capacity(listed.len());
        let recordings: Vec<Recording> = listed
            .into_iter()
            .filter(|r| seen.insert(r.id.clone()))
            .collect();
        debug!(count = recordings.len(), "Polled recordings");

        let mut report = CycleReport {
            polled: recordings.len(),
            ..Default::default()
        };

        if self.config.fetch_concurrency > 1 {
            self.schedule_concurrent(&recordings, shutdown, &mut report).await;
        } else {
            self.schedule_sequential(&recordings, shutdown, &mut report).await;
        }
        self.session_fragments += report.delivered as u64;

        if report.interrupted {
            return Ok(report);
        }

        report.lost = self.sweep_lost(&seen).await;
        report.cleaned = self.maybe_cleanup().await;
        Ok(report)
    }

    async fn schedule_sequential(
        &self,
        recordings: &[Recording],
        shutdown: &CancellationToken,
        report: &mut CycleReport,
    ) {
        for recording in recordings {
            if shutdown.is_cancelled() {
                report.interrupted = true;
                return;
            }
            if self.store.is_completed(&recording.id).await {
                continue;
            }

            let progress = self.store.get_or_create(&recording.id).await;
            report.scheduled += 1;
            let outcome = self.scheduler.step(recording, &progress).await;
            report.record(outcome);
        }
    }

    /// Decide serially, download up to `fetch_concurrency` fragments at once,
    /// then deliver and record serially in poll order.
    async fn schedule_concurrent(
        &self,
        recordings: &[Recording],
        shutdown: &CancellationToken,
        report: &mut CycleReport,
    ) {
        let mut jobs: Vec<(&Recording, FragmentRequest)> = Vec::new();
        for recording in recordings {
            if shutdown.is_cancelled() {
                report.interrupted = true;
                return;
            }
            if self.store.is_completed(&recording.id).await {
                continue;
            }

            let progress = self.store.get_or_create(&recording.id).await;
            report.scheduled += 1;
            match self.scheduler.prepare(&progress).await {
                Prepared::Done(outcome) => report.record(outcome),
                Prepared::Fetch(request) => jobs.push((recording, request)),
            }
        }

        let scheduler = &self.scheduler;
        let fetched: Vec<_> = futures::stream::iter(jobs)
            .map(move |(recording, request)| async move {
                let clip = scheduler.fetch(&request).await;
                (recording, request, clip)
            })
            .buffered(self.config.fetch_concurrency)
            .collect()
            .await;

        for (recording, request, clip) in fetched {
            if shutdown.is_cancelled() {
                // Unrecorded fetches are simply retried on the next run.
                if let Some(clip) = clip {
                    clip.discard().await;
                }
                report.interrupted = true;
                continue;
            }
            let outcome = scheduler.finish(recording, &request, clip).await;
            report.record(outcome);
        }
    }

    /// Complete tracked recordings absent from the poll for too long.
    async fn sweep_lost(&self, polled: &HashSet<String>) -> usize {
        let now = self.clock.now();
        let timeout = self.config.lost_timeout.as_secs_f64();
        let mut lost = 0;

        for id in self.store.active_ids().await {
            if polled.contains(&id) {
                continue;
            }
            let Some(progress) = self.store.get(&id).await else {
                continue;
            };
            if now - progress.last_seen_time > timeout {
                info!(
                    recording_id = %id,
                    missing_secs = now - progress.last_seen_time,
                    "Recording no longer listed, marking completed"
                );
                self.store.mark_completed(&id).await;
                lost += 1;
            }
        }
        lost
    }

    async fn maybe_cleanup(&mut self) -> Option<usize> {
        let now = self.clock.now();
        if now - self.last_cleanup < self.config.cleanup_interval.as_secs_f64() {
            return None;
        }
        self.last_cleanup = now;

        let purged = self.store.cleanup(self.config.retention).await;
        let StoreStats {
            active_recordings,
            completed_recordings,
            total_fragments_sent,
        } = self.store.stats().await;
        info!(
            active = active_recordings,
            completed = completed_recordings,
            fragments = total_fragments_sent,
            session_fragments = self.session_fragments,
            "Progress stats"
        );
        Some(purged)
    }
}
