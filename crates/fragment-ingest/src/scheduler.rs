//! Per-recording fragment scheduling.
//!
//! [`plan`] is the pure decision: given a progress snapshot and the current
//! time, is a fragment due and which range should be requested. The
//! [`FragmentScheduler`] carries that decision out against the collaborators
//! and records the result in the [`ProgressStore`].
//!
//! A step is split into `prepare` (decide, serialized), `fetch` (network only)
//! and `finish` (probe, deliver, record; serialized) so a caller may overlap
//! the fetches of several recordings while keeping every state transition in
//! order.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::caption::FragmentCaption;
use crate::clock::Clock;
use crate::collaborators::{DeliverySink, DurationProbe, FragmentFetcher};
use crate::model::{FragmentProgress, LocalClip, Recording};
use crate::store::ProgressStore;

/// Scheduling policy.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Length of a regular fragment.
    pub fragment_duration: Duration,
    /// Margin subtracted from the fragment interval when deciding whether the
    /// next fragment is due.
    pub due_slack: Duration,
    /// Estimated total length assigned to a recording on its first fragment.
    pub default_estimated_duration_ms: u64,
    /// Consecutive failed fetches after which a recording is completed.
    pub max_consecutive_fails: u32,
    /// Delivered fragments after which a recording is completed.
    pub max_fragments: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fragment_duration: Duration::from_millis(10_000),
            due_slack: Duration::from_secs(2),
            default_estimated_duration_ms: 30_000,
            max_consecutive_fails: 3,
            max_fragments: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn fragment_duration_ms(&self) -> u64 {
        self.fragment_duration.as_millis() as u64
    }
}

/// A fragment range to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentRequest {
    pub recording_id: String,
    pub offset_ms: u64,
    pub duration_ms: u64,
    /// 1-based ordinal this fragment will have once delivered.
    pub fragment_number: u32,
    /// Initial estimate to record before fetching, if this is the first look.
    pub seed_estimate_ms: Option<u64>,
}

/// Decision for one recording in one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Already completed.
    Skip,
    /// Last attempt too recent.
    NotDue,
    /// The cursor has reached the estimated end.
    Exhausted { seed_estimate_ms: Option<u64> },
    Fetch(FragmentRequest),
}

/// Decide what to do for `progress` at time `now` (epoch seconds).
pub fn plan(progress: &FragmentProgress, now: f64, config: &SchedulerConfig) -> Plan {
    if progress.is_completed {
        return Plan::Skip;
    }

    let interval = config.fragment_duration.as_secs_f64() - config.due_slack.as_secs_f64();
    let due = progress.fragments_sent == 0 || now - progress.last_attempt_time >= interval;
    if !due {
        return Plan::NotDue;
    }

    let mut estimated_duration_ms = progress.estimated_duration_ms;
    let mut seed_estimate_ms = None;
    if progress.fragments_sent == 0 && !progress.full_duration_checked {
        estimated_duration_ms = config.default_estimated_duration_ms;
        seed_estimate_ms = Some(estimated_duration_ms);
    }

    let fragment_ms = config.fragment_duration_ms();
    let mut duration_ms = fragment_ms;
    if estimated_duration_ms > 0 {
        let remaining = estimated_duration_ms as i64 - progress.next_offset_ms as i64;
        if remaining <= 0 {
            return Plan::Exhausted { seed_estimate_ms };
        }
        duration_ms = fragment_ms.min(remaining as u64);
    }

    Plan::Fetch(FragmentRequest {
        recording_id: progress.recording_id.clone(),
        offset_ms: progress.next_offset_ms,
        duration_ms,
        fragment_number: progress.fragments_sent + 1,
        seed_estimate_ms,
    })
}

/// Result of driving one recording through one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Skipped,
    NotDue,
    /// Completed because the cursor reached the estimated end.
    Exhausted,
    FetchFailed { completed: bool },
    DeliveryFailed,
    Delivered { completed: bool },
}

impl StepOutcome {
    pub fn delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub fn completed(&self) -> bool {
        matches!(
            self,
            Self::Exhausted
                | Self::FetchFailed { completed: true }
                | Self::Delivered { completed: true }
        )
    }
}

/// Outcome of the serialized decision phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prepared {
    Done(StepOutcome),
    Fetch(FragmentRequest),
}

/// Drives a recording's fragments through fetch, probe and delivery.
pub struct FragmentScheduler {
    store: Arc<ProgressStore>,
    fetcher: Arc<dyn FragmentFetcher>,
    probe: Arc<dyn DurationProbe>,
    sink: Arc<dyn DeliverySink>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    channel_name: String,
}

impl FragmentScheduler {
    pub fn new(
        store: Arc<ProgressStore>,
        fetcher: Arc<dyn FragmentFetcher>,
        probe: Arc<dyn DurationProbe>,
        sink: Arc<dyn DeliverySink>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        channel_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            fetcher,
            probe,
            sink,
            clock,
            config,
            channel_name: channel_name.into(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run a full step for one recording.
    pub async fn step(&self, recording: &Recording, progress: &FragmentProgress) -> StepOutcome {
        match self.prepare(progress).await {
            Prepared::Done(outcome) => outcome,
            Prepared::Fetch(request) => {
                let clip = self.fetch(&request).await;
                self.finish(recording, &request, clip).await
            }
        }
    }

    /// Decide, and record any seeded estimate or exhaustion.
    pub async fn prepare(&self, progress: &FragmentProgress) -> Prepared {
        let id = progress.recording_id.as_str();

        match plan(progress, self.clock.now(), &self.config) {
            Plan::Skip => {
                debug!(recording_id = %id, "Recording already completed, skipping");
                Prepared::Done(StepOutcome::Skipped)
            }
            Plan::NotDue => Prepared::Done(StepOutcome::NotDue),
            Plan::Exhausted { seed_estimate_ms } => {
                if let Some(estimate) = seed_estimate_ms {
                    self.store.seed_estimate(id, estimate).await;
                }
                info!(
                    recording_id = %id,
                    next_offset_ms = progress.next_offset_ms,
                    "Reached estimated end of recording"
                );
                self.store.mark_completed(id).await;
                Prepared::Done(StepOutcome::Exhausted)
            }
            Plan::Fetch(request) => {
                if let Some(estimate) = request.seed_estimate_ms {
                    info!(
                        recording_id = %id,
                        estimated_duration_ms = estimate,
                        "Starting recording"
                    );
                    self.store.seed_estimate(id, estimate).await;
                }
                if request.duration_ms < self.config.fragment_duration_ms() {
                    info!(
                        recording_id = %id,
                        remaining_ms = request.duration_ms,
                        "Requesting final partial fragment"
                    );
                }
                Prepared::Fetch(request)
            }
        }
    }

    /// Download the requested range. Touches no state.
    pub async fn fetch(&self, request: &FragmentRequest) -> Option<LocalClip> {
        debug!(
            recording_id = %request.recording_id,
            offset_ms = request.offset_ms,
            duration_ms = request.duration_ms,
            "Fetching fragment"
        );
        self.fetcher
            .fetch_fragment(&request.recording_id, request.offset_ms, request.duration_ms)
            .await
    }

    /// Probe, deliver and record the result of a fetch.
    pub async fn finish(
        &self,
        recording: &Recording,
        request: &FragmentRequest,
        clip: Option<LocalClip>,
    ) -> StepOutcome {
        let id = request.recording_id.as_str();

        let Some(clip) = clip else {
            warn!(recording_id = %id, offset_ms = request.offset_ms, "Failed to fetch fragment");
            return self.record_fetch_failure(id).await;
        };

        let actual_secs = self.actual_duration_secs(id, request, &clip).await;
        let caption = FragmentCaption {
            channel_name: &self.channel_name,
            fragment_number: request.fragment_number,
            recording_start: recording.start_time,
            offset_ms: request.offset_ms,
            duration_secs: actual_secs,
        }
        .render_html();

        let delivered = self.sink.deliver(&clip, &caption).await;
        clip.discard().await;

        if !delivered {
            error!(
                recording_id = %id,
                fragment = request.fragment_number,
                "Failed to deliver fragment"
            );
            self.store.mark_fragment_failed(id).await;
            return StepOutcome::DeliveryFailed;
        }

        let actual_ms = (actual_secs * 1000.0).round() as u64;
        let next_offset = request.offset_ms + actual_ms;
        let Some(progress) = self.store.mark_fragment_sent(id, next_offset, actual_ms).await else {
            return StepOutcome::Delivered { completed: false };
        };

        info!(
            recording_id = %id,
            fragment = progress.fragments_sent,
            from_secs = request.offset_ms as f64 / 1000.0,
            to_secs = next_offset as f64 / 1000.0,
            "Delivered fragment"
        );

        let completed = progress.fragments_sent >= self.config.max_fragments;
        if completed {
            info!(
                recording_id = %id,
                fragments = progress.fragments_sent,
                "Fragment cap reached"
            );
            self.store.mark_completed(id).await;
        }
        StepOutcome::Delivered { completed }
    }

    async fn record_fetch_failure(&self, id: &str) -> StepOutcome {
        let Some(progress) = self.store.mark_fragment_failed(id).await else {
            return StepOutcome::FetchFailed { completed: false };
        };

        let completed = progress.consecutive_fails >= self.config.max_consecutive_fails;
        if completed {
            info!(
                recording_id = %id,
                consecutive_fails = progress.consecutive_fails,
                "Giving up on recording after consecutive failures"
            );
            self.store.mark_completed(id).await;
        }
        StepOutcome::FetchFailed { completed }
    }

    /// Probed clip length, or the requested length when probing fails.
    async fn actual_duration_secs(&self, id: &str, request: &FragmentRequest, clip: &LocalClip) -> f64 {
        let (secs, ok) = self.probe.probe_duration(clip).await;
        if ok && secs > 0.0 {
            return secs;
        }
        warn!(
            recording_id = %id,
            requested_ms = request.duration_ms,
            "Could not determine fragment length, assuming requested length"
        );
        request.duration_ms as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(sent: u32, offset: u64, estimate: u64) -> FragmentProgress {
        FragmentProgress {
            recording_id: "r1".to_string(),
            next_offset_ms: offset,
            fragments_sent: sent,
            estimated_duration_ms: estimate,
            full_duration_checked: sent > 0 || estimate > 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_first_fragment_seeds_estimate() {
        let config = SchedulerConfig::default();
        let fresh = FragmentProgress::new("r1", 0.0);

        let Plan::Fetch(request) = plan(&fresh, 0.0, &config) else {
            panic!("expected fetch");
        };
        assert_eq!(request.offset_ms, 0);
        assert_eq!(request.duration_ms, 10_000);
        assert_eq!(request.fragment_number, 1);
        assert_eq!(request.seed_estimate_ms, Some(30_000));
    }

    #[test]
    fn test_plan_respects_interval_with_slack() {
        let config = SchedulerConfig::default();
        let mut p = progress(1, 10_000, 30_000);
        p.last_attempt_time = 100.0;

        assert_eq!(plan(&p, 107.9, &config), Plan::NotDue);
        assert!(matches!(plan(&p, 108.0, &config), Plan::Fetch(_)));
    }

    #[test]
    fn test_plan_shortens_final_fragment() {
        let config = SchedulerConfig::default();
        let p = progress(2, 20_000, 25_000);

        let Plan::Fetch(request) = plan(&p, 1_000.0, &config) else {
            panic!("expected fetch");
        };
        assert_eq!(request.offset_ms, 20_000);
        assert_eq!(request.duration_ms, 5_000);
        assert_eq!(request.seed_estimate_ms, None);
    }

    #[test]
    fn test_plan_exhausted_at_estimate() {
        let config = SchedulerConfig::default();
        let p = progress(3, 25_000, 25_000);
        assert_eq!(
            plan(&p, 1_000.0, &config),
            Plan::Exhausted {
                seed_estimate_ms: None
            }
        );
    }

    #[test]
    fn test_plan_unknown_estimate_requests_full_fragment() {
        let config = SchedulerConfig::default();
        let p = progress(1, 50_000, 0);

        let Plan::Fetch(request) = plan(&p, 1_000.0, &config) else {
            panic!("expected fetch");
        };
        assert_eq!(request.duration_ms, 10_000);
    }

    #[test]
    fn test_plan_skips_completed() {
        let config = SchedulerConfig::default();
        let mut p = progress(1, 0, 0);
        p.is_completed = true;
        assert_eq!(plan(&p, 1_000.0, &config), Plan::Skip);
    }

    #[test]
    fn test_plan_zero_default_estimate_leaves_length_unknown() {
        let config = SchedulerConfig {
            default_estimated_duration_ms: 0,
            ..Default::default()
        };
        let fresh = FragmentProgress::new("r1", 0.0);

        let Plan::Fetch(request) = plan(&fresh, 0.0, &config) else {
            panic!("expected fetch");
        };
        assert_eq!(request.duration_ms, 10_000);
        assert_eq!(request.seed_estimate_ms, Some(0));
    }

    #[test]
    fn test_step_outcome_flags() {
        assert!(StepOutcome::Delivered { completed: false }.delivered());
        assert!(!StepOutcome::DeliveryFailed.delivered());
        assert!(StepOutcome::Exhausted.completed());
        assert!(StepOutcome::FetchFailed { completed: true }.completed());
        assert!(!StepOutcome::FetchFailed { completed: false }.completed());
    }
}
