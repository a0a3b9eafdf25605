//! Interfaces of the remote services the engine drives.
//!
//! Implementations own their transport, authentication and retry policy.
//! The engine only sees the outcome of each call.

use async_trait::async_trait;

use crate::Result;
use crate::model::{LocalClip, Recording};

/// Lists recordings known to the surveillance server.
#[async_trait]
pub trait RecordingSource: Send + Sync {
    /// Recordings of `channel_id` started within `[from_time, to_time]`
    /// (epoch seconds), at most `limit` of them.
    async fn list_recordings(
        &self,
        channel_id: &str,
        from_time: i64,
        to_time: i64,
        limit: usize,
    ) -> Result<Vec<Recording>>;
}

/// Downloads a time range of a recording to local disk.
#[async_trait]
pub trait FragmentFetcher: Send + Sync {
    /// `None` when the range is unavailable or the download failed.
    async fn fetch_fragment(
        &self,
        recording_id: &str,
        offset_ms: u64,
        duration_ms: u64,
    ) -> Option<LocalClip>;
}

/// Measures the playable length of a local clip.
#[async_trait]
pub trait DurationProbe: Send + Sync {
    /// `(seconds, ok)`; `ok` is false when the length could not be determined.
    async fn probe_duration(&self, clip: &LocalClip) -> (f64, bool);
}

/// Delivers a clip with its caption to the messaging endpoint.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, clip: &LocalClip, caption: &str) -> bool;
}
