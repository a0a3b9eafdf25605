//! Clip length measurement with `ffprobe`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use fragment_ingest::{DurationProbe, LocalClip};
use process_utils::{ProcessError, run_captured};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bytes inspected by the container sniffing fallback.
const SNIFF_BYTES: usize = 10_000;

/// Assumed bitrate for the fallback estimate.
const FALLBACK_BYTES_PER_SEC: f64 = 100.0 * 1024.0;

/// Measures clips by running `ffprobe`.
///
/// When `ffprobe` is unavailable or fails, a file that looks like MP4 gets a
/// rough estimate from its size.
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    program: PathBuf,
}

impl FfprobeProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run_ffprobe(&self, path: &Path) -> Result<f64, String> {
        let args = [
            OsStr::new("-v"),
            OsStr::new("error"),
            OsStr::new("-show_entries"),
            OsStr::new("format=duration"),
            OsStr::new("-of"),
            OsStr::new("default=noprint_wrappers=1:nokey=1"),
            path.as_os_str(),
        ];
        let output = run_captured(&self.program, args, PROBE_TIMEOUT)
            .await
            .map_err(|e| match e {
                ProcessError::NotFound { .. } => {
                    "ffprobe not found; install ffmpeg to measure clips".to_string()
                }
                other => other.to_string(),
            })?;
        parse_duration(&output.stdout)
    }
}

/// Parse ffprobe's bare `format=duration` output.
fn parse_duration(stdout: &str) -> Result<f64, String> {
    let value = stdout.trim();
    if value.is_empty() {
        return Err("ffprobe returned no duration".to_string());
    }
    match value.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 0.0 => Ok(secs),
        _ => Err(format!("unparseable ffprobe duration: {value}")),
    }
}

/// Size-based estimate for files whose head contains an `ftyp` or `moov` box.
async fn estimate_from_container(path: &Path, size_bytes: u64) -> Option<f64> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut head = Vec::with_capacity(SNIFF_BYTES);
    (&mut file)
        .take(SNIFF_BYTES as u64)
        .read_to_end(&mut head)
        .await
        .ok()?;

    let looks_like_mp4 = head
        .windows(4)
        .any(|w| w == b"ftyp" || w == b"moov");
    looks_like_mp4.then(|| size_bytes as f64 / FALLBACK_BYTES_PER_SEC)
}

#[async_trait]
impl DurationProbe for FfprobeProbe {
    async fn probe_duration(&self, clip: &LocalClip) -> (f64, bool) {
        let path = clip.path();
        let size_bytes = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Clip file not found");
                return (0.0, false);
            }
        };
        if size_bytes == 0 {
            warn!(path = %path.display(), "Clip file is empty");
            return (0.0, false);
        }

        match self.run_ffprobe(path).await {
            Ok(secs) => {
                debug!(path = %path.display(), duration_s = secs, "ffprobe measured clip");
                return (secs, true);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "ffprobe failed"),
        }

        if let Some(secs) = estimate_from_container(path, size_bytes).await {
            debug!(
                path = %path.display(),
                duration_s = secs,
                "Estimated clip length from file size"
            );
            return (secs, true);
        }

        warn!(path = %path.display(), "Could not determine clip length");
        (0.0, false)
    }
}
