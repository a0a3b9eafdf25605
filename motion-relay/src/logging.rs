//! Tracing subscriber setup.
//!
//! Console output uses local-time timestamps, as text or JSON lines. When a
//! log directory is configured a second, plain-text layer writes to a daily
//! rotated file through a non-blocking writer.

use std::path::Path;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::{LogConfig, LogFormat};
use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "motion_relay=info,fragment_ingest=info";

const LOG_FILE_PREFIX: &str = "motion-relay.log";

/// Formats timestamps in the host's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Filter directive for a `--log-level` value.
///
/// A bare level such as `debug` applies to this application's crates only;
/// anything containing `=` or `,` is used as a full directive.
pub fn filter_directive(level: Option<&str>) -> String {
    match level.map(str::trim) {
        None | Some("") => DEFAULT_LOG_FILTER.to_string(),
        Some(directive) if directive.contains('=') || directive.contains(',') => {
            directive.to_string()
        }
        Some(level) => format!("motion_relay={level},fragment_ingest={level}"),
    }
}

fn build_filter(level: Option<&str>) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = filter_directive(level);
    EnvFilter::try_new(&directive)
        .map_err(|e| Error::config(format!("Invalid log filter '{directive}': {e}")))
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the lifetime of the process, otherwise
/// buffered file output is lost.
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config.level.as_deref())?;

    let (text_layer, json_layer) = match config.format {
        LogFormat::Text => (
            Some(fmt::layer().with_ansi(true).with_timer(LocalTimer)),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(fmt::layer().json().with_timer(LocalTimer)),
        ),
    };

    let (file_layer, guard) = match config.dir.as_deref() {
        Some(dir) => {
            let (layer, guard) = rolling_file_layer(dir)?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::config(format!("Failed to set global default subscriber: {e}")))?;

    Ok(guard)
}

fn rolling_file_layer<S>(dir: &Path) -> Result<(Box<dyn Layer<S> + Send + Sync>, WorkerGuard)>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + 'static,
{
    std::fs::create_dir_all(dir).map_err(|e| Error::io_path("creating log directory", dir, e))?;

    let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_timer(LocalTimer)
        .boxed();

    Ok((layer, guard))
}
