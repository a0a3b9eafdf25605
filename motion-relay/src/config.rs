//! Command-line and environment configuration.
//!
//! Every option can be given as a flag or through the environment variable
//! named next to it; a `.env` file in the working directory is loaded first.
//! [`Args::into_config`] validates the raw values once and produces the typed
//! [`AppConfig`] the rest of the application is built from.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use fragment_ingest::reconcile::MAX_FETCH_CONCURRENCY;
use fragment_ingest::{ReconcileConfig, SchedulerConfig, StoreConfig};

use crate::{Error, Result};

/// Console log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "motion-relay",
    version,
    about = "Relays motion-triggered Surveillance Station recordings to Telegram"
)]
pub struct Args {
    /// Surveillance Station host name or IP address
    #[arg(long, env = "SYNO_IP")]
    pub syno_ip: Option<String>,

    #[arg(long, env = "SYNO_PORT", default_value_t = 5001)]
    pub syno_port: u16,

    #[arg(long, env = "SYNO_USER")]
    pub syno_user: Option<String>,

    #[arg(long, env = "SYNO_PASS", hide_env_values = true)]
    pub syno_pass: Option<String>,

    /// One-time password for accounts with two-factor authentication
    #[arg(long, env = "SYNO_OTP", hide_env_values = true)]
    pub syno_otp: Option<String>,

    /// Accept self-signed TLS certificates from the NAS
    #[arg(long, env = "SYNO_INSECURE_TLS", default_value_t = true, action = ArgAction::Set)]
    pub syno_insecure_tls: bool,

    #[arg(long, env = "TG_TOKEN", hide_env_values = true)]
    pub tg_token: Option<String>,

    #[arg(long, env = "TG_CHAT_ID", allow_hyphen_values = true)]
    pub tg_chat_id: Option<String>,

    /// Camera whose recordings are relayed
    #[arg(long, env = "CAMERA_ID", default_value = "5")]
    pub camera_id: String,

    #[arg(long, env = "STATE_FILE", default_value = "/data/state.json")]
    pub state_file: PathBuf,

    /// Seconds between polls
    #[arg(long, env = "CHECK_INTERVAL", default_value_t = 10)]
    pub check_interval: u64,

    #[arg(long, env = "FRAGMENT_DURATION_MS", default_value_t = 10_000)]
    pub fragment_duration_ms: u64,

    #[arg(long, env = "MAX_CONSECUTIVE_FAILS", default_value_t = 3)]
    pub max_consecutive_fails: u32,

    /// Fragments delivered per recording before it is considered done
    #[arg(long, env = "VIDEO_MAX_FRAGMENTS", default_value_t = 3)]
    pub video_max_fragments: u32,

    #[arg(long, env = "DEFAULT_ESTIMATED_DURATION_MS", default_value_t = 30_000)]
    pub default_estimated_duration_ms: u64,

    #[arg(long, env = "LOOKBACK_SECS", default_value_t = 600)]
    pub lookback_secs: u64,

    #[arg(long, env = "POLL_LIMIT", default_value_t = 30)]
    pub poll_limit: usize,

    #[arg(long, env = "LOST_TIMEOUT_SECS", default_value_t = 60)]
    pub lost_timeout_secs: u64,

    #[arg(long, env = "CLEANUP_INTERVAL_SECS", default_value_t = 300)]
    pub cleanup_interval_secs: u64,

    #[arg(long, env = "RETENTION_HOURS", default_value_t = 24)]
    pub retention_hours: u64,

    #[arg(long, env = "COMPLETED_LIMIT", default_value_t = 1000)]
    pub completed_limit: usize,

    /// Concurrent fragment downloads per poll
    #[arg(long, env = "FETCH_CONCURRENCY", default_value_t = 1)]
    pub fetch_concurrency: usize,

    /// Directory for downloaded clips (defaults to the system temp dir)
    #[arg(long, env = "DOWNLOAD_DIR")]
    pub download_dir: Option<PathBuf>,

    #[arg(long, env = "FFPROBE_PATH", default_value = "ffprobe")]
    pub ffprobe_path: PathBuf,

    /// Log filter, e.g. `info` or `motion_relay=debug` (RUST_LOG takes precedence)
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Also write daily-rotated log files to this directory
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Do not send startup and shutdown messages
    #[arg(long)]
    pub no_announcements: bool,
}

/// Connection settings for Surveillance Station.
#[derive(Debug, Clone)]
pub struct SurveillanceConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub otp_code: Option<String>,
    pub accept_invalid_certs: bool,
    /// Downloaded clips are written here.
    pub download_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_id: String,
}

/// Everything the ingestion engine needs.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub state_file: PathBuf,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub reconcile: ReconcileConfig,
    pub ffprobe_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Option<String>,
    pub format: LogFormat,
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub surveillance: SurveillanceConfig,
    pub telegram: TelegramConfig,
    pub ingest: IngestConfig,
    pub announcements: bool,
}

impl Args {
    /// Logging settings, available before the rest is validated.
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: self.log_format,
            dir: self.log_dir.clone(),
        }
    }

    /// Names of the required settings that are missing or blank.
    pub fn missing_required(&self) -> Vec<&'static str> {
        [
            ("SYNO_IP", &self.syno_ip),
            ("SYNO_USER", &self.syno_user),
            ("SYNO_PASS", &self.syno_pass),
            ("TG_TOKEN", &self.tg_token),
            ("TG_CHAT_ID", &self.tg_chat_id),
        ]
        .into_iter()
        .filter(|(_, value)| value.as_deref().is_none_or(|v| v.trim().is_empty()))
        .map(|(name, _)| name)
        .collect()
    }

    pub fn into_config(self) -> Result<AppConfig> {
        let missing = self.missing_required();
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }
        if self.fragment_duration_ms == 0 {
            return Err(Error::config("FRAGMENT_DURATION_MS must be greater than 0"));
        }
        if self.check_interval == 0 {
            return Err(Error::config("CHECK_INTERVAL must be greater than 0"));
        }
        if !(1..=MAX_FETCH_CONCURRENCY).contains(&self.fetch_concurrency) {
            return Err(Error::config(format!(
                "FETCH_CONCURRENCY must be between 1 and {MAX_FETCH_CONCURRENCY}"
            )));
        }
        if self.poll_limit == 0 {
            return Err(Error::config("POLL_LIMIT must be greater than 0"));
        }
        if self.camera_id.trim().is_empty() {
            return Err(Error::config("CAMERA_ID must not be empty"));
        }

        let announcements = !self.no_announcements;
        let host = required(self.syno_ip)?;
        let surveillance = SurveillanceConfig {
            base_url: format!("https://{}:{}", host.trim(), self.syno_port),
            username: required(self.syno_user)?,
            password: required(self.syno_pass)?,
            otp_code: self.syno_otp.filter(|otp| !otp.trim().is_empty()),
            accept_invalid_certs: self.syno_insecure_tls,
            download_dir: self.download_dir.unwrap_or_else(std::env::temp_dir),
        };
        let telegram = TelegramConfig {
            token: required(self.tg_token)?,
            chat_id: required(self.tg_chat_id)?,
        };

        let ingest = IngestConfig {
            state_file: self.state_file,
            store: StoreConfig {
                completed_limit: self.completed_limit,
                default_estimated_duration_ms: self.default_estimated_duration_ms,
            },
            scheduler: SchedulerConfig {
                fragment_duration: Duration::from_millis(self.fragment_duration_ms),
                default_estimated_duration_ms: self.default_estimated_duration_ms,
                max_consecutive_fails: self.max_consecutive_fails,
                max_fragments: self.video_max_fragments,
                ..Default::default()
            },
            reconcile: ReconcileConfig {
                channel_id: self.camera_id.trim().to_string(),
                poll_interval: Duration::from_secs(self.check_interval),
                lookback: Duration::from_secs(self.lookback_secs),
                poll_limit: self.poll_limit,
                lost_timeout: Duration::from_secs(self.lost_timeout_secs),
                cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
                retention: Duration::from_secs(self.retention_hours * 60 * 60),
                fetch_concurrency: self.fetch_concurrency,
                error_backoff: ReconcileConfig::default().error_backoff,
            },
            ffprobe_path: self.ffprobe_path,
        };

        Ok(AppConfig {
            surveillance,
            telegram,
            ingest,
            announcements,
        })
    }
}

fn required(value: Option<String>) -> Result<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::config("required setting is empty"))
}
