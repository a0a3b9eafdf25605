//! Telegram Bot API delivery.
//!
//! Clips go out through `sendVideo` as multipart uploads streamed from disk,
//! text through `sendMessage`. HTTP 429 responses are retried after the
//! `parameters.retry_after` delay the API returns.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use fragment_ingest::{DeliverySink, LocalClip};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::config::TelegramConfig;
use crate::retry::{RetryConfig, with_retry};
use crate::{Error, Result};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Largest upload the Bot API accepts.
pub const MAX_VIDEO_BYTES: u64 = 50 * 1024 * 1024;

/// Maximum number of retries for rate-limited requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Telegram `sendMessage` text limit (UTF-8 characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Media caption limit (UTF-8 characters).
const TELEGRAM_CAPTION_LIMIT: usize = 1024;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct BotResponse<T> {
    #[serde(default)]
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    first_name: String,
}

enum Payload<'a> {
    Json(serde_json::Value),
    Video { path: &'a Path, caption: &'a str },
}

/// Delivers clips and announcements to one chat.
pub struct TelegramSink {
    client: reqwest::Client,
    config: TelegramConfig,
    api_base: String,
    retry: RetryConfig,
}

impl TelegramSink {
    pub fn new(client: reqwest::Client, config: TelegramConfig) -> Self {
        Self {
            client,
            config,
            api_base: DEFAULT_API_BASE.to_string(),
            retry: RetryConfig::default(),
        }
    }

    /// Point at a different Bot API server.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.config.token)
    }

    /// Verify the token with `getMe` and return the bot's name.
    pub async fn connect(&self) -> Result<String> {
        let name = with_retry(&self.retry, "telegram getMe", || async {
            let response: BotResponse<BotUser> = self
                .client
                .get(self.method_url("getMe"))
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            match response.result {
                Some(user) if response.ok => Ok(user.first_name),
                _ => Err(Error::Telegram(
                    response
                        .description
                        .unwrap_or_else(|| "getMe returned no bot".to_string()),
                )),
            }
        })
        .await?;

        info!(bot = %name, "Connected to Telegram");
        Ok(name)
    }

    /// Send an HTML text message.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        let payload = json!({
            "chat_id": self.config.chat_id,
            "text": truncate_message(text, TELEGRAM_MESSAGE_LIMIT),
            "parse_mode": "HTML",
        });
        with_retry(&self.retry, "telegram sendMessage", || {
            self.send_with_rate_limit("sendMessage", Payload::Json(payload.clone()))
        })
        .await
    }

    /// Upload a video file with an HTML caption.
    pub async fn send_video(&self, path: &Path, size_bytes: u64, caption: &str) -> Result<()> {
        if size_bytes > MAX_VIDEO_BYTES {
            return Err(Error::FileTooLarge {
                size: size_bytes,
                limit: MAX_VIDEO_BYTES,
            });
        }
        let caption = truncate_message(caption, TELEGRAM_CAPTION_LIMIT);
        info!(
            size_mb = format!("{:.1}", size_bytes as f64 / (1024.0 * 1024.0)),
            "Uploading video to Telegram"
        );
        with_retry(&self.retry, "telegram sendVideo", || {
            self.send_with_rate_limit(
                "sendVideo",
                Payload::Video {
                    path,
                    caption: &caption,
                },
            )
        })
        .await
    }

    async fn video_form(&self, path: &Path, caption: &str) -> Result<Form> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::io_path("opening", path, e))?;
        let length = file
            .metadata()
            .await
            .map_err(|e| Error::io_path("reading metadata of", path, e))?
            .len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "clip.mp4".to_string());

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, length)
            .file_name(file_name)
            .mime_str("video/mp4")?;

        Ok(Form::new()
            .text("chat_id", self.config.chat_id.clone())
            .text("caption", caption.to_string())
            .text("supports_streaming", "true")
            .text("parse_mode", "HTML")
            .part("video", part))
    }

    /// Send request with rate limit handling.
    async fn send_with_rate_limit(&self, method: &str, payload: Payload<'_>) -> Result<()> {
        let url = self.method_url(method);
        let mut attempts = 0;

        loop {
            attempts += 1;

            let request = match &payload {
                Payload::Json(body) => self.client.post(&url).json(body).timeout(REQUEST_TIMEOUT),
                Payload::Video { path, caption } => self
                    .client
                    .post(&url)
                    .multipart(self.video_form(path, caption).await?)
                    .timeout(UPLOAD_TIMEOUT),
            };
            let response = request.send().await?;
            let status = response.status();

            if status.is_success() {
                let body: BotResponse<serde_json::Value> = response.json().await?;
                if body.ok {
                    return Ok(());
                }
                return Err(Error::Telegram(
                    body.description
                        .unwrap_or_else(|| format!("{method} returned ok=false")),
                ));
            }

            if status.as_u16() == 429 {
                let body: serde_json::Value = response.json().await.unwrap_or_default();

                let retry_after = body
                    .get("parameters")
                    .and_then(|p| p.get("retry_after"))
                    .and_then(|v| v.as_u64())
                    .map(Duration::from_secs);

                if attempts >= MAX_RATE_LIMIT_RETRIES {
                    warn!(
                        method,
                        retry_after = ?retry_after,
                        "Telegram rate limit: max retries ({}) exceeded",
                        MAX_RATE_LIMIT_RETRIES
                    );
                    return Err(Error::Telegram(format!(
                        "{method} rate limited after {MAX_RATE_LIMIT_RETRIES} attempts"
                    )));
                }

                let wait_duration = retry_after.unwrap_or(Duration::from_secs(1));
                debug!(
                    method,
                    "Telegram rate limited (429), waiting {:?} before retry (attempt {}/{})",
                    wait_duration,
                    attempts,
                    MAX_RATE_LIMIT_RETRIES
                );
                tokio::time::sleep(wait_duration).await;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(Error::Telegram(format!("{method} failed: {status} - {body}")));
        }
    }
}

#[async_trait]
impl DeliverySink for TelegramSink {
    async fn deliver(&self, clip: &LocalClip, caption: &str) -> bool {
        if clip.size_bytes() > MAX_VIDEO_BYTES {
            warn!(
                path = %clip.path().display(),
                size = clip.size_bytes(),
                limit = MAX_VIDEO_BYTES,
                "Clip too large for Telegram, skipping upload"
            );
            return false;
        }
        match self.send_video(clip.path(), clip.size_bytes(), caption).await {
            Ok(()) => {
                info!(path = %clip.path().display(), "Video delivered to Telegram");
                true
            }
            Err(e) => {
                error!(path = %clip.path().display(), error = %e, "Video delivery failed");
                false
            }
        }
    }
}

/// Truncate a message to fit within a Telegram character limit.
fn truncate_message(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let suffix = "\n\n[truncated]";
    let budget = limit - suffix.len();
    let truncated: String = text.chars().take(budget).collect();
    format!("{truncated}{suffix}")
}
