//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Surveillance Station error codes that mean the session must be renewed.
const SESSION_ERROR_CODES: [i64; 4] = [105, 106, 107, 119];

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{api} returned error code {code}")]
    Api { api: &'static str, code: i64 },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Telegram error: {0}")]
    Telegram(String),

    #[error("File too large: {size} bytes exceeds {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Process error: {0}")]
    Process(#[from] process_utils::ProcessError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Ingest(#[from] fragment_ingest::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// True when the Surveillance Station session has expired or is invalid.
    pub fn is_session_error(&self) -> bool {
        matches!(self, Self::Api { code, .. } if SESSION_ERROR_CODES.contains(code))
    }

    /// True for failures worth retrying: network errors, server-side HTTP
    /// errors, and expired sessions (which are renewed on the next attempt).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.status().is_none_or(|s| s.is_server_error() || s.as_u16() == 429),
            Self::Api { .. } => self.is_session_error(),
            _ => false,
        }
    }
}
