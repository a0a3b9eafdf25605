//! Process-wide context shared by the relay's tasks.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{Error, Result};

/// Shutdown token and session start time.
#[derive(Debug, Clone)]
pub struct AppContext {
    shutdown: CancellationToken,
    started_at: Instant,
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AppContext {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    #[cfg(test)]
    fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Cancel the shutdown token on Ctrl+C or SIGTERM.
    pub fn spawn_signal_listener(&self) {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = wait_for_signal() => match result {
                    Ok(()) => info!("Shutdown signal received"),
                    Err(e) => {
                        // Keep running; the process can still be killed.
                        warn!(error = %e, "Signal handler unavailable");
                        return;
                    }
                },
                _ = token.cancelled() => return,
            }
            token.cancel();
        });
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).map_err(Error::Io)?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map_err(Error::Io)?,
            _ = term.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map_err(Error::Io)?;
        Ok(())
    }
}
