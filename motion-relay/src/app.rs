//! Wires the collaborators into the ingestion engine and runs it.

use std::sync::Arc;

use fragment_ingest::{
    Clock, FragmentScheduler, ProgressStore, Reconciler, StoreStats, SystemClock,
};
use tracing::{error, info, warn};

use crate::announce::{ShutdownInfo, StartupInfo, shutdown_message, startup_message};
use crate::config::AppConfig;
use crate::context::AppContext;
use crate::probe::FfprobeProbe;
use crate::surveillance::SurveillanceClient;
use crate::telegram::TelegramSink;
use crate::utils::http_client::build_client;
use crate::{Error, Result};

/// Run the relay until the context's shutdown token is cancelled.
///
/// Fails only when Telegram is unreachable at startup or local setup fails.
pub async fn run(config: AppConfig, ctx: AppContext) -> Result<()> {
    let AppConfig {
        surveillance: surveillance_config,
        telegram: telegram_config,
        ingest,
        announcements,
    } = config;

    let download_dir = surveillance_config.download_dir.clone();
    tokio::fs::create_dir_all(&download_dir)
        .await
        .map_err(|e| Error::io_path("creating download directory", &download_dir, e))?;

    let telegram = Arc::new(TelegramSink::new(build_client(false)?, telegram_config));
    let bot_name = telegram.connect().await?;

    let surveillance = Arc::new(SurveillanceClient::new(
        build_client(surveillance_config.accept_invalid_certs)?,
        surveillance_config,
    ));
    let camera_id = ingest.reconcile.channel_id.clone();
    let camera_name = surveillance.camera_name(&camera_id).await;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(ProgressStore::load(&ingest.state_file, ingest.store, clock.clone()).await);

    let check_interval = ingest.reconcile.poll_interval;
    let fragment_duration = ingest.scheduler.fragment_duration;
    let scheduler = FragmentScheduler::new(
        store.clone(),
        surveillance.clone(),
        Arc::new(FfprobeProbe::new(ingest.ffprobe_path)),
        telegram.clone(),
        clock.clone(),
        ingest.scheduler,
        camera_name.clone(),
    );
    let mut reconciler = Reconciler::new(surveillance, store.clone(), scheduler, clock, ingest.reconcile);

    info!(
        camera = %camera_name,
        camera_id = %camera_id,
        interval_secs = check_interval.as_secs(),
        fragment_secs = fragment_duration.as_secs_f64(),
        state_file = %store.path().display(),
        "Monitoring camera"
    );

    if announcements {
        let text = startup_message(&StartupInfo {
            bot_name: &bot_name,
            camera_name: &camera_name,
            camera_id: &camera_id,
            check_interval,
            fragment_duration,
            stats: store.stats().await,
        });
        announce(&telegram, "startup", &text).await;
    }

    ctx.spawn_signal_listener();
    reconciler.run(ctx.shutdown_token()).await;

    let uptime = ctx.uptime();
    let session_fragments = reconciler.session_fragments();
    let stats: StoreStats = store.stats().await;
    info!(
        uptime_secs = format!("{:.1}", uptime.as_secs_f64()),
        session_fragments,
        active = stats.active_recordings,
        completed = stats.completed_recordings,
        "Shutting down"
    );

    if announcements {
        let text = shutdown_message(&ShutdownInfo {
            bot_name: &bot_name,
            uptime,
            session_fragments,
            stats,
        });
        announce(&telegram, "shutdown", &text).await;
    }

    if let Err(e) = store.save().await {
        error!(error = %e, "Failed to save state on shutdown");
    }
    Ok(())
}

async fn announce(telegram: &TelegramSink, kind: &str, text: &str) {
    match telegram.send_message(text).await {
        Ok(()) => info!(kind, "Announcement sent"),
        Err(e) => warn!(kind, error = %e, "Failed to send announcement"),
    }
}
