//! Startup and shutdown messages.

use std::time::Duration;

use fragment_ingest::StoreStats;
use fragment_ingest::caption::escape_html;

/// Facts reported when the relay starts.
#[derive(Debug, Clone)]
pub struct StartupInfo<'a> {
    pub bot_name: &'a str,
    pub camera_name: &'a str,
    pub camera_id: &'a str,
    pub check_interval: Duration,
    pub fragment_duration: Duration,
    pub stats: StoreStats,
}

/// Facts reported when the relay stops.
#[derive(Debug, Clone)]
pub struct ShutdownInfo<'a> {
    pub bot_name: &'a str,
    pub uptime: Duration,
    pub session_fragments: u64,
    pub stats: StoreStats,
}

pub fn startup_message(info: &StartupInfo<'_>) -> String {
    format!(
        "<b>\u{1f7e2} Relay started</b>\n\n\
         <b>\u{1f916} Bot:</b> {bot}\n\
         <b>\u{1f4f7} Camera:</b> {camera} (ID: {camera_id})\n\
         <b>\u{1f504} Check interval:</b> {interval} s\n\
         <b>\u{23f1}\u{fe0f} Fragment length:</b> {fragment:.1} s\n\
         <b>\u{1f4ca} Active recordings:</b> {active}\n\
         <b>\u{1f4c8} Completed recordings:</b> {completed}\n\
         <b>\u{1f4c1} Fragments sent:</b> {total}\n\n\
         <i>Clip lengths are measured with ffprobe</i>",
        bot = escape_html(info.bot_name),
        camera = escape_html(info.camera_name),
        camera_id = escape_html(info.camera_id),
        interval = info.check_interval.as_secs(),
        fragment = info.fragment_duration.as_secs_f64(),
        active = info.stats.active_recordings,
        completed = info.stats.completed_recordings,
        total = info.stats.total_fragments_sent,
    )
}

pub fn shutdown_message(info: &ShutdownInfo<'_>) -> String {
    format!(
        "<b>\u{1f534} Relay stopped</b>\n\n\
         <b>\u{1f916} Bot:</b> {bot}\n\
         <b>\u{23f1}\u{fe0f} Uptime:</b> {uptime:.1} s\n\
         <b>\u{1f4ca} Fragments sent this session:</b> {session}\n\
         <b>\u{1f4c8} Active recordings:</b> {active}\n\
         <b>\u{1f4ca} Completed recordings:</b> {completed}\n\n\
         <i>The relay has shut down.</i>",
        bot = escape_html(info.bot_name),
        uptime = info.uptime.as_secs_f64(),
        session = info.session_fragments,
        active = info.stats.active_recordings,
        completed = info.stats.completed_recordings,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> StoreStats {
        StoreStats {
            active_recordings: 2,
            completed_recordings: 40,
            total_fragments_sent: 117,
        }
    }

    #[test]
    fn test_startup_message() {
        let text = startup_message(&StartupInfo {
            bot_name: "Porch Bot",
            camera_name: "Front <door>",
            camera_id: "5",
            check_interval: Duration::from_secs(10),
            fragment_duration: Duration::from_millis(10_000),
            stats: stats(),
        });

        assert!(text.contains("Porch Bot"));
        assert!(text.contains("Front &lt;door&gt; (ID: 5)"));
        assert!(text.contains("Check interval:</b> 10 s"));
        assert!(text.contains("Fragment length:</b> 10.0 s"));
        assert!(text.contains("Completed recordings:</b> 40"));
        assert!(text.contains("Fragments sent:</b> 117"));
    }

    #[test]
    fn test_shutdown_message() {
        let text = shutdown_message(&ShutdownInfo {
            bot_name: "Porch Bot",
            uptime: Duration::from_millis(3_723_500),
            session_fragments: 9,
            stats: stats(),
        });

        assert!(text.contains("Uptime:</b> 3723.5 s"));
        assert!(text.contains("this session:</b> 9"));
        assert!(text.contains("Active recordings:</b> 2"));
    }
}
