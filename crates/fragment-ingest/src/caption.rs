//! Captions attached to delivered fragments.

use chrono::{DateTime, Local, TimeZone};

/// What a fragment caption describes.
#[derive(Debug, Clone)]
pub struct FragmentCaption<'a> {
    pub channel_name: &'a str,
    /// 1-based ordinal of the fragment within its recording.
    pub fragment_number: u32,
    /// Recording start in epoch seconds.
    pub recording_start: i64,
    pub offset_ms: u64,
    pub duration_secs: f64,
}

impl FragmentCaption<'_> {
    /// Wall-clock time of the first frame of this fragment.
    pub fn fragment_start(&self) -> Option<DateTime<Local>> {
        let millis = self.recording_start.checked_mul(1000)?;
        let millis = millis.checked_add(i64::try_from(self.offset_ms).ok()?)?;
        Local.timestamp_millis_opt(millis).single()
    }

    /// Render as Telegram HTML.
    pub fn render_html(&self) -> String {
        let channel = escape_html(self.channel_name);
        let number = self.fragment_number;

        let Some(start) = self.fragment_start() else {
            return format!(
                "\u{1f6a8} Motion detected\n\u{1f4f7} Camera: {channel}\nFragment: {number}"
            );
        };

        let offset_secs = self.offset_ms as f64 / 1000.0;
        let end_secs = offset_secs + self.duration_secs;

        format!(
            "<b>\u{1f6a8} Motion detected (fragment {number})</b>\n\n\
             <b>\u{1f4c5} Date:</b> {date}\n\
             <b>\u{1f550} Time:</b> {time}\n\
             <b>\u{1f4f7} Camera:</b> {channel}\n\
             <b>\u{23f1}\u{fe0f} Position:</b> {offset_secs:.1}-{end_secs:.1} s\n\
             <b>\u{1f4c1} Fragment:</b> {number}\n\
             <b>\u{1f3ac} Fragment length:</b> {duration:.1} s\n\n\
             <i>#surveillance #motion_detected</i>",
            date = start.format("%d.%m.%Y"),
            time = start.format("%H:%M:%S"),
            duration = self.duration_secs,
        )
    }
}

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caption_shifts_time_by_offset() {
        let caption = FragmentCaption {
            channel_name: "Porch",
            fragment_number: 2,
            recording_start: 1_700_000_000,
            offset_ms: 10_000,
            duration_secs: 9.6,
        };

        let expected = Local.timestamp_opt(1_700_000_010, 0).unwrap();
        assert_eq!(caption.fragment_start(), Some(expected));

        let html = caption.render_html();
        assert!(html.contains("fragment 2"));
        assert!(html.contains(&expected.format("%H:%M:%S").to_string()));
        assert!(html.contains(&expected.format("%d.%m.%Y").to_string()));
        assert!(html.contains("10.0-19.6 s"));
        assert!(html.contains("Fragment length:</b> 9.6 s"));
        assert!(html.ends_with("#surveillance #motion_detected</i>"));
    }

    #[test]
    fn test_caption_escapes_channel_name() {
        let caption = FragmentCaption {
            channel_name: "Gate <A&B>",
            fragment_number: 1,
            recording_start: 1_700_000_000,
            offset_ms: 0,
            duration_secs: 10.0,
        };
        assert!(caption.render_html().contains("Gate &lt;A&amp;B&gt;"));
    }

    #[test]
    fn test_caption_falls_back_on_unrepresentable_time() {
        let caption = FragmentCaption {
            channel_name: "Porch",
            fragment_number: 1,
            recording_start: i64::MAX,
            offset_ms: 0,
            duration_secs: 10.0,
        };
        let text = caption.render_html();
        assert!(text.starts_with("\u{1f6a8} Motion detected"));
        assert!(text.contains("Fragment: 1"));
    }
}
