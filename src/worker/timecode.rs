/// Formats a millisecond offset as `HH:MM:SS.mmm`. Hours are not wrapped.
pub fn format_timecode(ms: u64) -> String {
    let millis = ms % 1000;
    let total_secs = ms / 1000;
    let secs = total_secs % 60;
    let mins = (total_secs / 60) % 60;
    let hours = total_secs / 3600;
    format!("{hours:02}:{mins:02}:{secs:02}.{millis:03}")
}

/// Value for yt-dlp's `--download-sections`.
pub fn section_arg(start_ms: u64, end_ms: u64) -> String {
    format!("*{}-{}", format_timecode(start_ms), format_timecode(end_ms))
}
