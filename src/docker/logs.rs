//! Decoder for the multiplexed log stream returned by `/containers/{name}/logs`.
//!
//! Non-TTY containers interleave stdout and stderr as frames:
//! `[stream type: u8][reserved: 3 bytes][payload length: u32 BE][payload]`.

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdin,
    Stdout,
    Stderr,
}

impl LogStream {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame<'a> {
    pub stream: LogStream,
    pub payload: &'a [u8],
}

/// Splits `raw` into complete frames. A truncated trailing frame is dropped.
pub fn decode_frames(raw: &[u8]) -> Vec<LogFrame<'_>> {
    let mut frames = Vec::new();
    let mut rest = raw;
    while rest.len() >= FRAME_HEADER_LEN {
        let Some(stream) = LogStream::from_byte(rest[0]) else {
            break;
        };
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let Some(payload) = rest.get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + len) else {
            break;
        };
        frames.push(LogFrame { stream, payload });
        rest = &rest[FRAME_HEADER_LEN + len..];
    }
    frames
}

fn looks_multiplexed(raw: &[u8]) -> bool {
    raw.len() >= FRAME_HEADER_LEN
        && LogStream::from_byte(raw[0]).is_some()
        && raw[1..4] == [0, 0, 0]
}

/// Turns a raw log response into text lines; a frame payload may carry several.
///
/// TTY containers are not multiplexed; their output is split on newlines instead.
pub fn demux_log_frames(raw: &[u8]) -> Vec<String> {
    if raw.is_empty() {
        return Vec::new();
    }
    if !looks_multiplexed(raw) {
        return String::from_utf8_lossy(raw)
            .lines()
            .map(str::to_string)
            .collect();
    }

    decode_frames(raw)
        .into_iter()
        .flat_map(|frame| {
            String::from_utf8_lossy(frame.payload)
                .lines()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn joins_payloads_of_concatenated_frames() {
        let mut raw = frame(1, b"2024-01-01T00:00:00Z starting openvpn");
        raw.extend(frame(2, b"warning: dns"));
        raw.extend(frame(1, b"connected"));

        let lines = demux_log_frames(&raw);
        assert_eq!(
            lines.join("\n"),
            "2024-01-01T00:00:00Z starting openvpn\nwarning: dns\nconnected"
        );
    }

    #[test]
    fn strips_single_trailing_newline_per_frame() {
        let mut raw = frame(1, b"one\n");
        raw.extend(frame(1, b"two\r\n"));
        assert_eq!(demux_log_frames(&raw), vec!["one", "two"]);
    }

    #[test]
    fn multi_line_payload_yields_one_entry_per_line() {
        let mut raw = frame(1, b"first\nsecond\r\nthird\n");
        raw.extend(frame(2, b"stderr line"));
        assert_eq!(
            demux_log_frames(&raw),
            vec!["first", "second", "third", "stderr line"]
        );
    }

    #[test]
    fn truncated_trailing_frame_is_dropped() {
        let mut raw = frame(1, b"complete");
        let mut partial = frame(2, b"this payload is cut short");
        partial.truncate(FRAME_HEADER_LEN + 4);
        raw.extend(partial);

        assert_eq!(demux_log_frames(&raw), vec!["complete"]);
    }

    #[test]
    fn truncated_header_is_dropped() {
        let mut raw = frame(1, b"ok");
        raw.extend_from_slice(&[1, 0, 0]);
        assert_eq!(demux_log_frames(&raw), vec!["ok"]);
    }

    #[test]
    fn frames_keep_stream_type() {
        let mut raw = frame(1, b"out");
        raw.extend(frame(2, b"err"));
        let frames = decode_frames(&raw);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].stream, LogStream::Stdout);
        assert_eq!(frames[1].stream, LogStream::Stderr);
        assert_eq!(frames[1].payload, b"err");
    }

    #[test]
    fn tty_output_falls_back_to_lines() {
        let raw = b"plain line one\nplain line two\n";
        assert_eq!(
            demux_log_frames(raw),
            vec!["plain line one", "plain line two"]
        );
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(demux_log_frames(&[]).is_empty());
    }
}
