use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy)]
struct WarnThrottleState {
    last: Instant,
    suppressed: u64,
}

fn shorten(value: &str, head: usize, tail: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= head + tail {
        return value.to_string();
    }
    let head: String = chars[..head].iter().collect();
    let tail: String = chars[chars.len() - tail..].iter().collect();
    format!("{head}..{tail}")
}

/// Drops the query string and shortens long URLs so video links don't flood log lines.
pub fn redact_url(url: &str) -> String {
    let base = url.split(['?', '#']).next().unwrap_or(url);
    shorten(base, 40, 12)
}

/// Keeps the last `max` characters of tool output for error messages.
pub fn tail_chars(value: &str, max: usize) -> String {
    let trimmed = value.trim();
    let count = trimmed.chars().count();
    if count <= max {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - max).collect()
}

pub fn warn_throttled(key: &str, interval: Duration) -> bool {
    let Some(suppressed) = warn_throttled_with_count(key, interval) else {
        return false;
    };
    if suppressed > 0 {
        tracing::warn!(
            event = "throttled_warning_summary",
            key,
            suppressed,
            "throttled warnings were suppressed"
        );
    }
    true
}

/// Returns `Some(suppressed_since_last)` when the caller may log, `None` while throttled.
pub fn warn_throttled_with_count(key: &str, interval: Duration) -> Option<u64> {
    static LAST_WARN: OnceLock<Mutex<HashMap<String, WarnThrottleState>>> = OnceLock::new();
    let map = LAST_WARN.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = match map.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("warn throttle lock poisoned; continuing with recovered state");
            poisoned.into_inner()
        }
    };
    let now = Instant::now();
    if let Some(state) = guard.get_mut(key) {
        if now.saturating_duration_since(state.last) < interval {
            state.suppressed = state.suppressed.saturating_add(1);
            return None;
        }
        let suppressed = state.suppressed;
        state.last = now;
        state.suppressed = 0;
        return Some(suppressed);
    }
    guard.insert(
        key.to_string(),
        WarnThrottleState {
            last: now,
            suppressed: 0,
        },
    );
    Some(0)
}
