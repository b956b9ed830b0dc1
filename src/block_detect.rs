/// Phrases the download tool (or the source behind it) uses when it refuses us rather than
/// failing for some other reason. Matched case-insensitively.
pub const BLOCK_PHRASES: &[&str] = &[
    "sign in to confirm",
    "not a bot",
    "http error 403",
    "http error 429",
    "too many requests",
    "blocked",
    "forbidden",
    "rate-limited",
    "rate limited",
];

pub fn is_block_message(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    BLOCK_PHRASES.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_bot_checks_and_rate_limits() {
        assert!(is_block_message(
            "ERROR: [youtube] abc: Sign in to confirm you're not a bot"
        ));
        assert!(is_block_message("ERROR: unable to download: HTTP Error 429: Too Many Requests"));
        assert!(is_block_message("Request BLOCKED by upstream"));
    }

    #[test]
    fn ordinary_failures_are_not_blocks() {
        assert!(!is_block_message("ERROR: Video unavailable"));
        assert!(!is_block_message("ffmpeg exited with code 1"));
    }
}
