//! Shared utility functions used across multiple modules.

use std::sync::atomic::{AtomicI64, Ordering};

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Current Unix timestamp in milliseconds.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Millisecond clock that never hands out the same value twice.
///
/// Wall-clock readings that go backwards or repeat are bumped to one past the
/// previous value.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub const fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }

    /// Next timestamp, strictly greater than every previous one.
    pub fn now_millis(&self) -> i64 {
        self.next_after(unix_millis_now())
    }

    /// Next timestamp that is also at least `floor`.
    pub fn next_after(&self, floor: i64) -> i64 {
        let mut previous = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = floor.max(previous.saturating_add(1));
            match self.last.compare_exchange_weak(
                previous,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => previous = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
    }

    #[test]
    fn normalize_text_option_trims_value() {
        assert_eq!(
            normalize_text_option(Some(" https://example.com ".to_string())),
            Some("https://example.com".to_string())
        );
    }

    #[test]
    fn is_http_url_accepts_valid_schemes() {
        assert!(is_http_url("http://localhost"));
        assert!(is_http_url("https://example.com"));
        assert!(!is_http_url("ftp://example.com"));
        assert!(!is_http_url("example.com"));
    }

    #[test]
    fn monotonic_clock_is_strictly_increasing() {
        let clock = MonotonicClock::new();
        let mut previous = 0;
        for _ in 0..1_000 {
            let next = clock.now_millis();
            assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn monotonic_clock_respects_floor() {
        let clock = MonotonicClock::new();
        let far_future = unix_millis_now() + 60_000;
        assert_eq!(clock.next_after(far_future), far_future);
        assert_eq!(clock.next_after(5), far_future + 1);
    }
}
