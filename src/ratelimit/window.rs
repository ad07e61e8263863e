//! Sliding-window log primitives shared by every store.

use std::time::Duration;

use crate::error::{RatewardenError, Result};

/// Widest accepted window, kept exact as a Lua double in the distributed store.
pub const MAX_WINDOW_MS: u64 = (1 << 53) - 1;

/// Immutable settings for one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Maximum admissions within any trailing window
    limit: u32,
    /// Width of the trailing window
    window: Duration,
    /// Window width in milliseconds, bounded by `MAX_WINDOW_MS`
    window_ms: u64,
}

impl LimiterConfig {
    /// Create a limiter configuration.
    ///
    /// Both the limit and the window must be non-zero, and the window may
    /// not exceed `MAX_WINDOW_MS`.
    pub fn new(limit: u32, window: Duration) -> Result<Self> {
        if limit == 0 {
            return Err(RatewardenError::Config(
                "limit must be at least 1".to_string(),
            ));
        }
        let window_ms = match u64::try_from(window.as_millis()) {
            Ok(0) => {
                return Err(RatewardenError::Config(
                    "window must be at least 1 ms".to_string(),
                ))
            }
            Ok(ms) if ms <= MAX_WINDOW_MS => ms,
            _ => {
                return Err(RatewardenError::Config(format!(
                    "window must be at most {} ms",
                    MAX_WINDOW_MS
                )))
            }
        };
        Ok(Self {
            limit,
            window,
            window_ms,
        })
    }

    /// Get the limit.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Get the window width.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Get the window width in milliseconds.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Timestamps at or before this instant no longer count at `now_ms`.
    pub fn cutoff(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.window_ms())
    }
}

/// What a store saw and did for one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether `now` was appended to the record
    pub admitted: bool,
    /// Entries counted in the window after the hit
    pub count: u32,
    /// The earliest entry still inside the window, if any
    pub oldest_ms: Option<u64>,
}

impl WindowOutcome {
    /// Apply the sliding-window log rule to an already pruned count.
    ///
    /// `count` is the number of entries strictly younger than the cutoff.
    pub fn evaluate(count: u32, oldest_ms: Option<u64>, now_ms: u64, limit: u32) -> Self {
        if count >= limit {
            Self {
                admitted: false,
                count,
                oldest_ms,
            }
        } else {
            Self {
                admitted: true,
                count: count + 1,
                oldest_ms: oldest_ms.or(Some(now_ms)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_rejects_zero_limit() {
        assert!(LimiterConfig::new(0, Duration::from_secs(60)).is_err());
    }

    #[test]
    fn test_config_rejects_sub_millisecond_window() {
        assert!(LimiterConfig::new(5, Duration::from_micros(10)).is_err());
    }

    #[test]
    fn test_config_rejects_window_overflow() {
        // 2^62 seconds wraps to zero milliseconds when truncated to u64.
        assert!(LimiterConfig::new(1, Duration::from_secs(1 << 62)).is_err());
        assert!(LimiterConfig::new(1, Duration::from_millis(MAX_WINDOW_MS + 1)).is_err());

        let widest = LimiterConfig::new(1, Duration::from_millis(MAX_WINDOW_MS)).unwrap();
        assert_eq!(widest.window_ms(), MAX_WINDOW_MS);
    }

    #[test]
    fn test_cutoff_saturates() {
        let config = LimiterConfig::new(5, Duration::from_secs(60)).unwrap();
        assert_eq!(config.window_ms(), 60_000);
        assert_eq!(config.cutoff(100_000), 40_000);
        assert_eq!(config.cutoff(10), 0);
    }

    #[test]
    fn test_evaluate_admits_below_limit() {
        let outcome = WindowOutcome::evaluate(2, Some(500), 1_000, 3);
        assert!(outcome.admitted);
        assert_eq!(outcome.count, 3);
        assert_eq!(outcome.oldest_ms, Some(500));
    }

    #[test]
    fn test_evaluate_empty_record_uses_now_as_oldest() {
        let outcome = WindowOutcome::evaluate(0, None, 1_000, 3);
        assert!(outcome.admitted);
        assert_eq!(outcome.oldest_ms, Some(1_000));
    }

    #[test]
    fn test_evaluate_denies_at_limit() {
        let outcome = WindowOutcome::evaluate(3, Some(500), 1_000, 3);
        assert!(!outcome.admitted);
        assert_eq!(outcome.count, 3);
    }
}
