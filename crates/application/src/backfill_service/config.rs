use std::time::Duration;

/// 2019-01-01T00:00:00Z, where an empty history starts downloading.
pub const DEFAULT_BACKFILL_START: i64 = 1_546_300_800;

/// Pacing and retry configuration for backfill jobs.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Timestamp a symbol without stored rows starts from.
    pub default_start: i64,
    /// Pause between two page requests.
    pub page_delay: Duration,
    /// Pause after a throttled page before retrying it.
    pub throttle_backoff: Duration,
    /// Retries allowed for one throttled page.
    pub max_throttle_retries: u32,
}

impl BackfillConfig {
    /// Creates a backfill configuration.
    #[must_use]
    pub fn new(
        default_start: i64,
        page_delay: Duration,
        throttle_backoff: Duration,
        max_throttle_retries: u32,
    ) -> Self {
        Self {
            default_start,
            page_delay,
            throttle_backoff,
            max_throttle_retries,
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self::new(
            DEFAULT_BACKFILL_START,
            Duration::from_secs(2),
            Duration::from_secs(5),
            5,
        )
    }
}
