//! Exponential-backoff schedule for change-feed reconnection.

use std::time::Duration;

/// Default delay before the first reconnection attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default number of reconnection attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Tunable parameters for the reconnection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealtimeConfig {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Reconnection attempts allowed after a failure before the channel is
    /// declared failed. Reset by every successful subscription.
    pub max_attempts: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Delay before the reconnection attempt following `attempts` earlier ones:
/// `base_delay * 2^attempts`, saturating instead of overflowing.
pub fn backoff_delay(config: &RealtimeConfig, attempts: u32) -> Duration {
    let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
    config
        .base_delay
        .checked_mul(factor)
        .unwrap_or(Duration::MAX)
}
