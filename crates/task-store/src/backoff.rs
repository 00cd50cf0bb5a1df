//! Exponential backoff policy for retrying failed remote operations.

use std::time::Duration;

/// Configuration for retry behavior.
///
/// Retries continue while the operation remains queued; there is no
/// attempt cap. The repository's `sync_failed` flag is governed
/// separately by the engine's failure threshold.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

/// Calculates the delay before retry number `attempt` (1-based).
pub fn retry_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let delay_secs = config.base_delay.as_secs_f64()
        * config
            .backoff_factor
            .powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}
