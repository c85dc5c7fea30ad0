//! Orchestrator configuration loaded from environment variables.

use std::time::Duration;

/// Retry ceiling applied when a caller does not pick one.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

/// Per-attempt timeout applied by `add_step`.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Saga engine configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_DEFAULT_TIMEOUT_SECS` (default: `30`)
/// - `SAGA_DEFAULT_MAX_RETRIES` (default: `3`)
/// - `SAGA_RETRY_BACKOFF_MS`: first forward-retry delay, doubled per attempt (default: `0`)
/// - `SAGA_RETRY_BACKOFF_MAX_MS` (default: `5000`)
/// - `SAGA_COMPENSATION_MAX_RETRIES` (default: `0`, compensation runs exactly once)
/// - `SAGA_REVIEW_QUEUE_CAPACITY` (default: `1024`)
/// - `SAGA_RECOVERY_INTERVAL_SECS` (default: `60`)
/// - `SAGA_RECOVERY_BATCH_SIZE` (default: `100`)
/// - `SAGA_DEAD_LETTER_AFTER_HOURS` (default: `72`)
#[derive(Debug, Clone)]
pub struct SagaConfig {
    pub default_timeout: Duration,
    pub default_max_retries: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
    pub compensation_max_retries: u32,
    pub review_queue_capacity: usize,
    pub recovery_interval: Duration,
    pub recovery_batch_size: usize,
    pub dead_letter_after: Duration,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SagaConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_timeout: Duration::from_secs(env_or(
                "SAGA_DEFAULT_TIMEOUT_SECS",
                defaults.default_timeout.as_secs(),
            )),
            default_max_retries: env_or("SAGA_DEFAULT_MAX_RETRIES", defaults.default_max_retries),
            retry_backoff: Duration::from_millis(env_or(
                "SAGA_RETRY_BACKOFF_MS",
                defaults.retry_backoff.as_millis() as u64,
            )),
            retry_backoff_max: Duration::from_millis(env_or(
                "SAGA_RETRY_BACKOFF_MAX_MS",
                defaults.retry_backoff_max.as_millis() as u64,
            )),
            compensation_max_retries: env_or(
                "SAGA_COMPENSATION_MAX_RETRIES",
                defaults.compensation_max_retries,
            ),
            review_queue_capacity: env_or(
                "SAGA_REVIEW_QUEUE_CAPACITY",
                defaults.review_queue_capacity,
            ),
            recovery_interval: Duration::from_secs(env_or(
                "SAGA_RECOVERY_INTERVAL_SECS",
                defaults.recovery_interval.as_secs(),
            )),
            recovery_batch_size: env_or("SAGA_RECOVERY_BATCH_SIZE", defaults.recovery_batch_size),
            dead_letter_after: Duration::from_secs(
                env_or(
                    "SAGA_DEAD_LETTER_AFTER_HOURS",
                    defaults.dead_letter_after.as_secs() / 3600,
                ) * 3600,
            ),
        }
    }

    /// Delay before forward attempt number `attempt` (1-based).
    ///
    /// The first attempt never waits; later ones back off exponentially from
    /// `retry_backoff`, capped at `retry_backoff_max`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.retry_backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.retry_backoff_max)
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_STEP_TIMEOUT,
            default_max_retries: DEFAULT_MAX_RETRY_COUNT,
            retry_backoff: Duration::ZERO,
            retry_backoff_max: Duration::from_secs(5),
            compensation_max_retries: 0,
            review_queue_capacity: 1024,
            recovery_interval: Duration::from_secs(60),
            recovery_batch_size: 100,
            dead_letter_after: Duration::from_secs(72 * 3600),
        }
    }
}
