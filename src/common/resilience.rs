//! Retry and backoff configuration
//!
//! Shared by the slot worker (reconnect backoff), the push delivery loop
//! (sink retry backoff), and the supervisor (restart backoff).

use std::time::Duration;

/// Configuration for retry behavior.
///
/// # Example
///
/// ```rust
/// use riffle::common::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::builder()
///     .max_retries(10)
///     .base_delay(Duration::from_secs(1))
///     .max_delay(Duration::from_secs(60))
///     .jitter(0.25)
///     .build();
///
/// assert!(config.should_retry(9));
/// assert!(!config.should_retry(10));
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retry attempts.
    /// - `-1` = retry forever
    /// - `0` = retries disabled
    /// - `n` = retry up to n times
    max_retries: i32,
    /// Base delay before exponential backoff.
    base_delay: Duration,
    /// Cap on the computed delay.
    max_delay: Duration,
    /// Jitter factor (0.0 - 1.0) applied to the computed delay.
    jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Create a builder.
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    /// Retry forever. The right default for long-lived replication
    /// connections.
    pub fn infinite() -> Self {
        Self {
            max_retries: -1,
            ..Default::default()
        }
    }

    /// No retries.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Maximum retries (-1 = infinite, 0 = disabled).
    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    /// Check if infinite retries are configured.
    pub fn is_infinite(&self) -> bool {
        self.max_retries == -1
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_retries {
            -1 => true,
            0 => false,
            n => attempt < n as u32,
        }
    }

    /// Delay before retry number `attempt` (0-indexed), with exponential
    /// backoff capped at `max_delay` and deterministic jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(30);
        let base = self.base_delay.saturating_mul(2u32.saturating_pow(exp));
        let capped = base.min(self.max_delay);

        if self.jitter > 0.0 {
            // Deterministic jitter keyed on the attempt number, so retry
            // timing is reproducible in tests.
            let jitter_range = capped.as_secs_f64() * self.jitter;
            let phase = (attempt as f64 * 0.618033988749895) % 1.0;
            let offset = jitter_range * (phase * 2.0 - 1.0);
            Duration::from_secs_f64((capped.as_secs_f64() + offset).max(0.0))
        } else {
            capped
        }
    }
}

/// Builder for [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    max_retries: Option<i32>,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter: Option<f64>,
}

impl RetryConfigBuilder {
    /// Set maximum retry attempts.
    pub fn max_retries(mut self, value: i32) -> Self {
        self.max_retries = Some(value);
        self
    }

    /// Set base delay.
    pub fn base_delay(mut self, value: Duration) -> Self {
        self.base_delay = Some(value);
        self
    }

    /// Set maximum delay cap.
    pub fn max_delay(mut self, value: Duration) -> Self {
        self.max_delay = Some(value);
        self
    }

    /// Set jitter factor (clamped to 0.0 - 1.0).
    pub fn jitter(mut self, value: f64) -> Self {
        self.jitter = Some(value.clamp(0.0, 1.0));
        self
    }

    /// Build the config.
    pub fn build(self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_bounds() {
        let config = RetryConfig::builder().max_retries(3).build();
        assert!(config.should_retry(0));
        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));

        assert!(RetryConfig::infinite().should_retry(1_000_000));
        assert!(!RetryConfig::disabled().should_retry(0));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig::builder()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(5))
            .jitter(0.0)
            .build();

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
        // capped
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(5));
        // no overflow at large attempt counts
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::builder()
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(60))
            .jitter(0.5)
            .build();

        for attempt in 0..10 {
            let nominal = Duration::from_secs(1).saturating_mul(2u32.pow(attempt)).min(Duration::from_secs(60));
            let actual = config.delay_for_attempt(attempt);
            let band = nominal.as_secs_f64() * 0.5;
            assert!(actual.as_secs_f64() >= nominal.as_secs_f64() - band - f64::EPSILON);
            assert!(actual.as_secs_f64() <= nominal.as_secs_f64() + band + f64::EPSILON);
        }
    }
}
