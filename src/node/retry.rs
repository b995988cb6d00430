use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for a node's exec phase.
///
/// `max_retries` counts retries, not attempts: a node with `max_retries = 2`
/// runs exec at most three times. The delay is only ever applied between two
/// attempts, never before the first or after the last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = no retry)
    pub max_retries: usize,
    /// Delay before the first retry
    pub wait: Duration,
    /// Multiplier applied to the delay after each retry (1.0 = constant delay)
    pub backoff: f64,
    /// Upper bound for the delay once backoff is applied
    pub max_wait: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            wait: Duration::ZERO,
            backoff: 1.0,
            max_wait: None,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: usize, wait: Duration) -> Self {
        Self {
            max_retries,
            wait,
            ..Self::default()
        }
    }

    /// Set the backoff multiplier
    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }

    /// Cap the delay between attempts
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Total exec attempts allowed, always at least 1.
    pub fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait before starting `attempt` (2 for the first retry).
    pub fn delay_before(&self, attempt: usize) -> Duration {
        if attempt <= 1 || self.wait.is_zero() {
            return Duration::ZERO;
        }

        let factor = if self.backoff.is_finite() && self.backoff > 0.0 {
            self.backoff
        } else {
            1.0
        };
        let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
        let secs = self.wait.as_secs_f64() * factor.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);

        match self.max_wait {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_single_attempt() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts(), 1);
        assert_eq!(config.delay_before(2), Duration::ZERO);
    }

    #[test]
    fn test_constant_delay() {
        let config = RetryConfig::new(3, Duration::from_millis(100));
        assert_eq!(config.max_attempts(), 4);
        assert_eq!(config.delay_before(1), Duration::ZERO);
        assert_eq!(config.delay_before(2), Duration::from_millis(100));
        assert_eq!(config.delay_before(4), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_backoff_with_cap() {
        let config = RetryConfig::new(5, Duration::from_millis(100))
            .with_backoff(2.0)
            .with_max_wait(Duration::from_millis(300));

        assert_eq!(config.delay_before(2), Duration::from_millis(100));
        assert_eq!(config.delay_before(3), Duration::from_millis(200));
        assert_eq!(config.delay_before(4), Duration::from_millis(300));
        assert_eq!(config.delay_before(60), Duration::from_millis(300));
    }

    #[test]
    fn test_invalid_backoff_falls_back_to_constant() {
        let config = RetryConfig::new(2, Duration::from_millis(50)).with_backoff(f64::NAN);
        assert_eq!(config.delay_before(3), Duration::from_millis(50));
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: RetryConfig = serde_json::from_value(serde_json::json!({
            "max_retries": 2,
            "wait": { "secs": 1, "nanos": 0 }
        }))
        .unwrap();

        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.wait, Duration::from_secs(1));
        assert_eq!(config.backoff, 1.0);
    }
}
