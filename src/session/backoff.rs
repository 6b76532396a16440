use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry settings shared by disconnect recovery and setup failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound (exclusive) of the random jitter added to every delay
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            jitter_ms: 1_000,
        }
    }
}

/// Exponential backoff with a hard ceiling and additive jitter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            jitter_ms: jitter.as_millis() as u64,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter_ms: config.jitter_ms,
        }
    }

    /// Deterministic part of the delay: `min(max, base * 2^attempt)`
    pub fn floor(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Delay before retry number `attempt`, jitter included
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..self.jitter_ms)
        };
        self.floor(attempt) + Duration::from_millis(jitter)
    }

    /// Largest value `delay` can ever return
    pub fn ceiling(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.saturating_add(self.jitter_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_doubles_until_ceiling() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.floor(0), Duration::from_millis(2_000));
        assert_eq!(policy.floor(1), Duration::from_millis(4_000));
        assert_eq!(policy.floor(2), Duration::from_millis(8_000));
        assert_eq!(policy.floor(4), Duration::from_millis(32_000));
        assert_eq!(policy.floor(5), Duration::from_millis(60_000));
        assert_eq!(policy.floor(6), Duration::from_millis(60_000));
    }

    #[test]
    fn test_floor_is_non_decreasing() {
        let policy = BackoffPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let floor = policy.floor(attempt);
            assert!(floor >= previous, "floor decreased at attempt {}", attempt);
            previous = floor;
        }
    }

    #[test]
    fn test_delay_bounds() {
        let policy = BackoffPolicy::default();
        let base = Duration::from_millis(2_000);

        for attempt in [0, 1, 3, 10, 64, u32::MAX] {
            for _ in 0..50 {
                let delay = policy.delay(attempt);
                assert!(delay >= base);
                assert!(delay >= policy.floor(attempt));
                assert!(delay < policy.floor(attempt) + Duration::from_millis(1_000));
                assert!(delay <= policy.ceiling());
            }
        }
    }

    #[test]
    fn test_huge_attempts_do_not_overflow() {
        let policy = BackoffPolicy::new(
            Duration::from_millis(u64::MAX / 2),
            Duration::from_millis(u64::MAX / 2),
            Duration::ZERO,
        );
        assert_eq!(
            policy.delay(u32::MAX),
            Duration::from_millis(u64::MAX / 2)
        );
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let config = RetryConfig {
            jitter_ms: 0,
            ..Default::default()
        };
        let policy = BackoffPolicy::from_config(&config);
        assert_eq!(policy.delay(1), policy.floor(1));
        assert_eq!(policy.delay(1), policy.delay(1));
    }
}
