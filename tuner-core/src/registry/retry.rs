//! Backoff policy for optimistic write conflicts

use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff between conflicting writes.
///
/// The first write is free; each conflict after it waits
/// `initial * 2^(n-1)` (capped at `max`) before reloading, until
/// `max_retries` conflicts have been absorbed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    /// Retry without waiting (tests and in-process stores).
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries, Duration::ZERO, Duration::ZERO)
    }

    /// Total number of writes attempted before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based), or `None` once the
    /// budget is spent.
    pub fn backoff(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        let delay = self
            .initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff);
        Some(delay.min(self.max_backoff))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            config.initial_backoff(),
            config.max_backoff(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_doubles_from_100ms() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (1..=5).map(|n| policy.backoff(n).unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1600),
            ]
        );
    }

    #[test]
    fn gives_up_after_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.backoff(6).is_none());
        assert_eq!(policy.max_attempts(), 6);
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy::new(40, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.backoff(4), Some(Duration::from_millis(800)));
        assert_eq!(policy.backoff(5), Some(Duration::from_secs(1)));
        assert_eq!(policy.backoff(40), Some(Duration::from_secs(1)));
    }

    #[test]
    fn immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.backoff(1), Some(Duration::ZERO));
        assert_eq!(policy.backoff(3), Some(Duration::ZERO));
        assert!(policy.backoff(4).is_none());
    }
}
