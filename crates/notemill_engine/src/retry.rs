//! Retry policy: error classification plus exponential backoff.
//!
//! All retry decisions in the engine go through this one policy; nothing
//! else is allowed to loop on failure.

use notemill_protocol::ErrorKind;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Whether attempt `attempt` (1-based, the one that just failed) earns a
    /// successor.
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        kind.is_retriable() && attempt < self.max_attempts
    }

    /// Delay before re-enqueueing after failed attempt `attempt`:
    /// `min(base * 2^(attempt-1), cap)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let factor = 1u64 << exponent;
        let delay = self
            .base
            .checked_mul(factor as u32)
            .unwrap_or(Duration::MAX);
        delay.min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(60), 3)
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
        assert_eq!(policy.backoff(3), Duration::from_secs(20));
        assert_eq!(policy.backoff(4), Duration::from_secs(40));
        assert_eq!(policy.backoff(5), Duration::from_secs(60));
        assert_eq!(policy.backoff(12), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_never_retries() {
        let policy = policy();
        assert!(!policy.should_retry(ErrorKind::Parse, 1));
        assert!(policy.should_retry(ErrorKind::Timeout, 1));
        assert!(policy.should_retry(ErrorKind::Timeout, 2));
        assert!(!policy.should_retry(ErrorKind::Timeout, 3));
    }

    #[test]
    fn test_backoff_survives_large_attempts() {
        let policy = policy();
        assert_eq!(policy.backoff(64), Duration::from_secs(60));
    }
}
