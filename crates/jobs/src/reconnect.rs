//! Bounded reconnection policy for job status push channels.
//!
//! A push channel that closes before its job reaches a terminal status is
//! reopened after a fixed delay. Connections that close without delivering
//! a single update count as failures; once `max_attempts` consecutive
//! failures have been seen, the tracking session falls back to polling.

use std::time::Duration;

/// Tunable parameters for push channel reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed connections tolerated before polling takes over.
    pub max_attempts: u32,
    /// Fixed delay before each reconnect.
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl ReconnectPolicy {
    /// Whether the channel should be reopened after `failures` consecutive
    /// failed connections.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    /// A policy that goes straight to polling on the first failure.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reopens_until_third_failure() {
        let policy = ReconnectPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn default_delay_is_two_seconds() {
        assert_eq!(ReconnectPolicy::default().delay, Duration::from_secs(2));
    }

    #[test]
    fn disabled_never_retries() {
        let policy = ReconnectPolicy::disabled();
        assert!(!policy.should_retry(0));
        assert!(!policy.should_retry(1));
    }
}
