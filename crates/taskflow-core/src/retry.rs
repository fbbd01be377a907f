//! Retry policy for tasks that fail with a transient error.
//!
//! Retries are delayed, not blocking: the scheduler records the backoff
//! deadline on the task as `next_attempt_at` and the task stays ineligible
//! for dispatch until it passes.
use crate::error::ActionError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Strategy for computing backoff durations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Delay = initial_backoff * attempt
    Linear,
    /// Delay = initial_backoff * 2^(attempt - 1)
    Exponential,
}

/// Policy controlling how often and how soon a task is re-dispatched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Initial backoff duration between retries.
    #[serde(with = "crate::config::duration_ms")]
    pub initial_backoff: Duration,
    /// Maximum backoff duration allowed.
    #[serde(with = "crate::config::duration_ms")]
    pub max_backoff: Duration,
    /// Strategy to compute backoff durations.
    pub strategy: BackoffStrategy,
    /// Optional fixed jitter to add to each backoff.
    #[serde(default, with = "crate::config::opt_duration_ms")]
    pub jitter: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::new(
            3,
            Duration::from_millis(500),
            Duration::from_secs(30),
            BackoffStrategy::Exponential,
        )
    }
}

impl RetryPolicy {
    /// Construct a new RetryPolicy.
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        strategy: BackoffStrategy,
    ) -> Self {
        RetryPolicy {
            max_attempts,
            initial_backoff,
            max_backoff,
            strategy,
            jitter: None,
        }
    }

    /// Specify a fixed jitter offset to add to each backoff.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Same policy with a different attempt limit, used for per-step overrides.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Whether a run that failed with `error` on `attempt` (1-based) gets another try.
    pub fn should_retry(&self, error: &ActionError, attempt: u32) -> bool {
        error.is_transient() && attempt < self.max_attempts
    }

    /// Compute the backoff duration before the next retry given the attempt count (1-based).
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = match self.strategy {
            BackoffStrategy::Linear => self.initial_backoff.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let exp = attempt.saturating_sub(1);
                let factor = if exp < 32 { 1_u32 << exp } else { u32::MAX };
                self.initial_backoff.saturating_mul(factor)
            }
        };
        let capped = base.min(self.max_backoff);
        match self.jitter {
            Some(j) => capped.saturating_add(j),
            None => capped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(100),
            Duration::from_millis(1000),
            BackoffStrategy::Linear,
        );
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(3), Duration::from_millis(300));
        assert_eq!(policy.backoff_duration(20), Duration::from_millis(1000));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::new(
            5,
            Duration::from_millis(50),
            Duration::from_millis(400),
            BackoffStrategy::Exponential,
        );
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(50));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_duration(4), Duration::from_millis(400));
        assert_eq!(policy.backoff_duration(40), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_addition() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(100),
            Duration::from_millis(1000),
            BackoffStrategy::Linear,
        )
        .with_jitter(Duration::from_millis(25));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(225));
    }

    #[test]
    fn test_only_transient_errors_retry() {
        let policy = RetryPolicy::default().with_max_attempts(3);
        let transient = ActionError::transient("throttled");
        let permanent = ActionError::permanent("bad region");
        assert!(policy.should_retry(&transient, 1));
        assert!(policy.should_retry(&transient, 2));
        assert!(!policy.should_retry(&transient, 3));
        assert!(!policy.should_retry(&permanent, 1));
    }

    #[test]
    fn test_policy_deserializes_from_millis() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts":4,"initial_backoff":10,"max_backoff":80,"strategy":"linear"}"#,
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.initial_backoff, Duration::from_millis(10));
        assert_eq!(policy.strategy, BackoffStrategy::Linear);
        assert_eq!(policy.jitter, None);
    }
}
