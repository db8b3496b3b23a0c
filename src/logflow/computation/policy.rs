//! Retry, failure and checkpoint policy for one computation.

use std::time::Duration;

/// Controls how a runner reacts to failures and when it checkpoints.
///
/// Defaults are the conservative ones: no retry, abort (block) on failure,
/// checkpoint after every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationPolicy {
    /// Additional delivery attempts after the first failure.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_delay: Duration,
    /// Cap on the doubled retry delay.
    pub max_retry_delay: Duration,
    /// On exhausted retries: skip the record instead of blocking.
    pub continue_on_failure: bool,
    /// Records processed between implicit checkpoints.
    pub batch_capacity: usize,
    /// Elapsed time after which a non-empty batch checkpoints anyway.
    pub batch_threshold: Duration,
}

impl Default for ComputationPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(10),
            continue_on_failure: false,
            batch_capacity: 1,
            batch_threshold: Duration::from_secs(1),
        }
    }
}

impl ComputationPolicy {
    pub fn builder() -> ComputationPolicyBuilder {
        ComputationPolicyBuilder::default()
    }

    /// Backoff before retry number `attempt` (1-based): `retry_delay`
    /// doubled per attempt, capped at `max_retry_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}

#[derive(Debug, Default)]
pub struct ComputationPolicyBuilder {
    policy: ComputationPolicy,
}

impl ComputationPolicyBuilder {
    pub fn retries(mut self, max_retries: u32) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.policy.retry_delay = delay;
        self
    }

    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.policy.max_retry_delay = delay;
        self
    }

    pub fn continue_on_failure(mut self, skip: bool) -> Self {
        self.policy.continue_on_failure = skip;
        self
    }

    pub fn batch_policy(mut self, capacity: usize, threshold: Duration) -> Self {
        self.policy.batch_capacity = capacity.max(1);
        self.policy.batch_threshold = threshold;
        self
    }

    pub fn build(self) -> ComputationPolicy {
        self.policy
    }
}
