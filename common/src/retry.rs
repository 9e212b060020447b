//! Exponential backoff with jitter for transient failures

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy: exponential growth with full jitter and a decorrelated cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// First delay, milliseconds
    pub base_delay_ms: u64,
    /// Ceiling for any single delay, milliseconds
    pub max_delay_ms: u64,
    /// Attempts before giving up; 0 disables retries
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (0-based), with full jitter
    ///
    /// The exponential envelope is `base * 2^attempt`, capped; the actual
    /// delay is drawn uniformly from `[0, envelope]` so synchronized
    /// clients spread out.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let envelope = self.envelope_ms(attempt);
        let jittered = rand::thread_rng().gen_range(0..=envelope);
        Duration::from_millis(jittered)
    }

    /// Upper bound for retry `attempt` without jitter
    #[must_use]
    pub fn envelope_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.min(20);
        self.base_delay_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_delay_ms)
    }

    /// True when another retry is allowed after `attempt` failures
    #[must_use]
    pub const fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Stateful backoff tracker for reconnect loops
///
/// Unlike [`RetryPolicy::delay`], the sequence does not reset between
/// calls; `reset` is invoked on success.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Create a tracker over a policy
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Next delay in the sequence
    pub fn next_delay(&mut self) -> Duration {
        let d = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        d
    }

    /// Number of consecutive failures observed
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Clear the failure streak after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
