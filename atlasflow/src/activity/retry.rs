//! Retry policies with configurable backoff and jitter.
//!
//! Only transient failures are retried, and only within the attempt budget.
//! The runner owns the loop; this module owns the arithmetic.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    #[default]
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Retry policy for one activity invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::Full,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A single-attempt policy for deterministic local work.
    #[must_use]
    pub fn single_attempt() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub const fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub const fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub const fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }
}

impl From<&crate::config::StagePolicy> for RetryPolicy {
    fn from(policy: &crate::config::StagePolicy) -> Self {
        Self::new()
            .with_max_attempts(policy.max_attempts)
            .with_base_delay_ms(policy.backoff_base_ms)
            .with_max_delay_ms(policy.backoff_max_ms)
    }
}

/// Attempt tracking for one invocation.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempt: u32,
    prev_delay: Option<u64>,
}

impl RetryState {
    /// Creates a fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that an attempt ran. Returns true while budget remains for
    /// another one.
    pub fn record_attempt(&mut self, policy: &RetryPolicy) -> bool {
        self.attempt += 1;
        self.attempt < policy.max_attempts
    }

    /// Delay before the next attempt, derived from how many have run.
    #[must_use]
    pub fn backoff_delay(&mut self, policy: &RetryPolicy) -> Duration {
        let base = policy.base_delay_ms;
        let max = policy.max_delay_ms;
        // First retry backs off from exponent zero.
        let exponent = self.attempt.saturating_sub(1);

        let delay = match policy.backoff {
            BackoffStrategy::Exponential => {
                base.saturating_mul(2u64.saturating_pow(exponent)).min(max)
            }
            BackoffStrategy::Linear => {
                base.saturating_mul(u64::from(exponent) + 1).min(max)
            }
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match policy.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.prev_delay.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let next = if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.prev_delay = Some(next);
                next
            }
        };

        Duration::from_millis(jittered)
    }
}
