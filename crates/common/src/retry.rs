//! Bounded exponential backoff with jitter.
//!
//! A [`RetryPolicy`] is a first-class parameter handed to every component
//! that polls or retries: ACME authorization/order polling, in-attempt
//! retries of transient network errors, and per-resource failure backoff.
//! No component sleeps on a hard-coded interval.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::trace;

/// Exponential backoff policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound on any single delay
    pub max: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Proportional random jitter added on top of the base delay (0.0 - 1.0)
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            ..Self::default()
        }
    }

    /// A policy that always waits `interval`
    pub fn constant(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Deterministic delay for the given zero-based attempt, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let secs = self.initial.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay for the given zero-based attempt, with jitter, capped at `max`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }

        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        let jittered = base.mul_f64(1.0 + extra).min(self.max);

        trace!(
            attempt = attempt,
            base_ms = base.as_millis() as u64,
            delay_ms = jittered.as_millis() as u64,
            "Computed backoff delay"
        );
        jittered.max(base)
    }

    /// Start a fresh backoff sequence
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Stateful iterator over a policy's delays
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Number of delays handed out so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_base_delay_grows_and_caps() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(2), Duration::from_secs(4));
        assert_eq!(policy.base_delay(3), Duration::from_secs(8));
        assert_eq!(policy.base_delay(4), Duration::from_secs(10));
        assert_eq!(policy.base_delay(1000), Duration::from_secs(10));
    }

    #[test]
    fn test_constant_policy() {
        let policy = RetryPolicy::constant(Duration::from_millis(250));
        let delays: Vec<_> = policy.backoff().take(3).collect();
        assert_eq!(delays, vec![Duration::from_millis(250); 3]);
    }

    #[test]
    fn test_backoff_counts_attempts() {
        let mut backoff = RetryPolicy::default().backoff();
        backoff.next();
        backoff.next();
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
    }

    proptest! {
        #[test]
        fn prop_jittered_delay_within_bounds(attempt in 0u32..200, jitter in 0.0f64..1.0) {
            let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(30))
                .with_jitter(jitter);
            let delay = policy.delay_for(attempt);
            prop_assert!(delay >= policy.base_delay(attempt));
            prop_assert!(delay <= policy.max);
        }
    }
}
