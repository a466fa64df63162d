//! Controller-wide configuration.
//!
//! Every tunable the engine uses lives here and is passed to components
//! at construction time; there are no process-global defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_common::RetryPolicy;

/// Certificate duration used when neither certificate nor issuer sets one
pub const DEFAULT_CERTIFICATE_DURATION: Duration = Duration::from_secs(90 * 24 * 3600);

/// Renew-before used when neither certificate nor issuer sets one
pub const DEFAULT_RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 3600);

/// Immutable controller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Workers per resource kind
    pub workers: usize,
    /// Hard deadline for one issuance attempt
    pub attempt_timeout: Duration,
    /// Requeue delay while a referenced issuer is not ready
    pub issuer_not_ready_requeue: Duration,
    /// Backoff between failed issuance attempts of one certificate
    pub failure_backoff: RetryPolicy,
    /// Minimum delay after ACME challenge or finalize failures
    pub acme_failure_floor: Duration,
    /// Poll cadence for ACME authorization and order state
    pub acme_poll: RetryPolicy,
    /// Backoff for transient network errors inside one attempt
    pub transient_retry: RetryPolicy,
    /// Backoff between failed issuer setups
    pub issuer_backoff: RetryPolicy,
    /// Periodic re-validation of ready issuers
    pub issuer_resync: Duration,
    pub default_duration: Duration,
    pub default_renew_before: Duration,
    /// Observed durations this much shorter than requested count as capped
    pub duration_tolerance: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            attempt_timeout: Duration::from_secs(5 * 60),
            issuer_not_ready_requeue: Duration::from_secs(10),
            failure_backoff: RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(3600))
                .with_jitter(0.2),
            acme_failure_floor: Duration::from_secs(5 * 60),
            acme_poll: RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(10))
                .with_multiplier(1.5)
                .with_jitter(0.1),
            transient_retry: RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(15)),
            issuer_backoff: RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(600)),
            issuer_resync: Duration::from_secs(3600),
            default_duration: DEFAULT_CERTIFICATE_DURATION,
            default_renew_before: DEFAULT_RENEW_BEFORE,
            duration_tolerance: Duration::from_secs(3600),
        }
    }
}

fn default_workers() -> usize {
    4
}

impl ControllerConfig {
    /// Configuration with short timings, for tests
    pub fn fast() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(5),
            issuer_not_ready_requeue: Duration::from_millis(50),
            failure_backoff: RetryPolicy::new(Duration::from_millis(50), Duration::from_secs(1)),
            acme_failure_floor: Duration::from_millis(100),
            acme_poll: RetryPolicy::constant(Duration::from_millis(10)),
            transient_retry: RetryPolicy::constant(Duration::from_millis(10)),
            issuer_backoff: RetryPolicy::new(Duration::from_millis(50), Duration::from_secs(1)),
            issuer_resync: Duration::from_secs(60),
            ..Self::default()
        }
    }
}
