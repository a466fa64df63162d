//! Controller block KDL parsing.

use anyhow::Result;
use tessera_common::RetryPolicy;
use tracing::trace;

use crate::controller::ControllerConfig;

use super::helpers::{get_duration_entry, get_int_entry};

/// Parse the `controller { ... }` block; unset fields keep their defaults
pub fn parse_controller_config(node: &kdl::KdlNode) -> Result<ControllerConfig> {
    trace!("Parsing controller configuration block");

    let defaults = ControllerConfig::default();
    let mut config = defaults.clone();

    if let Some(workers) = get_int_entry(node, "workers") {
        if workers < 1 {
            return Err(anyhow::anyhow!(
                "'workers' must be at least 1, got {}",
                workers
            ));
        }
        config.workers = workers as usize;
    }
    if let Some(d) = get_duration_entry(node, "attempt-timeout")? {
        config.attempt_timeout = d;
    }
    if let Some(d) = get_duration_entry(node, "issuer-not-ready-requeue")? {
        config.issuer_not_ready_requeue = d;
    }
    if let Some(max) = get_duration_entry(node, "max-failure-backoff")? {
        config.failure_backoff = RetryPolicy {
            max: max.max(defaults.failure_backoff.initial),
            ..defaults.failure_backoff
        };
    }
    if let Some(d) = get_duration_entry(node, "acme-poll-interval")? {
        config.acme_poll = RetryPolicy {
            initial: d,
            max: defaults.acme_poll.max.max(d),
            ..defaults.acme_poll
        };
    }
    if let Some(d) = get_duration_entry(node, "issuer-resync")? {
        config.issuer_resync = d;
    }
    if let Some(d) = get_duration_entry(node, "default-duration")? {
        config.default_duration = d;
    }
    if let Some(d) = get_duration_entry(node, "default-renew-before")? {
        config.default_renew_before = d;
    }

    trace!(
        workers = config.workers,
        attempt_timeout_secs = config.attempt_timeout.as_secs(),
        "Parsed controller configuration"
    );

    Ok(config)
}
