//! Renewal scheduling
//!
//! Computes when an issued certificate must be re-issued. Everything here
//! is a pure function of its inputs; the certificate reconciler turns the
//! returned warnings into events and the renewal time into a requeue.

use std::time::Duration;

use chrono::{DateTime, Utc};

use tessera_config::{CertificateSpec, ControllerConfig, IssuerSpec};

const MIN_RENEW_BEFORE: Duration = Duration::from_secs(1);

/// Requested duration and renew-before after applying defaults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    pub duration: Duration,
    pub renew_before: Duration,
}

impl RenewalPolicy {
    /// Certificate values win over issuer values, which win over the
    /// controller defaults. A zero value counts as unset.
    pub fn resolve(cert: &CertificateSpec, issuer: &IssuerSpec, config: &ControllerConfig) -> Self {
        let pick = |own: Option<Duration>, inherited: Option<Duration>, default: Duration| {
            own.filter(|d| !d.is_zero())
                .or(inherited.filter(|d| !d.is_zero()))
                .unwrap_or(default)
        };
        Self {
            duration: pick(cert.duration, issuer.duration, config.default_duration),
            renew_before: pick(
                cert.renew_before,
                issuer.renew_before,
                config.default_renew_before,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleWarning {
    /// The backend issued a shorter certificate than requested
    DurationCapped {
        requested: Duration,
        observed: Duration,
    },
    /// renew-before was not shorter than the effective duration
    RenewBeforeClamped {
        configured: Duration,
        effective: Duration,
    },
}

impl ScheduleWarning {
    pub fn message(&self) -> String {
        match self {
            ScheduleWarning::DurationCapped { requested, observed } => format!(
                "requested certificate duration {} is longer than the {} the issuer granted; using the issued duration",
                tessera_config::format_duration(*requested),
                tessera_config::format_duration(*observed),
            ),
            ScheduleWarning::RenewBeforeClamped {
                configured,
                effective,
            } => format!(
                "renew-before {} is not shorter than the certificate duration; renewing {} before expiry instead",
                tessera_config::format_duration(*configured),
                tessera_config::format_duration(*effective),
            ),
        }
    }
}

/// Result of scheduling one issued certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub effective_duration: Duration,
    pub effective_renew_before: Duration,
    /// When re-issuance is due; always before `not_after`
    pub renew_at: DateTime<Utc>,
    pub warnings: Vec<ScheduleWarning>,
}

impl Schedule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.renew_at
    }
}

/// Compute the renewal time of a certificate valid from `not_before` to
/// `not_after`.
///
/// A certificate counts as honouring the requested duration when it is
/// at most `tolerance` shorter than requested.
pub fn next_check(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    policy: RenewalPolicy,
    tolerance: Duration,
) -> Schedule {
    let mut warnings = Vec::new();
    let observed = (not_after - not_before).to_std().unwrap_or(Duration::ZERO);

    let effective_duration = if observed.saturating_add(tolerance) >= policy.duration {
        policy.duration
    } else {
        warnings.push(ScheduleWarning::DurationCapped {
            requested: policy.duration,
            observed,
        });
        observed
    };

    let effective_renew_before = if policy.renew_before >= effective_duration {
        let clamped = (effective_duration / 3).max(MIN_RENEW_BEFORE);
        warnings.push(ScheduleWarning::RenewBeforeClamped {
            configured: policy.renew_before,
            effective: clamped,
        });
        clamped
    } else {
        policy.renew_before.max(MIN_RENEW_BEFORE)
    };

    let renew_before = chrono::Duration::from_std(effective_renew_before)
        .unwrap_or_else(|_| chrono::Duration::seconds(1));
    let renew_at = not_after
        .checked_sub_signed(renew_before)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    Schedule {
        effective_duration,
        effective_renew_before,
        renew_at,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tessera_common::{IssuerKind, IssuerRef};
    use tessera_config::IssuerBackendConfig;

    const DAY: Duration = Duration::from_secs(86400);
    const HOUR: Duration = Duration::from_secs(3600);

    fn days(n: u64) -> Duration {
        DAY * n as u32
    }

    fn policy(duration: Duration, renew_before: Duration) -> RenewalPolicy {
        RenewalPolicy {
            duration,
            renew_before,
        }
    }

    fn issued_for(validity: chrono::Duration) -> (DateTime<Utc>, DateTime<Utc>) {
        let not_before = Utc::now();
        (not_before, not_before + validity)
    }

    #[test]
    fn test_honoured_duration_has_no_warnings() {
        let (nb, na) = issued_for(chrono::Duration::days(90));
        let schedule = next_check(nb, na, policy(days(90), days(30)), HOUR);
        assert!(schedule.warnings.is_empty());
        assert_eq!(schedule.effective_duration, days(90));
        assert_eq!(schedule.renew_at, na - chrono::Duration::days(30));
    }

    #[test]
    fn test_small_shortfall_within_tolerance() {
        let (nb, na) = issued_for(chrono::Duration::days(90) - chrono::Duration::minutes(5));
        let schedule = next_check(nb, na, policy(days(90), days(30)), HOUR);
        assert!(schedule.warnings.is_empty());
    }

    #[test]
    fn test_capped_duration_warns() {
        // 365d requested, backend caps at 90d
        let (nb, na) = issued_for(chrono::Duration::days(90));
        let schedule = next_check(nb, na, policy(days(365), days(30)), HOUR);
        assert_eq!(schedule.effective_duration, days(90));
        assert_eq!(
            schedule.warnings,
            vec![ScheduleWarning::DurationCapped {
                requested: days(365),
                observed: days(90)
            }]
        );
        assert_eq!(schedule.renew_at, na - chrono::Duration::days(30));
    }

    #[test]
    fn test_renew_before_longer_than_capped_duration() {
        // 240d requested with 120d renew-before, backend caps at 90d
        let (nb, na) = issued_for(chrono::Duration::days(90));
        let schedule = next_check(nb, na, policy(days(240), days(120)), HOUR);

        assert_eq!(schedule.effective_duration, days(90));
        assert_eq!(schedule.effective_renew_before, days(30));
        assert_eq!(schedule.warnings.len(), 2);
        assert!(matches!(
            schedule.warnings[1],
            ScheduleWarning::RenewBeforeClamped { .. }
        ));
        assert_eq!(schedule.renew_at, na - chrono::Duration::days(30));
    }

    #[test]
    fn test_renew_before_equal_to_duration_is_clamped() {
        let (nb, na) = issued_for(chrono::Duration::days(30));
        let schedule = next_check(nb, na, policy(days(30), days(30)), HOUR);
        assert_eq!(schedule.effective_renew_before, days(10));
        assert!(schedule.warnings[0].message().contains("renew-before"));
    }

    #[test]
    fn test_is_due() {
        let (nb, na) = issued_for(chrono::Duration::days(90));
        let schedule = next_check(nb, na, policy(days(90), days(30)), HOUR);
        assert!(!schedule.is_due(nb));
        assert!(schedule.is_due(na - chrono::Duration::days(29)));
    }

    #[test]
    fn test_policy_precedence() {
        let config = ControllerConfig::default();
        let mut issuer = IssuerSpec::new(IssuerBackendConfig::SelfSigned);
        let mut cert = CertificateSpec {
            common_name: "a.example.com".to_string(),
            dns_names: vec![],
            secret_name: "web-tls".to_string(),
            issuer_ref: IssuerRef::new("selfsigned", IssuerKind::Issuer),
            duration: None,
            renew_before: Some(Duration::ZERO),
        };

        let resolved = RenewalPolicy::resolve(&cert, &issuer, &config);
        assert_eq!(resolved, policy(days(90), days(30)));

        issuer.duration = Some(days(60));
        issuer.renew_before = Some(days(20));
        let resolved = RenewalPolicy::resolve(&cert, &issuer, &config);
        assert_eq!(resolved, policy(days(60), days(20)));

        cert.duration = Some(days(365));
        cert.renew_before = Some(days(7));
        let resolved = RenewalPolicy::resolve(&cert, &issuer, &config);
        assert_eq!(resolved, policy(days(365), days(7)));
    }

    proptest! {
        #[test]
        fn prop_renewal_strictly_before_expiry(
            validity_secs in 0i64..(800 * 86400),
            requested_secs in 1u64..(800 * 86400),
            renew_before_secs in 0u64..(800 * 86400),
        ) {
            let (nb, na) = issued_for(chrono::Duration::seconds(validity_secs));
            let schedule = next_check(
                nb,
                na,
                policy(Duration::from_secs(requested_secs), Duration::from_secs(renew_before_secs)),
                HOUR,
            );
            prop_assert!(schedule.renew_at < na);
            prop_assert!(schedule.effective_renew_before >= MIN_RENEW_BEFORE);
            if Duration::from_secs(renew_before_secs) >= schedule.effective_duration {
                let is_clamped = schedule
                    .warnings
                    .iter()
                    .any(|w| matches!(w, ScheduleWarning::RenewBeforeClamped { .. }));
                prop_assert!(is_clamped);
            }
        }
    }
}
