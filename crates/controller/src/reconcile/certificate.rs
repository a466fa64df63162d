//! Certificate reconciler
//!
//! Drives one Certificate towards "the secret holds a valid, consistent
//! key and chain for the current spec, renewed before it expires":
//!
//! 1. the referenced issuer must be Ready
//! 2. the stored secret is inspected; unusable material counts as absent
//! 3. issuance happens when there is no valid certificate, the spec drifted
//!    from what was issued, or the renewal time has passed
//! 4. results are discarded when the certificate changed during the attempt

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use tessera_common::{ConditionStatus, ResourceKey};
use tessera_config::{Certificate, CertificateStatus, Issuer, PendingOrder};

use super::{Action, Context, ReconcileError, REASON_READY};
use crate::events::{
    EventType, ObjectRef, REASON_CERT_ISSUE_SUCCESS, REASON_ERR_ISSUE_CERT,
    REASON_WARN_CERTIFICATE_DURATION, REASON_WARN_SCHEDULE_MODIFIED,
};
use crate::issuer::{IssueError, IssueRequest, IssuedBundle, OrderJournal, RetryClass};
use crate::pki::{self, CertificateInfo, NameSet};
use crate::scheduler::{self, RenewalPolicy, Schedule, ScheduleWarning};
use crate::secrets::{
    Secret, ANNOTATION_COMMON_NAME, ANNOTATION_DNS_NAMES, ANNOTATION_DURATION,
    ANNOTATION_ISSUER_KIND, ANNOTATION_ISSUER_NAME, CA_CRT, TLS_CRT, TLS_KEY,
};
use crate::store::{ResourceStore, StoreError};

/// Extra time the reconciler grants an attempt past its own deadline
const ATTEMPT_GRACE: Duration = Duration::from_secs(1);

/// Records the in-progress ACME order in the certificate status
pub struct StatusOrderJournal {
    store: Arc<dyn ResourceStore>,
    key: ResourceKey,
    generation: u64,
}

impl StatusOrderJournal {
    pub fn new(store: Arc<dyn ResourceStore>, key: ResourceKey, generation: u64) -> Self {
        Self {
            store,
            key,
            generation,
        }
    }
}

#[async_trait]
impl OrderJournal for StatusOrderJournal {
    async fn load(&self) -> Option<PendingOrder> {
        match self.store.get_certificate(&self.key).await {
            Ok(Some(cert)) if cert.generation == self.generation => cert.status.pending_order,
            _ => None,
        }
    }

    async fn record(&self, order: Option<PendingOrder>) -> Result<(), IssueError> {
        let cert = self
            .store
            .get_certificate(&self.key)
            .await
            .map_err(|e| IssueError::BackendUnready(e.to_string()))?
            .ok_or_else(|| {
                IssueError::InvalidSpec(format!("certificate '{}' was deleted", self.key))
            })?;
        let status = cert.status.with_pending_order(order);
        self.store
            .update_certificate_status(&self.key, self.generation, status)
            .await
            .map_err(|e| IssueError::InvalidSpec(e.to_string()))
    }
}

/// What the secret currently holds
#[derive(Debug, Default)]
struct StoredMaterial {
    /// Parsable private key, reusable for the next issuance
    key_pem: Option<String>,
    /// Leaf of a chain consistent with `key_pem`
    leaf: Option<CertificateInfo>,
}

fn inspect_secret(secret: Option<&Secret>, cert: &ResourceKey) -> StoredMaterial {
    let Some(secret) = secret else {
        return StoredMaterial::default();
    };

    let key_pem = secret
        .get_str(TLS_KEY)
        .filter(|pem| pki::load_key(pem).is_ok())
        .map(str::to_string);
    let leaf = match (&key_pem, secret.get_str(TLS_CRT)) {
        (Some(key), Some(chain)) => match pki::parse_certificate_chain(chain) {
            Ok(info) => match pki::verify_key_matches(key, &info) {
                Ok(()) => Some(info),
                Err(e) => {
                    debug!(certificate = %cert, error = %e, "Stored key and certificate do not match");
                    None
                }
            },
            Err(e) => {
                debug!(certificate = %cert, error = %e, "Stored certificate is unusable");
                None
            }
        },
        _ => None,
    };
    StoredMaterial { key_pem, leaf }
}

/// Every requested name is covered by the leaf's SANs or CN
fn covers(names: &NameSet, leaf: &CertificateInfo) -> bool {
    let present: Vec<String> = leaf
        .dns_names
        .iter()
        .chain(leaf.common_name.iter())
        .map(|n| n.to_ascii_lowercase())
        .collect();
    names
        .names()
        .iter()
        .all(|n| present.contains(&n.to_ascii_lowercase()))
}

fn issued_annotations(cert: &Certificate, policy: &RenewalPolicy) -> [(&'static str, String); 5] {
    [
        (ANNOTATION_ISSUER_NAME, cert.spec.issuer_ref.name.clone()),
        (
            ANNOTATION_ISSUER_KIND,
            cert.spec.issuer_ref.kind.as_str().to_string(),
        ),
        (ANNOTATION_COMMON_NAME, cert.spec.common_name.clone()),
        (ANNOTATION_DNS_NAMES, cert.spec.dns_names.join(",")),
        (ANNOTATION_DURATION, policy.duration.as_secs().to_string()),
    ]
}

/// Why the stored certificate no longer matches the spec, if it does not
fn spec_drift(
    cert: &Certificate,
    names: &NameSet,
    policy: &RenewalPolicy,
    secret: &Secret,
    leaf: &CertificateInfo,
) -> Option<String> {
    for (annotation, expected) in issued_annotations(cert, policy) {
        match secret.annotation(annotation) {
            Some(found) if found == expected => {}
            Some(found) => {
                return Some(format!(
                    "{} changed from '{}' to '{}'",
                    annotation, found, expected
                ))
            }
            None => {}
        }
    }
    if !covers(names, leaf) {
        return Some(format!(
            "stored certificate does not cover {:?}",
            names.names()
        ));
    }
    None
}

fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

pub struct CertificateReconciler {
    ctx: Arc<Context>,
}

impl CertificateReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    fn event(&self, cert: &Certificate, event_type: EventType, reason: &str, message: &str) {
        self.ctx.recorder.record(
            ObjectRef::certificate(&cert.key),
            event_type,
            reason,
            message,
        );
    }

    /// Write status; a concurrent spec change or deletion is not an error
    async fn write_status(
        &self,
        cert: &Certificate,
        status: CertificateStatus,
    ) -> Result<bool, ReconcileError> {
        match self
            .ctx
            .store
            .update_certificate_status(&cert.key, cert.generation, status)
            .await
        {
            Ok(()) => Ok(true),
            Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound { .. }) => {
                debug!(certificate = %cert.key, "Certificate changed while reconciling");
                Ok(false)
            }
        }
    }

    /// Delay before retrying after the given failure
    fn failure_delay(&self, err: &IssueError, failed_attempts: u32) -> Duration {
        let config = &self.ctx.config;
        let backoff = config
            .failure_backoff
            .delay_for(failed_attempts.saturating_sub(1));
        match err.retry_class() {
            // Recheck occasionally in case a referenced secret or the
            // backend changed without a spec change
            RetryClass::Never => config.failure_backoff.max,
            RetryClass::IssuerNotReady => config.issuer_not_ready_requeue,
            RetryClass::Backoff => backoff,
            RetryClass::AcmeBackoff => backoff.max(config.acme_failure_floor),
            RetryClass::RateLimited(Some(after)) => after,
            RetryClass::RateLimited(None) => backoff.max(config.acme_failure_floor),
        }
    }

    pub async fn reconcile(&self, key: &ResourceKey) -> Result<Action, ReconcileError> {
        let Some(cert) = self.ctx.store.get_certificate(key).await? else {
            trace!(certificate = %key, "Certificate no longer exists");
            return Ok(Action::await_change());
        };

        let names = match NameSet::from_spec(&cert.spec.common_name, &cert.spec.dns_names) {
            Ok(names) => names,
            Err(e) => return self.fail(&cert, IssueError::from(e)).await,
        };

        let issuer_key = cert.issuer_key();
        let issuer = match self.ctx.store.get_issuer(&issuer_key).await? {
            Some(issuer) if issuer.is_ready() => issuer,
            found => {
                let message = match found {
                    Some(_) => format!("Issuer {} is not Ready", issuer_key),
                    None => format!("Issuer {} does not exist", issuer_key),
                };
                debug!(certificate = %key, issuer = %issuer_key, "Waiting for issuer");
                let status = cert.status.with_ready(
                    ConditionStatus::False,
                    "IssuerNotReady",
                    &message,
                    Utc::now(),
                );
                self.write_status(&cert, status).await?;
                return Ok(Action::requeue(self.ctx.config.issuer_not_ready_requeue));
            }
        };

        let policy = RenewalPolicy::resolve(&cert.spec, &issuer.spec, &self.ctx.config);
        let secret = self.ctx.secrets.get(&cert.secret_key()).await?;
        let stored = inspect_secret(secret.as_ref(), key);
        let now = Utc::now();

        let issue_reason = match (&stored.leaf, &secret) {
            (Some(leaf), Some(secret)) => {
                let schedule = self.schedule(leaf, policy);
                match spec_drift(&cert, &names, &policy, secret, leaf) {
                    Some(drift) => drift,
                    None if schedule.is_due(now) => format!(
                        "renewal was due at {}",
                        schedule.renew_at.to_rfc3339()
                    ),
                    None => return self.up_to_date(&cert, leaf, &schedule, now).await,
                }
            }
            _ => "no valid certificate in secret".to_string(),
        };
        info!(certificate = %key, reason = %issue_reason, "Issuing certificate");

        self.issue(&cert, &issuer, names, policy, stored.key_pem).await
    }

    fn schedule(&self, leaf: &CertificateInfo, policy: RenewalPolicy) -> Schedule {
        scheduler::next_check(
            leaf.not_before,
            leaf.not_after,
            policy,
            self.ctx.config.duration_tolerance,
        )
    }

    async fn up_to_date(
        &self,
        cert: &Certificate,
        leaf: &CertificateInfo,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<Action, ReconcileError> {
        let mut status = cert.status.with_ready(
            ConditionStatus::True,
            REASON_READY,
            "Certificate is up to date and has not expired",
            now,
        );
        status.not_after = Some(leaf.not_after);
        status.renewal_time = Some(schedule.renew_at);
        status.failed_attempts = 0;
        self.write_status(cert, status).await?;

        let after = until(schedule.renew_at, now);
        trace!(
            certificate = %cert.key,
            renew_at = %schedule.renew_at,
            "Certificate up to date"
        );
        Ok(Action::requeue(after))
    }

    async fn issue(
        &self,
        cert: &Certificate,
        issuer: &Issuer,
        names: NameSet,
        policy: RenewalPolicy,
        existing_key: Option<String>,
    ) -> Result<Action, ReconcileError> {
        let backend = match self.ctx.backends.backend_for(issuer) {
            Ok(backend) => backend,
            Err(e) => return self.fail(cert, e).await,
        };
        let key_pem = match existing_key {
            Some(key) => key,
            None => match pki::generate_key() {
                Ok(key) => key,
                Err(e) => return self.fail(cert, e.into()).await,
            },
        };

        let timeout = self.ctx.config.attempt_timeout;
        let request = IssueRequest {
            names: names.clone(),
            key_pem,
            duration: policy.duration,
            journal: Arc::new(StatusOrderJournal::new(
                Arc::clone(&self.ctx.store),
                cert.key.clone(),
                cert.generation,
            )),
            deadline: Instant::now() + timeout,
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(timeout + ATTEMPT_GRACE, backend.issue(&request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(IssueError::NetworkTransient(format!(
                "issuance attempt exceeded {}s",
                timeout.as_secs()
            ))),
        };
        debug!(
            certificate = %cert.key,
            backend = backend.kind(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Issuance attempt finished"
        );

        // The attempt is only valid for the spec it was started with
        let current = match self.ctx.store.get_certificate(&cert.key).await? {
            Some(current) if current.generation == cert.generation => current,
            Some(_) => {
                info!(certificate = %cert.key, "Certificate changed during issuance, discarding result");
                return Ok(Action::requeue(Duration::ZERO));
            }
            None => {
                info!(certificate = %cert.key, "Certificate deleted during issuance, discarding result");
                return Ok(Action::await_change());
            }
        };

        match result.and_then(|bundle| Self::check_bundle(&names, bundle)) {
            Ok((bundle, leaf)) => self.persist(&current, policy, bundle, leaf).await,
            Err(e) => self.fail(&current, e).await,
        }
    }

    /// The issued chain must cover the names and match the key
    fn check_bundle(
        names: &NameSet,
        bundle: IssuedBundle,
    ) -> Result<(IssuedBundle, CertificateInfo), IssueError> {
        let leaf = pki::parse_certificate_chain(&bundle.chain_pem)
            .map_err(|e| IssueError::MalformedResponse(format!("issued chain: {}", e)))?;
        pki::verify_key_matches(&bundle.key_pem, &leaf).map_err(|e| {
            IssueError::MalformedResponse(format!("issued certificate: {}", e))
        })?;
        if !covers(names, &leaf) {
            return Err(IssueError::MalformedResponse(format!(
                "issued certificate covers {:?}, requested {:?}",
                leaf.names(),
                names.names()
            )));
        }
        Ok((bundle, leaf))
    }

    async fn persist(
        &self,
        cert: &Certificate,
        policy: RenewalPolicy,
        bundle: IssuedBundle,
        leaf: CertificateInfo,
    ) -> Result<Action, ReconcileError> {
        let mut secret = Secret::new()
            .with_data(TLS_KEY, bundle.key_pem)
            .with_data(TLS_CRT, bundle.chain_pem);
        if let Some(ca) = bundle.ca_pem {
            secret = secret.with_data(CA_CRT, ca);
        }
        for (annotation, value) in issued_annotations(cert, &policy) {
            secret = secret.with_annotation(annotation, value);
        }
        if let Err(e) = self.ctx.secrets.put(&cert.secret_key(), secret).await {
            return self
                .fail(cert, IssueError::SecretWriteFailed(e.to_string()))
                .await;
        }

        let schedule = self.schedule(&leaf, policy);
        for warning in &schedule.warnings {
            let reason = match warning {
                ScheduleWarning::DurationCapped { .. } => REASON_WARN_CERTIFICATE_DURATION,
                ScheduleWarning::RenewBeforeClamped { .. } => REASON_WARN_SCHEDULE_MODIFIED,
            };
            warn!(certificate = %cert.key, warning = %warning.message(), "Certificate schedule adjusted");
            self.event(cert, EventType::Warning, reason, &warning.message());
        }

        let now = Utc::now();
        let status = cert.status.with_issued(
            REASON_READY,
            "Certificate is up to date and has not expired",
            leaf.not_after,
            schedule.renew_at,
            now,
        );
        self.write_status(cert, status).await?;

        let message = format!(
            "Certificate issued successfully, valid until {}",
            leaf.not_after.to_rfc3339()
        );
        info!(
            certificate = %cert.key,
            not_after = %leaf.not_after,
            renew_at = %schedule.renew_at,
            "Certificate issued"
        );
        self.event(cert, EventType::Normal, REASON_CERT_ISSUE_SUCCESS, &message);

        Ok(Action::requeue(until(schedule.renew_at, now)))
    }

    async fn fail(&self, cert: &Certificate, err: IssueError) -> Result<Action, ReconcileError> {
        let status = cert
            .status
            .with_failure(err.reason(), &err.to_string(), Utc::now());
        let delay = self.failure_delay(&err, status.failed_attempts);

        error!(
            certificate = %cert.key,
            reason = err.reason(),
            error = %err,
            attempts = status.failed_attempts,
            retry_in_ms = delay.as_millis() as u64,
            "Certificate issuance failed"
        );
        self.event(
            cert,
            EventType::Warning,
            REASON_ERR_ISSUE_CERT,
            &format!("Error issuing certificate: {}", err),
        );
        self.write_status(cert, status).await?;
        Ok(Action::requeue(delay))
    }
}
