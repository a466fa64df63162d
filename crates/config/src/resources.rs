//! Declarative resource types: Issuer and Certificate.
//!
//! Each resource carries a user-declared `spec` and a controller-owned
//! `status`. Status values are updated functionally: every `with_*`
//! method returns a new status and leaves `self` untouched.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tessera_common::{
    ready_status, with_condition, Condition, ConditionStatus, IssuerRef, ResourceKey,
};

// ============================================================================
// Issuer
// ============================================================================

/// An issuing backend declaration with its observed status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issuer {
    pub key: ResourceKey,
    /// Incremented on every spec change, never on status updates
    #[serde(default)]
    pub generation: u64,
    pub spec: IssuerSpec,
    #[serde(default)]
    pub status: IssuerStatus,
}

impl Issuer {
    pub fn new(key: ResourceKey, spec: IssuerSpec) -> Self {
        Self {
            key,
            generation: 1,
            spec,
            status: IssuerStatus::default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        ready_status(&self.status.conditions) == ConditionStatus::True
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuerSpec {
    pub backend: IssuerBackendConfig,
    /// Default certificate duration for certificates using this issuer
    #[serde(default)]
    pub duration: Option<Duration>,
    /// Default renew-before for certificates using this issuer
    #[serde(default)]
    pub renew_before: Option<Duration>,
}

impl IssuerSpec {
    pub fn new(backend: IssuerBackendConfig) -> Self {
        Self {
            backend,
            duration: None,
            renew_before: None,
        }
    }
}

/// Backend selector plus backend-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssuerBackendConfig {
    Acme(AcmeIssuerConfig),
    Ca(CaIssuerConfig),
    SelfSigned,
    Vault(VaultIssuerConfig),
}

impl IssuerBackendConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            IssuerBackendConfig::Acme(_) => "acme",
            IssuerBackendConfig::Ca(_) => "ca",
            IssuerBackendConfig::SelfSigned => "self-signed",
            IssuerBackendConfig::Vault(_) => "vault",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcmeIssuerConfig {
    /// ACME directory URL
    pub server: String,
    /// Contact email used for account registration
    pub email: String,
    /// Secret holding the serialized account credentials
    pub private_key_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaIssuerConfig {
    /// Secret holding the CA certificate (`tls.crt`) and key (`tls.key`)
    pub secret_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultIssuerConfig {
    /// Server address, e.g. `https://vault.example.com:8200`
    pub server: String,
    /// Signing path below `/v1`, e.g. `pki/sign/example-dot-com`
    pub path: String,
    pub auth: VaultAuth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultAuth {
    /// Static token read from the `token` key of a secret
    Token { secret_name: String },
    /// Role-id/secret-id exchange; ids are read from `roleId`/`secretId`
    AppRole {
        secret_name: String,
        /// Auth mount path, `approle` unless configured
        #[serde(default = "default_approle_path")]
        path: String,
    },
}

pub fn default_approle_path() -> String {
    "approle".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssuerStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Registered ACME account URI
    #[serde(default)]
    pub acme_account_uri: Option<String>,
}

impl IssuerStatus {
    pub fn with_ready(
        &self,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            conditions: with_condition(
                &self.conditions,
                Condition::ready(status, reason, message, now),
            ),
            ..self.clone()
        }
    }

    pub fn with_acme_account_uri(&self, uri: Option<String>) -> Self {
        Self {
            acme_account_uri: uri,
            ..self.clone()
        }
    }
}

// ============================================================================
// Certificate
// ============================================================================

/// A desired certificate with its observed status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub key: ResourceKey,
    #[serde(default)]
    pub generation: u64,
    pub spec: CertificateSpec,
    #[serde(default)]
    pub status: CertificateStatus,
}

impl Certificate {
    pub fn new(key: ResourceKey, spec: CertificateSpec) -> Self {
        Self {
            key,
            generation: 1,
            spec,
            status: CertificateStatus::default(),
        }
    }

    /// Key of the output secret
    pub fn secret_key(&self) -> ResourceKey {
        self.key.sibling(self.spec.secret_name.clone())
    }

    /// Key of the referenced issuer
    pub fn issuer_key(&self) -> ResourceKey {
        self.spec.issuer_ref.resolve(self.key.namespace())
    }

    pub fn is_ready(&self) -> bool {
        ready_status(&self.status.conditions) == ConditionStatus::True
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSpec {
    #[serde(default)]
    pub common_name: String,
    /// Ordered, unique DNS names
    #[serde(default)]
    pub dns_names: Vec<String>,
    pub secret_name: String,
    pub issuer_ref: IssuerRef,
    #[serde(default)]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub renew_before: Option<Duration>,
}

/// An in-progress ACME order recorded between attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub url: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CertificateStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// notAfter of the currently stored certificate
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
    /// When re-issuance is due
    #[serde(default)]
    pub renewal_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Consecutive failed attempts since the last success
    #[serde(default)]
    pub failed_attempts: u32,
    #[serde(default)]
    pub pending_order: Option<PendingOrder>,
}

impl CertificateStatus {
    pub fn with_ready(
        &self,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            conditions: with_condition(
                &self.conditions,
                Condition::ready(status, reason, message, now),
            ),
            ..self.clone()
        }
    }

    /// Record a failed issuance attempt
    pub fn with_failure(&self, reason: &str, message: &str, now: DateTime<Utc>) -> Self {
        let mut next = self.with_ready(ConditionStatus::False, reason, message, now);
        next.last_failure_time = Some(now);
        next.failed_attempts = self.failed_attempts.saturating_add(1);
        next
    }

    /// Record a successful issuance
    pub fn with_issued(
        &self,
        reason: &str,
        message: &str,
        not_after: DateTime<Utc>,
        renewal_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut next = self.with_ready(ConditionStatus::True, reason, message, now);
        next.not_after = Some(not_after);
        next.renewal_time = Some(renewal_time);
        next.failed_attempts = 0;
        next.pending_order = None;
        next
    }

    pub fn with_pending_order(&self, order: Option<PendingOrder>) -> Self {
        Self {
            pending_order: order,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::IssuerKind;

    fn test_certificate() -> Certificate {
        Certificate::new(
            ResourceKey::new("default", "web"),
            CertificateSpec {
                common_name: "a.example.com".to_string(),
                dns_names: vec![],
                secret_name: "web-tls".to_string(),
                issuer_ref: IssuerRef::new("ca", IssuerKind::Issuer),
                duration: None,
                renew_before: None,
            },
        )
    }

    #[test]
    fn test_certificate_derived_keys() {
        let cert = test_certificate();
        assert_eq!(cert.secret_key(), ResourceKey::new("default", "web-tls"));
        assert_eq!(cert.issuer_key(), ResourceKey::new("default", "ca"));
        assert!(!cert.is_ready());
    }

    #[test]
    fn test_failure_then_success_resets_counters() {
        let now = Utc::now();
        let failed = CertificateStatus::default()
            .with_pending_order(Some(PendingOrder {
                url: "https://acme.test/order/1".to_string(),
                names: vec!["a.example.com".to_string()],
            }))
            .with_failure("ErrIssueCert", "boom", now)
            .with_failure("ErrIssueCert", "boom again", now);
        assert_eq!(failed.failed_attempts, 2);
        assert_eq!(failed.last_failure_time, Some(now));
        assert!(failed.pending_order.is_some());

        let not_after = now + chrono::Duration::days(90);
        let renew_at = now + chrono::Duration::days(60);
        let issued = failed.with_issued("CertIssueSuccess", "ok", not_after, renew_at, now);
        assert_eq!(issued.failed_attempts, 0);
        assert_eq!(issued.not_after, Some(not_after));
        assert_eq!(issued.renewal_time, Some(renew_at));
        assert!(issued.pending_order.is_none());
        assert_eq!(ready_status(&issued.conditions), ConditionStatus::True);
        // Last failure time is kept for operators
        assert_eq!(issued.last_failure_time, Some(now));
    }

    #[test]
    fn test_issuer_status_updates_are_pure() {
        let now = Utc::now();
        let base = IssuerStatus::default();
        let ready = base
            .with_ready(ConditionStatus::True, "IssuerReady", "ok", now)
            .with_acme_account_uri(Some("https://acme.test/acct/1".to_string()));
        assert!(base.conditions.is_empty());
        assert_eq!(ready.acme_account_uri.as_deref(), Some("https://acme.test/acct/1"));
    }
}
