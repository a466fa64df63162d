//! Certificate validation
//!
//! Validates requested names, output secrets and issuer references.

use std::collections::{HashMap, HashSet};

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::resources::Certificate;
use crate::Config;

/// Validate every declared certificate
pub fn validate_certificates(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let declared_issuers: HashSet<_> = config.issuers.iter().map(|i| i.key.clone()).collect();
    let mut secret_owners: HashMap<_, &Certificate> = HashMap::new();

    for cert in &config.certificates {
        result.merge(validate_certificate(cert));

        if !declared_issuers.contains(&cert.issuer_key()) {
            result.add_warning(ValidationWarning::new(format!(
                "Certificate '{}' references issuer '{}' which is not declared",
                cert.key, cert.spec.issuer_ref
            )));
        }

        if let Some(other) = secret_owners.insert(cert.secret_key(), cert) {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!(
                    "Certificates '{}' and '{}' both write secret '{}'",
                    other.key,
                    cert.key,
                    cert.secret_key()
                ),
            ));
        }
    }

    result
}

/// Validate one certificate's spec
pub fn validate_certificate(cert: &Certificate) -> ValidationResult {
    let mut result = ValidationResult::new();
    let spec = &cert.spec;

    if spec.common_name.trim().is_empty() && spec.dns_names.is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Certificate,
            format!(
                "Certificate '{}' must set common-name or at least one dns-name",
                cert.key
            ),
        ));
    }

    if spec.secret_name.trim().is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Certificate,
            format!("Certificate '{}' requires a non-empty secret-name", cert.key),
        ));
    }

    let mut seen = HashSet::new();
    for name in spec.dns_names.iter().chain(std::iter::once(&spec.common_name)) {
        if name.is_empty() {
            continue;
        }
        if !is_valid_dns_name(name) {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!("Certificate '{}' has invalid DNS name '{}'", cert.key, name),
            ));
        }
    }
    for name in &spec.dns_names {
        if !seen.insert(name.to_ascii_lowercase()) {
            result.add_warning(ValidationWarning::new(format!(
                "Certificate '{}' lists DNS name '{}' more than once",
                cert.key, name
            )));
        }
    }

    if let (Some(duration), Some(renew_before)) = (spec.duration, spec.renew_before) {
        if !renew_before.is_zero() && renew_before >= duration {
            result.add_warning(ValidationWarning::new(format!(
                "Certificate '{}' renew-before is not shorter than its duration; it will be reduced to a third of the duration",
                cert.key
            )));
        }
    }

    result
}

/// Hostname check allowing one leading wildcard label
pub fn is_valid_dns_name(name: &str) -> bool {
    let name = name.strip_prefix("*.").unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::CertificateSpec;
    use tessera_common::{IssuerKind, IssuerRef, ResourceKey};

    fn cert(name: &str, common_name: &str, dns: &[&str], secret: &str) -> Certificate {
        Certificate::new(
            ResourceKey::new("default", name),
            CertificateSpec {
                common_name: common_name.to_string(),
                dns_names: dns.iter().map(|s| s.to_string()).collect(),
                secret_name: secret.to_string(),
                issuer_ref: IssuerRef::new("ca", IssuerKind::Issuer),
                duration: None,
                renew_before: None,
            },
        )
    }

    #[test]
    fn test_requires_some_name() {
        let result = validate_certificate(&cert("web", "", &[], "web-tls"));
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("must set common-name")));
    }

    #[test]
    fn test_invalid_dns_name() {
        let result = validate_certificate(&cert("web", "", &["bad_name.example.com"], "web-tls"));
        assert!(!result.is_ok());
    }

    #[test]
    fn test_duplicate_dns_name_warns() {
        let result = validate_certificate(&cert(
            "web",
            "",
            &["a.example.com", "A.example.com"],
            "web-tls",
        ));
        assert!(result.is_ok());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_shared_secret_is_an_error() {
        let config = Config {
            certificates: vec![
                cert("one", "a.example.com", &[], "shared"),
                cert("two", "b.example.com", &[], "shared"),
            ],
            ..Default::default()
        };
        let result = validate_certificates(&config);
        assert!(result.errors.iter().any(|e| e.message.contains("both write")));
        // Issuer 'ca' is not declared in this config
        assert!(result.warnings.iter().any(|w| w.message.contains("not declared")));
    }

    #[test]
    fn test_dns_name_rules() {
        assert!(is_valid_dns_name("a.example.com"));
        assert!(is_valid_dns_name("*.example.com"));
        assert!(!is_valid_dns_name("-a.example.com"));
        assert!(!is_valid_dns_name("a..example.com"));
        assert!(!is_valid_dns_name("*"));
    }
}
