//! Issuer validation
//!
//! Checks backend configuration for each declared issuer.

use std::collections::HashSet;

use url::Url;

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::resources::{Issuer, IssuerBackendConfig, VaultAuth};
use crate::Config;

/// Validate every declared issuer
pub fn validate_issuers(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let mut seen = HashSet::new();

    for issuer in &config.issuers {
        if !seen.insert(issuer.key.clone()) {
            result.add_error(ValidationError::new(
                ErrorCategory::Issuer,
                format!("Issuer '{}' is declared more than once", issuer.key),
            ));
        }
        result.merge(validate_issuer(issuer));
    }

    result
}

/// Validate one issuer's backend configuration
pub fn validate_issuer(issuer: &Issuer) -> ValidationResult {
    let mut result = ValidationResult::new();
    let name = &issuer.key;

    match &issuer.spec.backend {
        IssuerBackendConfig::Acme(acme) => {
            check_url(&mut result, name, "ACME server", &acme.server);
            if !acme.email.contains('@') {
                result.add_error(ValidationError::new(
                    ErrorCategory::Issuer,
                    format!("Issuer '{}' has invalid ACME email '{}'", name, acme.email),
                ));
            }
            check_not_empty(&mut result, name, "private-key-secret", &acme.private_key_secret);
        }
        IssuerBackendConfig::Ca(ca) => {
            check_not_empty(&mut result, name, "secret-name", &ca.secret_name);
        }
        IssuerBackendConfig::SelfSigned => {}
        IssuerBackendConfig::Vault(vault) => {
            check_url(&mut result, name, "Vault server", &vault.server);
            check_not_empty(&mut result, name, "path", vault.path.trim_matches('/'));
            match &vault.auth {
                VaultAuth::Token { secret_name } => {
                    check_not_empty(&mut result, name, "token-secret", secret_name);
                }
                VaultAuth::AppRole { secret_name, path } => {
                    check_not_empty(&mut result, name, "app-role secret-name", secret_name);
                    check_not_empty(&mut result, name, "app-role path", path);
                }
            }
        }
    }

    if let (Some(duration), Some(renew_before)) =
        (issuer.spec.duration, issuer.spec.renew_before)
    {
        if !renew_before.is_zero() && renew_before >= duration {
            result.add_warning(ValidationWarning::new(format!(
                "Issuer '{}' renew-before is not shorter than its duration; it will be reduced to a third of the duration",
                name
            )));
        }
    }

    result
}

fn check_url(result: &mut ValidationResult, owner: &impl std::fmt::Display, what: &str, raw: &str) {
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        Ok(url) => result.add_error(ValidationError::new(
            ErrorCategory::Issuer,
            format!(
                "Issuer '{}' {} URL must use http or https, got '{}'",
                owner,
                what,
                url.scheme()
            ),
        )),
        Err(e) => result.add_error(ValidationError::new(
            ErrorCategory::Issuer,
            format!("Issuer '{}' has invalid {} URL '{}': {}", owner, what, raw, e),
        )),
    }
}

fn check_not_empty(
    result: &mut ValidationResult,
    owner: &impl std::fmt::Display,
    field: &str,
    value: &str,
) {
    if value.trim().is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Issuer,
            format!("Issuer '{}' requires a non-empty '{}'", owner, field),
        ));
    }
}
