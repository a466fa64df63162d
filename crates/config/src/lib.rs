//! Tessera Configuration
//!
//! Declarative resources (issuers and certificates), the controller
//! configuration, and their loading and validation.
//!
//! # Example
//!
//! ```kdl
//! controller {
//!     workers 4
//!     attempt-timeout "5m"
//! }
//!
//! cluster-issuer "letsencrypt" {
//!     acme {
//!         server "https://acme-v02.api.letsencrypt.org/directory"
//!         email "ops@example.com"
//!         private-key-secret "letsencrypt-account"
//!     }
//! }
//!
//! certificate "web" {
//!     namespace "default"
//!     dns-names "a.example.com"
//!     secret-name "web-tls"
//!     issuer "letsencrypt" kind="ClusterIssuer"
//!     renew-before "30d"
//! }
//! ```

pub mod controller;
pub mod duration;
pub mod kdl;
pub mod resources;
pub mod validate;

use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

pub use controller::{ControllerConfig, DEFAULT_CERTIFICATE_DURATION, DEFAULT_RENEW_BEFORE};
pub use duration::{format_duration, parse_duration};
pub use resources::{
    AcmeIssuerConfig, CaIssuerConfig, Certificate, CertificateSpec, CertificateStatus, Issuer,
    IssuerBackendConfig, IssuerSpec, IssuerStatus, PendingOrder, VaultAuth, VaultIssuerConfig,
};
pub use validate::{ValidationError, ValidationResult, ValidationWarning};

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse declaration: {0}")]
    Parse(String),

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("declaration has {} error(s): {}", .0.len(), .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Invalid(Vec<ValidationError>),
}

/// A complete declaration: controller settings plus resources
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub issuers: Vec<Issuer>,
    pub certificates: Vec<Certificate>,
}

impl Config {
    /// Load and parse a KDL declaration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), bytes = text.len(), "Read declaration file");
        Self::from_kdl(&text)
    }

    /// Parse a KDL declaration
    pub fn from_kdl(text: &str) -> Result<Self, ConfigError> {
        crate::kdl::parse_document(text).map_err(|e| ConfigError::Parse(format!("{:#}", e)))
    }

    /// Validate the declaration; warnings are logged and returned
    pub fn validate(&self) -> Result<ValidationResult, ConfigError> {
        let result = validate::validate_config(self);
        for warning in &result.warnings {
            warn!(warning = %warning, "Declaration warning");
        }
        if result.is_ok() {
            Ok(result)
        } else {
            Err(ConfigError::Invalid(result.errors))
        }
    }
}
