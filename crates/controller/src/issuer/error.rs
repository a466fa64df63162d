//! Issuance failure taxonomy

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::pki::PkiError;

/// Why one requested name could not be validated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFailure {
    pub name: String,
    pub reason: String,
}

impl NameFailure {
    pub fn new(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for NameFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.reason)
    }
}

fn join_failures(failures: &[NameFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

/// Typed failure of one issuance attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IssueError {
    #[error("invalid certificate request: {0}")]
    InvalidSpec(String),

    #[error("issuer not ready: {0}")]
    BackendUnready(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("network error: {0}")]
    NetworkTransient(String),

    #[error("challenge validation failed: {}", join_failures(.failures))]
    ChallengeFailed { failures: Vec<NameFailure> },

    #[error("order finalization failed: {0}")]
    FinalizeFailed(String),

    #[error("rate limited: {message}{}", retry_hint(.retry_after))]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("failed to store issued certificate: {0}")]
    SecretWriteFailed(String),
}

/// How the reconciler reschedules after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Retrying cannot help; only rechecked at the longest backoff
    Never,
    /// Short fixed delay while the issuer becomes ready
    IssuerNotReady,
    /// Exponential per-resource backoff
    Backoff,
    /// Exponential backoff with the ACME failure floor
    AcmeBackoff,
    /// Server-provided delay, or backoff when none was given
    RateLimited(Option<Duration>),
}

impl IssueError {
    pub fn challenge_failed(failures: Vec<NameFailure>) -> Self {
        IssueError::ChallengeFailed { failures }
    }

    /// Stable reason string recorded in status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            IssueError::InvalidSpec(_) => "InvalidSpec",
            IssueError::BackendUnready(_) => "IssuerNotReady",
            IssueError::AuthenticationFailed(_) => "AuthenticationFailed",
            IssueError::NetworkTransient(_) => "NetworkTransient",
            IssueError::ChallengeFailed { .. } => "ChallengeFailed",
            IssueError::FinalizeFailed(_) => "FinalizeFailed",
            IssueError::RateLimited { .. } => "RateLimited",
            IssueError::MalformedResponse(_) => "MalformedResponse",
            IssueError::Crypto(_) => "CryptoError",
            IssueError::SecretWriteFailed(_) => "SecretWriteFailed",
        }
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            IssueError::InvalidSpec(_) => RetryClass::Never,
            IssueError::BackendUnready(_) => RetryClass::IssuerNotReady,
            IssueError::ChallengeFailed { .. } | IssueError::FinalizeFailed(_) => {
                RetryClass::AcmeBackoff
            }
            IssueError::RateLimited { retry_after, .. } => RetryClass::RateLimited(*retry_after),
            IssueError::AuthenticationFailed(_)
            | IssueError::NetworkTransient(_)
            | IssueError::MalformedResponse(_)
            | IssueError::Crypto(_)
            | IssueError::SecretWriteFailed(_) => RetryClass::Backoff,
        }
    }

    /// Retried inside the current attempt rather than surfaced
    pub fn is_transient(&self) -> bool {
        matches!(self, IssueError::NetworkTransient(_))
    }
}

impl From<PkiError> for IssueError {
    fn from(err: PkiError) -> Self {
        match err {
            PkiError::NoNames => IssueError::InvalidSpec(err.to_string()),
            other => IssueError::Crypto(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_failure_message_lists_names() {
        let err = IssueError::challenge_failed(vec![
            NameFailure::new("a.example.com", "no supported challenge"),
            NameFailure::new("b.example.com", "connection refused"),
        ]);
        assert_eq!(err.reason(), "ChallengeFailed");
        assert_eq!(
            err.to_string(),
            "challenge validation failed: a.example.com: no supported challenge; b.example.com: connection refused"
        );
        assert_eq!(err.retry_class(), RetryClass::AcmeBackoff);
    }

    #[test]
    fn test_retry_classes() {
        assert_eq!(
            IssueError::InvalidSpec("x".into()).retry_class(),
            RetryClass::Never
        );
        let limited = IssueError::RateLimited {
            message: "too many orders".into(),
            retry_after: Some(Duration::from_secs(120)),
        };
        assert_eq!(
            limited.retry_class(),
            RetryClass::RateLimited(Some(Duration::from_secs(120)))
        );
        assert!(limited.to_string().ends_with("(retry after 120s)"));
        assert!(IssueError::NetworkTransient("reset".into()).is_transient());
        assert!(!IssueError::AuthenticationFailed("denied".into()).is_transient());
    }

    #[test]
    fn test_pki_error_mapping() {
        assert_eq!(IssueError::from(PkiError::NoNames).reason(), "InvalidSpec");
        assert_eq!(
            IssueError::from(PkiError::KeyMismatch).reason(),
            "CryptoError"
        );
    }
}
