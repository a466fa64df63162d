//! Semantic validation of a parsed declaration.
//!
//! Validation collects every problem instead of stopping at the first one,
//! separating errors (the declaration cannot be used) from warnings (it can,
//! but probably not as intended).

mod certificates;
mod issuers;

pub use certificates::validate_certificates;
pub use issuers::validate_issuers;

use std::fmt;

use crate::Config;

/// Area a validation error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Issuer,
    Certificate,
    Controller,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Issuer => "issuer",
            ErrorCategory::Certificate => "certificate",
            ErrorCategory::Controller => "controller",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Run every validator over the declaration
pub fn validate_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.controller.workers == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Controller,
            "workers must be at least 1",
        ));
    }
    if config.controller.attempt_timeout.is_zero() {
        result.add_error(ValidationError::new(
            ErrorCategory::Controller,
            "attempt-timeout must be greater than zero",
        ));
    }

    result.merge(validate_issuers(config));
    result.merge(validate_certificates(config));
    result
}
