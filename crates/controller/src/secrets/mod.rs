//! Secret storage collaborator
//!
//! Issued key material, CA material, secrets-engine credentials and ACME
//! account credentials all live in named secrets. The engine only talks
//! to the [`SecretStore`] trait; two implementations are provided:
//!
//! - [`MemorySecretStore`] - process-local, used by tests and dry runs
//! - [`FileSecretStore`] - one directory per secret with restrictive permissions

mod file;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use tessera_common::ResourceKey;

pub use file::FileSecretStore;
pub use memory::MemorySecretStore;

/// Private key of an issued certificate (PEM)
pub const TLS_KEY: &str = "tls.key";
/// Certificate chain, leaf first (PEM)
pub const TLS_CRT: &str = "tls.crt";
/// CA certificate, when the backend returns one separately
pub const CA_CRT: &str = "ca.crt";
/// Static secrets-engine token
pub const VAULT_TOKEN: &str = "token";
/// App-role role id
pub const VAULT_ROLE_ID: &str = "roleId";
/// App-role secret id
pub const VAULT_SECRET_ID: &str = "secretId";
/// Serialized ACME account credentials
pub const ACME_CREDENTIALS: &str = "credentials.json";

/// Annotation: issuer that signed the stored certificate
pub const ANNOTATION_ISSUER_NAME: &str = "tessera.io/issuer-name";
/// Annotation: kind of that issuer
pub const ANNOTATION_ISSUER_KIND: &str = "tessera.io/issuer-kind";
/// Annotation: common name that was requested
pub const ANNOTATION_COMMON_NAME: &str = "tessera.io/common-name";
/// Annotation: comma-joined DNS names that were requested
pub const ANNOTATION_DNS_NAMES: &str = "tessera.io/dns-names";
/// Annotation: requested duration, in seconds
pub const ANNOTATION_DURATION: &str = "tessera.io/duration";
/// Annotation: ACME directory an account secret was registered with
pub const ANNOTATION_ACME_SERVER: &str = "tessera.io/acme-server";

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("secret metadata is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid secret name '{0}'")]
    InvalidName(String),
}

/// A named bag of binary payloads plus string annotations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secret {
    pub data: BTreeMap<String, Vec<u8>>,
    pub annotations: BTreeMap<String, String>,
}

impl Secret {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(mut self, field: &str, value: impl Into<Vec<u8>>) -> Self {
        self.data.insert(field.to_string(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: &str, value: impl Into<String>) -> Self {
        self.annotations.insert(key.to_string(), value.into());
        self
    }

    /// UTF-8 view of a payload; `None` when absent, empty or not text
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data
            .get(field)
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Secret storage used by the reconcilers and backends
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Secret>, SecretStoreError>;

    /// Replace the secret stored under `key`
    async fn put(&self, key: &ResourceKey, secret: Secret) -> Result<(), SecretStoreError>;

    async fn delete(&self, key: &ResourceKey) -> Result<(), SecretStoreError>;
}
