use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use tessera_common::ResourceKey;

use super::{Secret, SecretStore, SecretStoreError};

/// In-memory secret store
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: DashMap<ResourceKey, Secret>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous insert, handy for seeding credentials
    pub fn insert(&self, key: ResourceKey, secret: Secret) {
        self.secrets.insert(key, secret);
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.secrets.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Secret>, SecretStoreError> {
        let secret = self.secrets.get(key).map(|s| s.clone());
        trace!(secret = %key, found = secret.is_some(), "Secret lookup");
        Ok(secret)
    }

    async fn put(&self, key: &ResourceKey, secret: Secret) -> Result<(), SecretStoreError> {
        trace!(secret = %key, fields = secret.data.len(), "Secret write");
        self.secrets.insert(key.clone(), secret);
        Ok(())
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), SecretStoreError> {
        self.secrets.remove(key);
        Ok(())
    }
}
