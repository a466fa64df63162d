//! Resource storage and change notification
//!
//! The engine reads declared Issuers and Certificates through
//! [`ResourceStore`] and writes their status back through a single
//! update path per kind. Status writes carry the generation the writer
//! observed; a write against a newer generation is rejected so results
//! computed for an outdated spec are never recorded.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use tessera_common::ResourceKey;
use tessera_config::{Certificate, CertificateStatus, Issuer, IssuerStatus};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Certificate,
    Issuer,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Certificate => f.write_str("Certificate"),
            ResourceKind::Issuer => f.write_str("Issuer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created, or spec changed
    Applied,
    /// Status changed; spec unchanged
    StatusUpdated,
    Deleted,
}

/// Change notification delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEvent {
    pub kind: ResourceKind,
    pub key: ResourceKey,
    pub change: ChangeKind,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{key}' not found")]
    NotFound { kind: ResourceKind, key: ResourceKey },

    #[error("{kind} '{key}' changed: observed generation {observed}, current {current}")]
    Conflict {
        kind: ResourceKind,
        key: ResourceKey,
        observed: u64,
        current: u64,
    },
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_certificate(&self, key: &ResourceKey) -> Result<Option<Certificate>, StoreError>;

    async fn list_certificates(&self) -> Result<Vec<Certificate>, StoreError>;

    async fn get_issuer(&self, key: &ResourceKey) -> Result<Option<Issuer>, StoreError>;

    async fn list_issuers(&self) -> Result<Vec<Issuer>, StoreError>;

    /// Replace a certificate's status if its generation is still `generation`
    async fn update_certificate_status(
        &self,
        key: &ResourceKey,
        generation: u64,
        status: CertificateStatus,
    ) -> Result<(), StoreError>;

    /// Replace an issuer's status if its generation is still `generation`
    async fn update_issuer_status(
        &self,
        key: &ResourceKey,
        generation: u64,
        status: IssuerStatus,
    ) -> Result<(), StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent>;
}

/// In-memory resource store
#[derive(Debug)]
pub struct MemoryResourceStore {
    certificates: DashMap<ResourceKey, Certificate>,
    issuers: DashMap<ResourceKey, Issuer>,
    events: broadcast::Sender<ResourceEvent>,
}

impl Default for MemoryResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryResourceStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            certificates: DashMap::new(),
            issuers: DashMap::new(),
            events,
        }
    }

    fn emit(&self, kind: ResourceKind, key: &ResourceKey, change: ChangeKind) {
        trace!(kind = %kind, key = %key, change = ?change, "Resource event");
        // No subscribers is not an error
        let _ = self.events.send(ResourceEvent {
            kind,
            key: key.clone(),
            change,
        });
    }

    /// Create or update a certificate's spec; status is kept.
    ///
    /// Returns the resulting generation.
    pub fn apply_certificate(&self, cert: Certificate) -> u64 {
        let key = cert.key.clone();
        let (generation, changed) = match self.certificates.get_mut(&key) {
            Some(existing) if existing.spec == cert.spec => (existing.generation, false),
            Some(mut existing) => {
                existing.generation += 1;
                existing.spec = cert.spec;
                (existing.generation, true)
            }
            None => {
                let generation = cert.generation.max(1);
                self.certificates.insert(
                    key.clone(),
                    Certificate {
                        generation,
                        ..cert
                    },
                );
                (generation, true)
            }
        };

        if changed {
            debug!(certificate = %key, generation, "Applied certificate");
            self.emit(ResourceKind::Certificate, &key, ChangeKind::Applied);
        }
        generation
    }

    /// Create or update an issuer's spec; status is kept
    pub fn apply_issuer(&self, issuer: Issuer) -> u64 {
        let key = issuer.key.clone();
        let (generation, changed) = match self.issuers.get_mut(&key) {
            Some(existing) if existing.spec == issuer.spec => (existing.generation, false),
            Some(mut existing) => {
                existing.generation += 1;
                existing.spec = issuer.spec;
                (existing.generation, true)
            }
            None => {
                let generation = issuer.generation.max(1);
                self.issuers.insert(
                    key.clone(),
                    Issuer {
                        generation,
                        ..issuer
                    },
                );
                (generation, true)
            }
        };

        if changed {
            debug!(issuer = %key, generation, "Applied issuer");
            self.emit(ResourceKind::Issuer, &key, ChangeKind::Applied);
        }
        generation
    }

    pub fn delete_certificate(&self, key: &ResourceKey) -> bool {
        let removed = self.certificates.remove(key).is_some();
        if removed {
            debug!(certificate = %key, "Deleted certificate");
            self.emit(ResourceKind::Certificate, key, ChangeKind::Deleted);
        }
        removed
    }

    pub fn delete_issuer(&self, key: &ResourceKey) -> bool {
        let removed = self.issuers.remove(key).is_some();
        if removed {
            debug!(issuer = %key, "Deleted issuer");
            self.emit(ResourceKind::Issuer, key, ChangeKind::Deleted);
        }
        removed
    }

    /// Make the store match a full declaration: apply everything given,
    /// delete everything else.
    pub fn apply_declaration(&self, issuers: Vec<Issuer>, certificates: Vec<Certificate>) {
        let issuer_keys: std::collections::HashSet<_> =
            issuers.iter().map(|i| i.key.clone()).collect();
        let certificate_keys: std::collections::HashSet<_> =
            certificates.iter().map(|c| c.key.clone()).collect();

        for issuer in issuers {
            self.apply_issuer(issuer);
        }
        for cert in certificates {
            self.apply_certificate(cert);
        }

        let stale_certificates: Vec<_> = self
            .certificates
            .iter()
            .filter(|c| !certificate_keys.contains(c.key()))
            .map(|c| c.key().clone())
            .collect();
        for key in stale_certificates {
            self.delete_certificate(&key);
        }

        let stale_issuers: Vec<_> = self
            .issuers
            .iter()
            .filter(|i| !issuer_keys.contains(i.key()))
            .map(|i| i.key().clone())
            .collect();
        for key in stale_issuers {
            self.delete_issuer(&key);
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    async fn get_certificate(&self, key: &ResourceKey) -> Result<Option<Certificate>, StoreError> {
        Ok(self.certificates.get(key).map(|c| c.clone()))
    }

    async fn list_certificates(&self) -> Result<Vec<Certificate>, StoreError> {
        Ok(self.certificates.iter().map(|c| c.clone()).collect())
    }

    async fn get_issuer(&self, key: &ResourceKey) -> Result<Option<Issuer>, StoreError> {
        Ok(self.issuers.get(key).map(|i| i.clone()))
    }

    async fn list_issuers(&self) -> Result<Vec<Issuer>, StoreError> {
        Ok(self.issuers.iter().map(|i| i.clone()).collect())
    }

    async fn update_certificate_status(
        &self,
        key: &ResourceKey,
        generation: u64,
        status: CertificateStatus,
    ) -> Result<(), StoreError> {
        let changed = {
            let mut cert = self
                .certificates
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound {
                    kind: ResourceKind::Certificate,
                    key: key.clone(),
                })?;
            if cert.generation != generation {
                return Err(StoreError::Conflict {
                    kind: ResourceKind::Certificate,
                    key: key.clone(),
                    observed: generation,
                    current: cert.generation,
                });
            }
            let changed = cert.status != status;
            cert.status = status;
            changed
        };

        if changed {
            self.emit(ResourceKind::Certificate, key, ChangeKind::StatusUpdated);
        }
        Ok(())
    }

    async fn update_issuer_status(
        &self,
        key: &ResourceKey,
        generation: u64,
        status: IssuerStatus,
    ) -> Result<(), StoreError> {
        let changed = {
            let mut issuer = self
                .issuers
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound {
                    kind: ResourceKind::Issuer,
                    key: key.clone(),
                })?;
            if issuer.generation != generation {
                return Err(StoreError::Conflict {
                    kind: ResourceKind::Issuer,
                    key: key.clone(),
                    observed: generation,
                    current: issuer.generation,
                });
            }
            let changed = issuer.status != status;
            issuer.status = status;
            changed
        };

        if changed {
            self.emit(ResourceKind::Issuer, key, ChangeKind::StatusUpdated);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }
}
