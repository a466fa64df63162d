//! Issuer backends
//!
//! Every backend kind implements [`IssuerBackend`]: a one-time `setup`
//! used by the issuer reconciler to report readiness, and `issue`, which
//! turns a request (names, key, duration) into a signed chain. Backends
//! return data; persisting it is the caller's job.
//!
//! [`BackendFactory`] builds (and caches, per issuer generation) the
//! backend for a declared [`Issuer`].

mod acme;
mod ca;
mod error;
mod selfsigned;
mod vault;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use tessera_common::{ResourceKey, RetryPolicy};
use tessera_config::{ControllerConfig, Issuer, IssuerBackendConfig, PendingOrder};

use crate::acme::{AcmeConnector, ChallengeSolver};
use crate::pki::NameSet;
use crate::secrets::{Secret, SecretStore};

pub use acme::AcmeBackend;
pub use ca::CaBackend;
pub use error::{IssueError, NameFailure, RetryClass};
pub use selfsigned::SelfSignedBackend;
pub use vault::VaultBackend;

/// Records the ACME order in progress so an interrupted attempt can
/// resume it instead of creating a new one.
#[async_trait]
pub trait OrderJournal: Send + Sync {
    /// Order recorded by a previous attempt, if any
    async fn load(&self) -> Option<PendingOrder>;

    /// Record (or clear, with `None`) the order in progress
    async fn record(&self, order: Option<PendingOrder>) -> Result<(), IssueError>;
}

/// Journal kept in memory; for backends that never resume and for tests
#[derive(Debug, Default)]
pub struct MemoryJournal {
    order: Mutex<Option<PendingOrder>>,
}

impl MemoryJournal {
    pub fn new(order: Option<PendingOrder>) -> Self {
        Self {
            order: Mutex::new(order),
        }
    }

    pub fn current(&self) -> Option<PendingOrder> {
        self.order.lock().clone()
    }
}

#[async_trait]
impl OrderJournal for MemoryJournal {
    async fn load(&self) -> Option<PendingOrder> {
        self.current()
    }

    async fn record(&self, order: Option<PendingOrder>) -> Result<(), IssueError> {
        *self.order.lock() = order;
        Ok(())
    }
}

/// One issuance request
#[derive(Clone)]
pub struct IssueRequest {
    pub names: NameSet,
    /// Private key to certify (PEM)
    pub key_pem: String,
    pub duration: Duration,
    pub journal: Arc<dyn OrderJournal>,
    /// Polling and in-attempt retries stop here
    pub deadline: Instant,
}

impl std::fmt::Debug for IssueRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssueRequest")
            .field("names", &self.names)
            .field("duration", &self.duration)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Signed material returned by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedBundle {
    pub key_pem: String,
    /// Leaf first
    pub chain_pem: String,
    /// Issuing CA, when the backend exposes it
    pub ca_pem: Option<String>,
}

/// Result of a successful backend bootstrap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupOutcome {
    pub message: String,
    pub acme_account_uri: Option<String>,
}

impl SetupOutcome {
    pub fn ready(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            acme_account_uri: None,
        }
    }
}

#[async_trait]
pub trait IssuerBackend: Send + Sync {
    /// Backend kind name, for logs
    fn kind(&self) -> &'static str;

    /// Validate configuration and perform one-time bootstrap
    async fn setup(&self) -> Result<SetupOutcome, IssueError>;

    async fn issue(&self, request: &IssueRequest) -> Result<IssuedBundle, IssueError>;
}

/// Source of backends for the reconcilers
pub trait BackendProvider: Send + Sync {
    fn backend_for(&self, issuer: &Issuer) -> Result<Arc<dyn IssuerBackend>, IssueError>;

    /// Release anything held for a deleted issuer
    fn forget(&self, _issuer: &ResourceKey) {}
}

/// Read a secret referenced by an issuer, mapping absence to `BackendUnready`
pub(crate) async fn load_secret(
    secrets: &dyn SecretStore,
    key: &ResourceKey,
) -> Result<Secret, IssueError> {
    secrets
        .get(key)
        .await
        .map_err(|e| IssueError::BackendUnready(format!("failed to read secret '{}': {}", key, e)))?
        .ok_or_else(|| IssueError::BackendUnready(format!("secret '{}' not found", key)))
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// next backoff delay would pass `deadline`.
pub(crate) async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Instant,
    operation: &str,
    mut op: F,
) -> Result<T, IssueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IssueError>>,
{
    let mut backoff = policy.backoff();
    loop {
        match op().await {
            Err(e) if e.is_transient() => {
                let delay = backoff.next().unwrap_or(policy.max);
                if Instant::now() + delay >= deadline {
                    return Err(e);
                }
                warn!(
                    operation = operation,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

/// Builds backends from issuer declarations
pub struct BackendFactory {
    secrets: Arc<dyn SecretStore>,
    acme: Arc<dyn AcmeConnector>,
    solvers: Vec<Arc<dyn ChallengeSolver>>,
    http: reqwest::Client,
    config: ControllerConfig,
    cache: DashMap<ResourceKey, (u64, Arc<dyn IssuerBackend>)>,
}

impl BackendFactory {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        acme: Arc<dyn AcmeConnector>,
        solvers: Vec<Arc<dyn ChallengeSolver>>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            secrets,
            acme,
            solvers,
            http: reqwest::Client::new(),
            config,
            cache: DashMap::new(),
        }
    }

    /// Use a preconfigured HTTP client for secrets-engine backends
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    fn build(&self, issuer: &Issuer) -> Result<Arc<dyn IssuerBackend>, IssueError> {
        let backend: Arc<dyn IssuerBackend> = match &issuer.spec.backend {
            IssuerBackendConfig::SelfSigned => Arc::new(SelfSignedBackend::new()),
            IssuerBackendConfig::Ca(ca) => Arc::new(CaBackend::new(
                issuer.key.sibling(ca.secret_name.clone()),
                Arc::clone(&self.secrets),
            )),
            IssuerBackendConfig::Vault(vault) => Arc::new(VaultBackend::new(
                &issuer.key,
                vault,
                Arc::clone(&self.secrets),
                self.http.clone(),
                &self.config,
            )?),
            IssuerBackendConfig::Acme(acme) => Arc::new(AcmeBackend::new(
                acme.clone(),
                issuer.key.sibling(acme.private_key_secret.clone()),
                Arc::clone(&self.secrets),
                Arc::clone(&self.acme),
                self.solvers.clone(),
                self.config.clone(),
            )),
        };
        Ok(backend)
    }
}

impl BackendProvider for BackendFactory {
    fn backend_for(&self, issuer: &Issuer) -> Result<Arc<dyn IssuerBackend>, IssueError> {
        if let Some(cached) = self.cache.get(&issuer.key) {
            if cached.0 == issuer.generation {
                trace!(issuer = %issuer.key, "Using cached issuer backend");
                return Ok(Arc::clone(&cached.1));
            }
        }

        let backend = self.build(issuer)?;
        debug!(
            issuer = %issuer.key,
            kind = backend.kind(),
            generation = issuer.generation,
            "Built issuer backend"
        );
        self.cache
            .insert(issuer.key.clone(), (issuer.generation, Arc::clone(&backend)));
        Ok(backend)
    }

    fn forget(&self, issuer: &ResourceKey) {
        if self.cache.remove(issuer).is_some() {
            debug!(issuer = %issuer, "Dropped cached issuer backend");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::InstantAcmeConnector;
    use crate::secrets::MemorySecretStore;
    use tessera_config::IssuerSpec;

    fn factory() -> BackendFactory {
        BackendFactory::new(
            Arc::new(MemorySecretStore::new()),
            Arc::new(InstantAcmeConnector::new()),
            vec![],
            ControllerConfig::fast(),
        )
    }

    #[test]
    fn test_backend_cached_per_generation() {
        let factory = factory();
        let mut issuer = Issuer::new(
            ResourceKey::new("default", "selfsigned"),
            IssuerSpec::new(IssuerBackendConfig::SelfSigned),
        );

        let first = factory.backend_for(&issuer).unwrap();
        let again = factory.backend_for(&issuer).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.kind(), "self-signed");

        issuer.generation += 1;
        let rebuilt = factory.backend_for(&issuer).unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));

        factory.forget(&issuer.key);
        let fresh = factory.backend_for(&issuer).unwrap();
        assert!(!Arc::ptr_eq(&rebuilt, &fresh));
    }

    #[tokio::test]
    async fn test_retry_transient_stops_on_terminal_error() {
        let policy = RetryPolicy::constant(Duration::from_millis(5));
        let deadline = Instant::now() + Duration::from_secs(5);
        let calls = std::sync::atomic::AtomicU32::new(0);

        let result: Result<(), IssueError> = retry_transient(&policy, deadline, "test", || {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(IssueError::NetworkTransient("connection reset".into()))
                } else {
                    Err(IssueError::AuthenticationFailed("permission denied".into()))
                }
            }
        })
        .await;

        assert!(matches!(result, Err(IssueError::AuthenticationFailed(_))));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_transient_gives_up_at_deadline() {
        let policy = RetryPolicy::constant(Duration::from_millis(20));
        let deadline = Instant::now() + Duration::from_millis(50);

        let result: Result<(), IssueError> = retry_transient(&policy, deadline, "test", || async {
            Err(IssueError::NetworkTransient("connection refused".into()))
        })
        .await;
        assert!(matches!(result, Err(IssueError::NetworkTransient(_))));
        assert!(Instant::now() < deadline + Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_memory_journal_round() {
        let journal = MemoryJournal::default();
        assert!(journal.load().await.is_none());
        let order = PendingOrder {
            url: "https://acme.test/order/1".to_string(),
            names: vec!["a.example.com".to_string()],
        };
        journal.record(Some(order.clone())).await.unwrap();
        assert_eq!(journal.load().await, Some(order));
        journal.record(None).await.unwrap();
        assert!(journal.current().is_none());
    }
}
