//! Controller runtime
//!
//! Owns one work queue per resource kind and a bounded pool of workers
//! for each. Store change notifications and reconciler requeues both feed
//! the queues; the queues guarantee a key is processed by one worker at a
//! time, which is what serializes issuance per certificate.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use tessera_common::{ResourceKey, RetryPolicy};

use crate::queue::WorkQueue;
use crate::reconcile::{
    Action, CertificateReconciler, Context, IssuerReconciler, ReconcileError,
};
use crate::store::{ChangeKind, ResourceEvent, ResourceKind, ResourceStore};

pub struct Controller {
    ctx: Arc<Context>,
    certificates: WorkQueue<ResourceKey>,
    issuers: WorkQueue<ResourceKey>,
}

impl Controller {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx: Arc::new(ctx),
            certificates: WorkQueue::new(),
            issuers: WorkQueue::new(),
        }
    }

    pub fn certificate_queue(&self) -> &WorkQueue<ResourceKey> {
        &self.certificates
    }

    pub fn issuer_queue(&self) -> &WorkQueue<ResourceKey> {
        &self.issuers
    }

    /// Run until `shutdown` resolves, then drain the workers
    pub async fn run<F>(self, shutdown: F) -> Result<(), ReconcileError>
    where
        F: Future<Output = ()>,
    {
        let workers = self.ctx.config.workers.max(1);
        info!(workers = workers, "Starting certificate controller");

        // Subscribe before seeding so no change falls in between
        let events = self.ctx.store.subscribe();
        resync(self.ctx.store.as_ref(), &self.issuers, &self.certificates).await?;

        let forwarder = tokio::spawn(forward_events(
            Arc::clone(&self.ctx.store),
            events,
            self.issuers.clone(),
            self.certificates.clone(),
        ));

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(workers * 2);
        let certificate_reconciler = Arc::new(CertificateReconciler::new(Arc::clone(&self.ctx)));
        let issuer_reconciler = Arc::new(IssuerReconciler::new(Arc::clone(&self.ctx)));
        let certificate_errors = Arc::new(ErrorBackoff::default());
        let issuer_errors = Arc::new(ErrorBackoff::default());
        for id in 0..workers {
            let reconciler = Arc::clone(&certificate_reconciler);
            handles.push(tokio::spawn(worker(
                "certificate",
                id,
                self.certificates.clone(),
                Arc::clone(&self.ctx),
                Arc::clone(&certificate_errors),
                move |key| {
                    let reconciler = Arc::clone(&reconciler);
                    async move { reconciler.reconcile(&key).await }
                },
            )));

            let reconciler = Arc::clone(&issuer_reconciler);
            handles.push(tokio::spawn(worker(
                "issuer",
                id,
                self.issuers.clone(),
                Arc::clone(&self.ctx),
                Arc::clone(&issuer_errors),
                move |key| {
                    let reconciler = Arc::clone(&reconciler);
                    async move { reconciler.reconcile(&key).await }
                },
            )));
        }

        shutdown.await;
        info!("Shutting down certificate controller");

        self.certificates.shutdown();
        self.issuers.shutdown();
        forwarder.abort();
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(error = %e, "Controller worker panicked");
                }
            }
        }
        info!("Certificate controller stopped");
        Ok(())
    }
}

/// Queue every known resource
async fn resync(
    store: &dyn ResourceStore,
    issuers: &WorkQueue<ResourceKey>,
    certificates: &WorkQueue<ResourceKey>,
) -> Result<(), ReconcileError> {
    let issuer_list = store.list_issuers().await?;
    let certificate_list = store.list_certificates().await?;
    debug!(
        issuers = issuer_list.len(),
        certificates = certificate_list.len(),
        "Queueing all resources"
    );
    for issuer in issuer_list {
        issuers.add(issuer.key);
    }
    for cert in certificate_list {
        certificates.add(cert.key);
    }
    Ok(())
}

/// Queue the certificates that reference `issuer`
async fn queue_dependents(
    store: &dyn ResourceStore,
    issuer: &ResourceKey,
    certificates: &WorkQueue<ResourceKey>,
) -> Result<(), ReconcileError> {
    for cert in store.list_certificates().await? {
        if &cert.issuer_key() == issuer {
            trace!(certificate = %cert.key, issuer = %issuer, "Queueing dependent certificate");
            certificates.add(cert.key);
        }
    }
    Ok(())
}

async fn handle_event(
    store: &dyn ResourceStore,
    event: ResourceEvent,
    issuers: &WorkQueue<ResourceKey>,
    certificates: &WorkQueue<ResourceKey>,
) -> Result<(), ReconcileError> {
    match (event.kind, event.change) {
        (ResourceKind::Certificate, ChangeKind::Applied | ChangeKind::Deleted) => {
            certificates.add(event.key);
        }
        // Certificates write their own status; reacting would loop
        (ResourceKind::Certificate, ChangeKind::StatusUpdated) => {}
        (ResourceKind::Issuer, ChangeKind::Applied | ChangeKind::Deleted) => {
            issuers.add(event.key.clone());
            queue_dependents(store, &event.key, certificates).await?;
        }
        (ResourceKind::Issuer, ChangeKind::StatusUpdated) => {
            queue_dependents(store, &event.key, certificates).await?;
        }
    }
    Ok(())
}

async fn forward_events(
    store: Arc<dyn ResourceStore>,
    mut events: tokio::sync::broadcast::Receiver<ResourceEvent>,
    issuers: WorkQueue<ResourceKey>,
    certificates: WorkQueue<ResourceKey>,
) {
    loop {
        let result = match events.recv().await {
            Ok(event) => {
                trace!(kind = %event.kind, key = %event.key, change = ?event.change, "Resource changed");
                handle_event(store.as_ref(), event, &issuers, &certificates).await
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed = missed, "Missed resource notifications, resyncing");
                resync(store.as_ref(), &issuers, &certificates).await
            }
            Err(RecvError::Closed) => {
                debug!("Resource notifications closed");
                return;
            }
        };
        if let Err(e) = result {
            error!(error = %e, "Failed to queue changed resources");
        }
    }
}

/// Consecutive reconcile errors per key, for keys whose reconciler could
/// not record the failure itself
#[derive(Default)]
struct ErrorBackoff {
    errors: DashMap<ResourceKey, u32>,
}

impl ErrorBackoff {
    fn failed(&self, key: &ResourceKey, policy: &RetryPolicy) -> Duration {
        let mut count = self.errors.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        policy.delay_for(*count - 1)
    }

    fn succeeded(&self, key: &ResourceKey) {
        self.errors.remove(key);
    }
}

async fn worker<F, Fut>(
    kind: &'static str,
    id: usize,
    queue: WorkQueue<ResourceKey>,
    ctx: Arc<Context>,
    errors: Arc<ErrorBackoff>,
    reconcile: F,
) where
    F: Fn(ResourceKey) -> Fut,
    Fut: Future<Output = Result<Action, ReconcileError>>,
{
    trace!(kind = kind, worker = id, "Worker started");
    while let Some(key) = queue.get().await {
        match reconcile(key.clone()).await {
            Ok(action) => {
                errors.succeeded(&key);
                if let Some(after) = action.requeue_after {
                    trace!(kind = kind, key = %key, requeue_ms = after.as_millis() as u64, "Requeue");
                    queue.add_after(key.clone(), after);
                }
            }
            Err(e) => {
                let after = errors.failed(&key, &ctx.config.failure_backoff);
                error!(
                    kind = kind,
                    key = %key,
                    error = %e,
                    retry_in_ms = after.as_millis() as u64,
                    "Reconcile failed"
                );
                queue.add_after(key.clone(), after);
            }
        }
        queue.done(&key);
    }
    trace!(kind = kind, worker = id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryRecorder;
    use crate::issuer::{BackendProvider, IssueError, IssueRequest, IssuedBundle, IssuerBackend, SetupOutcome};
    use crate::pki;
    use crate::secrets::MemorySecretStore;
    use crate::store::MemoryResourceStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tessera_common::{IssuerKind, IssuerRef};
    use tessera_config::{
        Certificate, CertificateSpec, ControllerConfig, Issuer, IssuerBackendConfig, IssuerSpec,
    };

    #[derive(Default)]
    struct CountingBackend {
        issued: AtomicU32,
    }

    #[async_trait]
    impl IssuerBackend for CountingBackend {
        fn kind(&self) -> &'static str {
            "counting"
        }

        async fn setup(&self) -> Result<SetupOutcome, IssueError> {
            Ok(SetupOutcome::ready("ready"))
        }

        async fn issue(&self, request: &IssueRequest) -> Result<IssuedBundle, IssueError> {
            self.issued.fetch_add(1, Ordering::SeqCst);
            let chain = pki::self_sign(&request.key_pem, &request.names, request.duration)?;
            Ok(IssuedBundle {
                key_pem: request.key_pem.clone(),
                chain_pem: chain,
                ca_pem: None,
            })
        }
    }

    struct Provider(Arc<CountingBackend>);

    impl BackendProvider for Provider {
        fn backend_for(&self, _issuer: &Issuer) -> Result<Arc<dyn IssuerBackend>, IssueError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_issuer_readiness_unblocks_certificates() {
        let store = Arc::new(MemoryResourceStore::new());
        let backend = Arc::new(CountingBackend::default());
        let cert_key = ResourceKey::new("default", "web");

        // Certificate declared before its issuer
        store.apply_certificate(Certificate::new(
            cert_key.clone(),
            CertificateSpec {
                common_name: "a.example.com".to_string(),
                dns_names: vec![],
                secret_name: "web-tls".to_string(),
                issuer_ref: IssuerRef::new("selfsigned", IssuerKind::Issuer),
                duration: None,
                renew_before: None,
            },
        ));

        let mut config = ControllerConfig::fast();
        config.issuer_not_ready_requeue = Duration::from_secs(60);
        let controller = Controller::new(Context {
            store: store.clone(),
            secrets: Arc::new(MemorySecretStore::new()),
            backends: Arc::new(Provider(backend.clone())),
            recorder: Arc::new(MemoryRecorder::new()),
            config,
        });

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(controller.run(async {
            let _ = stop_rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        store.apply_issuer(Issuer::new(
            ResourceKey::new("default", "selfsigned"),
            IssuerSpec::new(IssuerBackendConfig::SelfSigned),
        ));

        let mut ready = false;
        for _ in 0..100 {
            if let Some(cert) = store.get_certificate(&cert_key).await.unwrap() {
                if cert.is_ready() {
                    ready = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(ready, "certificate did not become ready");
        assert_eq!(backend.issued.load(Ordering::SeqCst), 1);

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[test]
    fn test_reconcile_errors_back_off_per_key() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(400))
            .with_multiplier(2.0)
            .with_jitter(0.0);
        let errors = ErrorBackoff::default();
        let web = ResourceKey::new("default", "web");
        let api = ResourceKey::new("default", "api");

        assert_eq!(errors.failed(&web, &policy), Duration::from_millis(100));
        assert_eq!(errors.failed(&web, &policy), Duration::from_millis(200));
        assert_eq!(errors.failed(&web, &policy), Duration::from_millis(400));
        assert_eq!(errors.failed(&web, &policy), Duration::from_millis(400));
        assert_eq!(errors.failed(&api, &policy), Duration::from_millis(100));

        errors.succeeded(&web);
        assert_eq!(errors.failed(&web, &policy), Duration::from_millis(100));
    }
}
