//! ACME backend
//!
//! Holds one account session per issuer generation. Credentials live in
//! the account-key secret, annotated with the directory they belong to,
//! so an issuer pointed at a different server registers a new account.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tessera_common::ResourceKey;
use tessera_config::{AcmeIssuerConfig, ControllerConfig};

use super::{retry_transient, IssueError, IssueRequest, IssuedBundle, IssuerBackend, SetupOutcome};
use crate::acme::{AcmeConnector, AcmeError, AcmeOrchestrator, AcmeSession, ChallengeSolver};
use crate::secrets::{Secret, SecretStore, ACME_CREDENTIALS, ANNOTATION_ACME_SERVER};

fn connect_error(err: AcmeError) -> IssueError {
    match err {
        AcmeError::Transient(message) => IssueError::NetworkTransient(message),
        AcmeError::RateLimited {
            detail,
            retry_after,
        } => IssueError::RateLimited {
            message: detail,
            retry_after,
        },
        AcmeError::UnknownOrder(message) => IssueError::MalformedResponse(message),
        other => IssueError::AuthenticationFailed(other.to_string()),
    }
}

pub struct AcmeBackend {
    config: AcmeIssuerConfig,
    account_secret: ResourceKey,
    secrets: Arc<dyn SecretStore>,
    connector: Arc<dyn AcmeConnector>,
    solvers: Vec<Arc<dyn ChallengeSolver>>,
    controller: ControllerConfig,
    session: Mutex<Option<AcmeSession>>,
    /// Credentials the server no longer recognises
    rejected: Mutex<Option<String>>,
}

impl AcmeBackend {
    pub fn new(
        config: AcmeIssuerConfig,
        account_secret: ResourceKey,
        secrets: Arc<dyn SecretStore>,
        connector: Arc<dyn AcmeConnector>,
        solvers: Vec<Arc<dyn ChallengeSolver>>,
        controller: ControllerConfig,
    ) -> Self {
        Self {
            config,
            account_secret,
            secrets,
            connector,
            solvers,
            controller,
            session: Mutex::new(None),
            rejected: Mutex::new(None),
        }
    }

    /// Stored credentials, if they belong to the configured server
    async fn stored_credentials(&self) -> Result<Option<String>, IssueError> {
        let secret = self.secrets.get(&self.account_secret).await.map_err(|e| {
            IssueError::BackendUnready(format!(
                "failed to read ACME account secret '{}': {}",
                self.account_secret, e
            ))
        })?;
        let Some(secret) = secret else {
            return Ok(None);
        };

        if let Some(server) = secret.annotation(ANNOTATION_ACME_SERVER) {
            if server != self.config.server {
                warn!(
                    secret = %self.account_secret,
                    stored = %server,
                    configured = %self.config.server,
                    "ACME account belongs to another server, registering a new one"
                );
                return Ok(None);
            }
        }
        Ok(secret.get_str(ACME_CREDENTIALS).map(str::to_string))
    }

    async fn session(&self) -> Result<AcmeSession, IssueError> {
        let mut cached = self.session.lock().await;
        if let Some(session) = cached.as_ref() {
            return Ok(session.clone());
        }

        let mut credentials = self.stored_credentials().await?;
        if credentials.is_some() && *self.rejected.lock().await == credentials {
            warn!(
                secret = %self.account_secret,
                "Stored ACME account was rejected by the server, registering a new one"
            );
            credentials = None;
        }
        let deadline = Instant::now() + self.controller.attempt_timeout;
        let credentials = credentials.as_deref();
        let (connector, server, email) = (&self.connector, &self.config.server, &self.config.email);
        let session = retry_transient(
            &self.controller.transient_retry,
            deadline,
            "connect ACME account",
            || async move {
                connector
                    .connect(server, email, credentials)
                    .await
                    .map_err(connect_error)
            },
        )
        .await?;

        if session.registered {
            let secret = Secret::new()
                .with_data(ACME_CREDENTIALS, session.credentials_json.clone())
                .with_annotation(ANNOTATION_ACME_SERVER, self.config.server.clone());
            self.secrets
                .put(&self.account_secret, secret)
                .await
                .map_err(|e| {
                    IssueError::BackendUnready(format!(
                        "failed to store ACME account credentials in '{}': {}",
                        self.account_secret, e
                    ))
                })?;
            info!(
                account = %session.account_uri,
                secret = %self.account_secret,
                "Stored ACME account credentials"
            );
        } else {
            debug!(account = %session.account_uri, "Using existing ACME account");
        }

        *cached = Some(session.clone());
        Ok(session)
    }

    /// Forget the session and never restore its credentials again
    async fn reject_session(&self, session: &AcmeSession) {
        self.session.lock().await.take();
        *self.rejected.lock().await = Some(session.credentials_json.clone());
    }
}

#[async_trait]
impl IssuerBackend for AcmeBackend {
    fn kind(&self) -> &'static str {
        "acme"
    }

    async fn setup(&self) -> Result<SetupOutcome, IssueError> {
        url::Url::parse(&self.config.server).map_err(|e| {
            IssueError::InvalidSpec(format!(
                "invalid ACME server URL '{}': {}",
                self.config.server, e
            ))
        })?;
        if self.config.email.trim().is_empty() {
            return Err(IssueError::InvalidSpec(
                "ACME issuer requires a contact email".to_string(),
            ));
        }

        let session = self.session().await?;
        Ok(SetupOutcome {
            message: "The ACME account was registered with the ACME server".to_string(),
            acme_account_uri: Some(session.account_uri),
        })
    }

    async fn issue(&self, request: &IssueRequest) -> Result<IssuedBundle, IssueError> {
        let session = self.session().await?;
        let orchestrator =
            AcmeOrchestrator::new(Arc::clone(&session.api), self.solvers.clone(), &self.controller);

        match orchestrator.issue(request).await {
            Ok(chain_pem) => Ok(IssuedBundle {
                key_pem: request.key_pem.clone(),
                chain_pem,
                ca_pem: None,
            }),
            Err(e @ IssueError::AuthenticationFailed(_)) => {
                warn!(account = %session.account_uri, error = %e, "ACME account rejected");
                self.reject_session(&session).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::{AcmeApi, AuthorizationSnapshot, OrderSnapshot};
    use crate::issuer::MemoryJournal;
    use crate::pki::{self, NameSet};
    use crate::secrets::MemorySecretStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct UnusedApi;

    #[async_trait]
    impl AcmeApi for UnusedApi {
        async fn new_order(&self, _names: &[String]) -> Result<OrderSnapshot, AcmeError> {
            Err(AcmeError::Transient("unused".into()))
        }
        async fn order(&self, url: &str) -> Result<OrderSnapshot, AcmeError> {
            Err(AcmeError::UnknownOrder(url.into()))
        }
        async fn authorizations(
            &self,
            order_url: &str,
        ) -> Result<Vec<AuthorizationSnapshot>, AcmeError> {
            Err(AcmeError::UnknownOrder(order_url.into()))
        }
        async fn set_challenge_ready(&self, _: &str, _: &str) -> Result<(), AcmeError> {
            Ok(())
        }
        async fn finalize(&self, url: &str, _: &[u8]) -> Result<OrderSnapshot, AcmeError> {
            Err(AcmeError::UnknownOrder(url.into()))
        }
        async fn certificate(&self, _: &str) -> Result<Option<String>, AcmeError> {
            Ok(None)
        }
    }

    /// Answers every order with accountDoesNotExist
    struct GoneAccountApi;

    #[async_trait]
    impl AcmeApi for GoneAccountApi {
        async fn new_order(&self, _names: &[String]) -> Result<OrderSnapshot, AcmeError> {
            Err(AcmeError::Rejected {
                problem_type: Some("urn:ietf:params:acme:error:accountDoesNotExist".into()),
                detail: "account not found".into(),
                status: Some(400),
            })
        }
        async fn order(&self, url: &str) -> Result<OrderSnapshot, AcmeError> {
            Err(AcmeError::UnknownOrder(url.into()))
        }
        async fn authorizations(
            &self,
            order_url: &str,
        ) -> Result<Vec<AuthorizationSnapshot>, AcmeError> {
            Err(AcmeError::UnknownOrder(order_url.into()))
        }
        async fn set_challenge_ready(&self, _: &str, _: &str) -> Result<(), AcmeError> {
            Ok(())
        }
        async fn finalize(&self, url: &str, _: &[u8]) -> Result<OrderSnapshot, AcmeError> {
            Err(AcmeError::UnknownOrder(url.into()))
        }
        async fn certificate(&self, _: &str) -> Result<Option<String>, AcmeError> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        registrations: AtomicU32,
        restores: AtomicU32,
        fail_first: AtomicU32,
        restored_account_gone: bool,
    }

    #[async_trait]
    impl AcmeConnector for CountingConnector {
        async fn connect(
            &self,
            server: &str,
            _email: &str,
            credentials: Option<&str>,
        ) -> Result<AcmeSession, AcmeError> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(AcmeError::Transient("connection reset".into()));
            }
            let registered = credentials.is_none();
            if registered {
                self.registrations.fetch_add(1, Ordering::SeqCst);
            } else {
                self.restores.fetch_add(1, Ordering::SeqCst);
            }
            let api: Arc<dyn AcmeApi> = if !registered && self.restored_account_gone {
                Arc::new(GoneAccountApi)
            } else {
                Arc::new(UnusedApi)
            };
            Ok(AcmeSession {
                api,
                account_uri: format!("{}/acct/1", server),
                credentials_json: credentials.unwrap_or(r#"{"id":"acct-1"}"#).to_string(),
                registered,
            })
        }
    }

    fn backend(
        server: &str,
        secrets: Arc<MemorySecretStore>,
        connector: Arc<CountingConnector>,
    ) -> AcmeBackend {
        AcmeBackend::new(
            AcmeIssuerConfig {
                server: server.to_string(),
                email: "ops@example.com".to_string(),
                private_key_secret: "acme-account".to_string(),
            },
            ResourceKey::new("default", "acme-account"),
            secrets,
            connector,
            vec![],
            ControllerConfig::fast(),
        )
    }

    #[tokio::test]
    async fn test_setup_registers_and_stores_credentials() {
        let secrets = Arc::new(MemorySecretStore::new());
        let connector = Arc::new(CountingConnector::default());
        connector.fail_first.store(1, Ordering::SeqCst);

        let outcome = backend("https://acme.test/directory", secrets.clone(), connector.clone())
            .setup()
            .await
            .unwrap();
        assert_eq!(
            outcome.acme_account_uri.as_deref(),
            Some("https://acme.test/directory/acct/1")
        );
        assert_eq!(connector.registrations.load(Ordering::SeqCst), 1);

        let stored = secrets
            .get(&ResourceKey::new("default", "acme-account"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.get_str(ACME_CREDENTIALS), Some(r#"{"id":"acct-1"}"#));
        assert_eq!(
            stored.annotation(ANNOTATION_ACME_SERVER),
            Some("https://acme.test/directory")
        );

        // A fresh backend restores the stored account instead of registering
        let again = backend("https://acme.test/directory", secrets, connector.clone());
        again.setup().await.unwrap();
        again.setup().await.unwrap();
        assert_eq!(connector.registrations.load(Ordering::SeqCst), 1);
        assert_eq!(connector.restores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_change_registers_new_account() {
        let secrets = Arc::new(MemorySecretStore::new());
        let connector = Arc::new(CountingConnector::default());

        backend("https://staging.acme.test/directory", secrets.clone(), connector.clone())
            .setup()
            .await
            .unwrap();
        backend("https://acme.test/directory", secrets, connector.clone())
            .setup()
            .await
            .unwrap();
        assert_eq!(connector.registrations.load(Ordering::SeqCst), 2);
        assert_eq!(connector.restores.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deleted_account_is_registered_again() {
        let secrets = Arc::new(MemorySecretStore::new());
        let account_key = ResourceKey::new("default", "acme-account");
        secrets.insert(
            account_key.clone(),
            Secret::new()
                .with_data(ACME_CREDENTIALS, r#"{"id":"deleted"}"#)
                .with_annotation(ANNOTATION_ACME_SERVER, "https://acme.test/directory"),
        );
        let connector = Arc::new(CountingConnector {
            restored_account_gone: true,
            ..Default::default()
        });
        let backend = backend("https://acme.test/directory", secrets.clone(), connector.clone());

        let request = || IssueRequest {
            names: NameSet::from_spec("", &["a.example.com".to_string()]).unwrap(),
            key_pem: pki::generate_key().unwrap(),
            duration: std::time::Duration::from_secs(90 * 86400),
            journal: Arc::new(MemoryJournal::default()),
            deadline: Instant::now() + std::time::Duration::from_millis(200),
        };

        let err = backend.issue(&request()).await.unwrap_err();
        assert_eq!(err.reason(), "AuthenticationFailed");
        assert_eq!(connector.restores.load(Ordering::SeqCst), 1);
        assert_eq!(connector.registrations.load(Ordering::SeqCst), 0);

        // The next attempt registers instead of restoring the same account
        let _ = backend.issue(&request()).await;
        assert_eq!(connector.restores.load(Ordering::SeqCst), 1);
        assert_eq!(connector.registrations.load(Ordering::SeqCst), 1);
        let stored = secrets.get(&account_key).await.unwrap().unwrap();
        assert_eq!(stored.get_str(ACME_CREDENTIALS), Some(r#"{"id":"acct-1"}"#));
    }

    #[tokio::test]
    async fn test_invalid_server_url() {
        let err = backend(
            "not a url",
            Arc::new(MemorySecretStore::new()),
            Arc::new(CountingConnector::default()),
        )
        .setup()
        .await
        .unwrap_err();
        assert_eq!(err.reason(), "InvalidSpec");
    }
}
