//! Internal CA backend: signs CSRs with a locally held CA key

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tessera_common::ResourceKey;

use super::{load_secret, IssueError, IssueRequest, IssuedBundle, IssuerBackend, SetupOutcome};
use crate::pki;
use crate::secrets::{SecretStore, TLS_CRT, TLS_KEY};

pub struct CaBackend {
    secret: ResourceKey,
    secrets: Arc<dyn SecretStore>,
}

impl CaBackend {
    pub fn new(secret: ResourceKey, secrets: Arc<dyn SecretStore>) -> Self {
        Self { secret, secrets }
    }

    /// Load and check the CA pair: `(cert_pem, key_pem)`
    async fn load_ca(&self) -> Result<(String, String), IssueError> {
        let secret = load_secret(self.secrets.as_ref(), &self.secret).await?;
        let missing = |field: &str| {
            IssueError::BackendUnready(format!(
                "CA secret '{}' has no '{}' entry",
                self.secret, field
            ))
        };
        let cert = secret.get_str(TLS_CRT).ok_or_else(|| missing(TLS_CRT))?;
        let key = secret.get_str(TLS_KEY).ok_or_else(|| missing(TLS_KEY))?;

        let info = pki::parse_certificate_chain(cert).map_err(|e| {
            IssueError::BackendUnready(format!("CA secret '{}': {}", self.secret, e))
        })?;
        pki::verify_key_matches(key, &info).map_err(|e| {
            IssueError::BackendUnready(format!("CA secret '{}': {}", self.secret, e))
        })?;

        Ok((cert.to_string(), key.to_string()))
    }
}

#[async_trait]
impl IssuerBackend for CaBackend {
    fn kind(&self) -> &'static str {
        "ca"
    }

    async fn setup(&self) -> Result<SetupOutcome, IssueError> {
        self.load_ca().await?;
        Ok(SetupOutcome::ready(format!(
            "Signing CA loaded from secret '{}'",
            self.secret
        )))
    }

    async fn issue(&self, request: &IssueRequest) -> Result<IssuedBundle, IssueError> {
        let (ca_cert, ca_key) = self.load_ca().await?;
        let csr = pki::build_csr(&request.key_pem, &request.names)?;
        let leaf = pki::sign_with_ca(&csr.pem, &ca_cert, &ca_key, request.duration)?;

        debug!(
            common_name = request.names.common_name(),
            ca_secret = %self.secret,
            "Signed certificate with CA"
        );

        // Stored PEM comes back trimmed; every block ends with a newline
        let ca_pem = format!("{}\n", ca_cert.trim_end());
        let mut chain = leaf;
        if !chain.ends_with('\n') {
            chain.push('\n');
        }
        chain.push_str(&ca_pem);

        Ok(IssuedBundle {
            key_pem: request.key_pem.clone(),
            chain_pem: chain,
            ca_pem: Some(ca_pem),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::MemoryJournal;
    use crate::pki::NameSet;
    use crate::secrets::{MemorySecretStore, Secret};
    use std::time::Duration;

    fn request(names: &[&str]) -> IssueRequest {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        IssueRequest {
            names: NameSet::from_spec("", &names).unwrap(),
            key_pem: pki::generate_key().unwrap(),
            duration: Duration::from_secs(30 * 86400),
            journal: Arc::new(MemoryJournal::default()),
            deadline: tokio::time::Instant::now() + Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_missing_secret_is_unready() {
        let backend = CaBackend::new(
            ResourceKey::new("default", "ca-key-pair"),
            Arc::new(MemorySecretStore::new()),
        );
        let err = backend.setup().await.unwrap_err();
        assert_eq!(err.reason(), "IssuerNotReady");
    }

    #[tokio::test]
    async fn test_mismatched_ca_pair_is_unready() {
        let (ca_cert, _) = pki::generate_ca("Test Root", Duration::from_secs(86400)).unwrap();
        let other_key = pki::generate_key().unwrap();
        let store = MemorySecretStore::new();
        let key = ResourceKey::new("default", "ca-key-pair");
        store.insert(
            key.clone(),
            Secret::new()
                .with_data(TLS_CRT, ca_cert)
                .with_data(TLS_KEY, other_key),
        );

        let backend = CaBackend::new(key, Arc::new(store));
        assert!(matches!(
            backend.setup().await,
            Err(IssueError::BackendUnready(_))
        ));
    }

    #[tokio::test]
    async fn test_issue_returns_leaf_then_ca() {
        let (ca_cert, ca_key) =
            pki::generate_ca("Test Root", Duration::from_secs(365 * 86400)).unwrap();
        let store = MemorySecretStore::new();
        let key = ResourceKey::new("default", "ca-key-pair");
        store.insert(
            key.clone(),
            Secret::new()
                .with_data(TLS_CRT, ca_cert.clone())
                .with_data(TLS_KEY, ca_key),
        );

        let backend = CaBackend::new(key, Arc::new(store));
        backend.setup().await.unwrap();

        let request = request(&["api.internal", "www.api.internal"]);
        let bundle = backend.issue(&request).await.unwrap();
        let info = pki::parse_certificate_chain(&bundle.chain_pem).unwrap();

        assert_eq!(info.chain_len, 2);
        assert_eq!(info.issuer_common_name.as_deref(), Some("Test Root"));
        assert!(request.names.matches(&info.names()));
        let ca_pem = bundle.ca_pem.as_deref().unwrap();
        assert_eq!(ca_pem.trim_end(), ca_cert.trim_end());
        assert!(ca_pem.ends_with("-----END CERTIFICATE-----\n"));
        assert!(bundle.chain_pem.ends_with(ca_pem));
        pki::verify_key_matches(&bundle.key_pem, &info).unwrap();
    }
}
