use async_trait::async_trait;
use tracing::debug;

use super::{IssueError, IssueRequest, IssuedBundle, IssuerBackend, SetupOutcome};
use crate::pki;

/// Signs every certificate with its own key
#[derive(Debug, Default)]
pub struct SelfSignedBackend;

impl SelfSignedBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IssuerBackend for SelfSignedBackend {
    fn kind(&self) -> &'static str {
        "self-signed"
    }

    async fn setup(&self) -> Result<SetupOutcome, IssueError> {
        Ok(SetupOutcome::ready("Self-signed issuer ready"))
    }

    async fn issue(&self, request: &IssueRequest) -> Result<IssuedBundle, IssueError> {
        let cert = pki::self_sign(&request.key_pem, &request.names, request.duration)?;
        debug!(
            common_name = request.names.common_name(),
            "Self-signed certificate"
        );
        Ok(IssuedBundle {
            key_pem: request.key_pem.clone(),
            chain_pem: cert.clone(),
            ca_pem: Some(cert),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::MemoryJournal;
    use crate::pki::NameSet;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_issue_covers_requested_names() {
        let backend = SelfSignedBackend::new();
        backend.setup().await.unwrap();

        let names = NameSet::from_spec(
            "",
            &["a.example.com".to_string(), "b.example.com".to_string()],
        )
        .unwrap();
        let request = IssueRequest {
            names: names.clone(),
            key_pem: pki::generate_key().unwrap(),
            duration: Duration::from_secs(7 * 86400),
            journal: Arc::new(MemoryJournal::default()),
            deadline: tokio::time::Instant::now() + Duration::from_secs(10),
        };

        let bundle = backend.issue(&request).await.unwrap();
        let info = pki::parse_certificate_chain(&bundle.chain_pem).unwrap();
        assert!(names.matches(&info.names()));
        assert_eq!(info.common_name.as_deref(), Some("a.example.com"));
        pki::verify_key_matches(&bundle.key_pem, &info).unwrap();
    }
}
