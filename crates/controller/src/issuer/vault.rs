//! Secrets-engine (Vault PKI) backend
//!
//! Authenticates with a static token or an app-role login, then POSTs a
//! CSR to the configured signing path:
//!
//! ```text
//! POST /v1/<path>
//! X-Vault-Token: <token>
//! {"common_name": "...", "alt_names": "a,b", "ttl": "7776000s",
//!  "csr": "-----BEGIN CERTIFICATE REQUEST-----...", "exclude_cn_from_sans": "true"}
//! ```
//!
//! The response's `data.certificate` followed by `data.ca_chain` (or
//! `data.issuing_ca`) forms the stored chain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, trace};
use url::Url;

use tessera_common::{ResourceKey, RetryPolicy};
use tessera_config::{ControllerConfig, VaultAuth, VaultIssuerConfig};

use super::{
    load_secret, retry_transient, IssueError, IssueRequest, IssuedBundle, IssuerBackend,
    SetupOutcome,
};
use crate::pki;
use crate::secrets::{SecretStore, VAULT_ROLE_ID, VAULT_SECRET_ID, VAULT_TOKEN};

const TOKEN_HEADER: &str = "X-Vault-Token";

#[derive(Debug, Clone)]
enum AuthMethod {
    Token { secret: ResourceKey },
    AppRole { secret: ResourceKey, mount: String },
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    auth: Option<LoginAuth>,
}

#[derive(Debug, Deserialize)]
struct LoginAuth {
    client_token: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    data: Option<SignData>,
}

#[derive(Debug, Deserialize)]
struct SignData {
    certificate: String,
    #[serde(default)]
    issuing_ca: Option<String>,
    #[serde(default)]
    ca_chain: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

pub struct VaultBackend {
    base: Url,
    path: String,
    auth: AuthMethod,
    secrets: Arc<dyn SecretStore>,
    http: reqwest::Client,
    retry: RetryPolicy,
    setup_timeout: Duration,
}

impl VaultBackend {
    pub fn new(
        issuer: &ResourceKey,
        config: &VaultIssuerConfig,
        secrets: Arc<dyn SecretStore>,
        http: reqwest::Client,
        controller: &ControllerConfig,
    ) -> Result<Self, IssueError> {
        let mut server = config.server.trim().to_string();
        if !server.ends_with('/') {
            server.push('/');
        }
        let base = Url::parse(&server).map_err(|e| {
            IssueError::InvalidSpec(format!("invalid Vault server '{}': {}", config.server, e))
        })?;

        let path = config.path.trim_matches('/').to_string();
        if path.is_empty() {
            return Err(IssueError::InvalidSpec(
                "Vault signing path must not be empty".to_string(),
            ));
        }

        let auth = match &config.auth {
            VaultAuth::Token { secret_name } => AuthMethod::Token {
                secret: issuer.sibling(secret_name.clone()),
            },
            VaultAuth::AppRole { secret_name, path } => AuthMethod::AppRole {
                secret: issuer.sibling(secret_name.clone()),
                mount: path.trim_matches('/').to_string(),
            },
        };

        trace!(issuer = %issuer, server = %base, path = %path, "Created Vault backend");

        Ok(Self {
            base,
            path,
            auth,
            secrets,
            http,
            retry: controller.transient_retry,
            setup_timeout: controller.attempt_timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, IssueError> {
        self.base
            .join(&format!("v1/{}", path))
            .map_err(|e| IssueError::InvalidSpec(format!("invalid Vault path '{}': {}", path, e)))
    }

    /// Read the credentials secret and produce a client token
    async fn token(&self, deadline: Instant) -> Result<String, IssueError> {
        match &self.auth {
            AuthMethod::Token { secret } => {
                let secret_data = load_secret(self.secrets.as_ref(), secret).await?;
                secret_data
                    .get_str(VAULT_TOKEN)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        IssueError::AuthenticationFailed(format!(
                            "no '{}' entry in secret '{}'",
                            VAULT_TOKEN, secret
                        ))
                    })
            }
            AuthMethod::AppRole { secret, mount } => {
                let secret_data = load_secret(self.secrets.as_ref(), secret).await?;
                let field = |name: &str| {
                    secret_data.get_str(name).map(str::to_string).ok_or_else(|| {
                        IssueError::AuthenticationFailed(format!(
                            "no '{}' entry in secret '{}'",
                            name, secret
                        ))
                    })
                };
                let role_id = field(VAULT_ROLE_ID)?;
                let secret_id = field(VAULT_SECRET_ID)?;

                retry_transient(&self.retry, deadline, "vault app-role login", || {
                    self.login(mount, &role_id, &secret_id)
                })
                .await
            }
        }
    }

    async fn login(&self, mount: &str, role_id: &str, secret_id: &str) -> Result<String, IssueError> {
        let url = self.endpoint(&format!("auth/{}/login", mount))?;
        let response = self
            .http
            .post(url)
            .json(&json!({ "role_id": role_id, "secret_id": secret_id }))
            .send()
            .await
            .map_err(transport_error)?;
        let body = check_status(response).await?;

        let login: LoginResponse = serde_json::from_slice(&body).map_err(|e| {
            IssueError::MalformedResponse(format!("unable to decode login response: {}", e))
        })?;
        let token = login
            .auth
            .map(|a| a.client_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                IssueError::MalformedResponse("login response has no client token".to_string())
            })?;

        debug!(mount = mount, "Obtained Vault token via app-role");
        Ok(token)
    }

    async fn lookup_self(&self, token: &str) -> Result<(), IssueError> {
        let url = self.endpoint("auth/token/lookup-self")?;
        let response = self
            .http
            .get(url)
            .header(TOKEN_HEADER, token)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        Ok(())
    }

    async fn sign(
        &self,
        token: &str,
        request: &IssueRequest,
        csr_pem: &str,
    ) -> Result<IssuedBundle, IssueError> {
        let url = self.endpoint(&self.path)?;
        let body = json!({
            "common_name": request.names.common_name(),
            "alt_names": request.names.names().join(","),
            "ttl": format!("{}s", request.duration.as_secs()),
            "csr": csr_pem,
            "exclude_cn_from_sans": "true",
        });

        let response = self
            .http
            .post(url)
            .header(TOKEN_HEADER, token)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let body = check_status(response).await?;

        let parsed: SignResponse = serde_json::from_slice(&body).map_err(|e| {
            IssueError::MalformedResponse(format!("unable to decode JSON payload: {}", e))
        })?;
        let data = parsed
            .data
            .ok_or_else(|| IssueError::MalformedResponse("response has no data".to_string()))?;

        assemble_bundle(&request.key_pem, data)
    }
}

/// Leaf first, then the CA chain; the issuing CA alone when no chain is given
fn assemble_bundle(key_pem: &str, data: SignData) -> Result<IssuedBundle, IssueError> {
    let certificate = data.certificate.trim();
    pki::parse_certificate_chain(certificate)
        .map_err(|e| IssueError::MalformedResponse(format!("unable to parse certificate: {}", e)))?;

    let cas: Vec<String> = if data.ca_chain.is_empty() {
        data.issuing_ca.into_iter().collect()
    } else {
        data.ca_chain
    };

    let mut chain = String::from(certificate);
    chain.push('\n');
    for ca in cas.iter().map(|c| c.trim()).filter(|c| !c.is_empty()) {
        chain.push_str(ca);
        chain.push('\n');
    }

    Ok(IssuedBundle {
        key_pem: key_pem.to_string(),
        chain_pem: chain,
        ca_pem: cas.last().map(|c| c.trim().to_string()),
    })
}

fn transport_error(err: reqwest::Error) -> IssueError {
    IssueError::NetworkTransient(format!("error calling Vault server: {}", err))
}

/// Map HTTP status to the failure taxonomy; returns the body on success
async fn check_status(response: reqwest::Response) -> Result<Vec<u8>, IssueError> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response
        .bytes()
        .await
        .map_err(transport_error)?
        .to_vec();

    if status.is_success() {
        return Ok(body);
    }

    let errors = serde_json::from_slice::<ErrorResponse>(&body)
        .unwrap_or_default()
        .errors
        .join("; ");
    let message = if errors.is_empty() {
        format!("Vault returned {}", status)
    } else {
        format!("Vault returned {}: {}", status, errors)
    };

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            IssueError::AuthenticationFailed(message)
        }
        StatusCode::TOO_MANY_REQUESTS => IssueError::RateLimited {
            message,
            retry_after,
        },
        s if s.is_server_error() => IssueError::NetworkTransient(message),
        _ => IssueError::InvalidSpec(message),
    })
}

#[async_trait]
impl IssuerBackend for VaultBackend {
    fn kind(&self) -> &'static str {
        "vault"
    }

    async fn setup(&self) -> Result<SetupOutcome, IssueError> {
        let deadline = Instant::now() + self.setup_timeout;
        let token = self.token(deadline).await?;

        match &self.auth {
            AuthMethod::Token { .. } => {
                retry_transient(&self.retry, deadline, "vault token lookup", || {
                    self.lookup_self(&token)
                })
                .await?;
            }
            // A successful login already proved the credentials
            AuthMethod::AppRole { .. } => {}
        }

        info!(server = %self.base, "Vault credentials verified");
        Ok(SetupOutcome::ready(format!(
            "Vault at {} accepted credentials",
            self.base
        )))
    }

    async fn issue(&self, request: &IssueRequest) -> Result<IssuedBundle, IssueError> {
        let csr = pki::build_csr(&request.key_pem, &request.names)?;
        let token = self.token(request.deadline).await?;

        debug!(
            common_name = request.names.common_name(),
            alt_names = ?request.names.names(),
            path = %self.path,
            "Vault certificate request"
        );

        retry_transient(&self.retry, request.deadline, "vault sign", || {
            self.sign(&token, request, &csr.pem)
        })
        .await
    }
}
