//! ACME transport seam
//!
//! The orchestrator drives the protocol through [`AcmeApi`], which speaks
//! in plain snapshots so the state machine can be exercised without a CA.
//! [`InstantAcmeConnector`] is the production implementation: JWS signing,
//! nonces and directory discovery are handled by `instant-acme`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, Identifier, NewAccount, NewOrder, Order, Problem,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

/// Problem type the CA uses for rate limiting
pub const RATE_LIMITED_PROBLEM: &str = "urn:ietf:params:acme:error:rateLimited";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AcmeError {
    /// Terminal 4xx answer from the CA
    #[error("ACME server rejected the request: {detail}")]
    Rejected {
        problem_type: Option<String>,
        detail: String,
        status: Option<u16>,
    },

    #[error("ACME rate limit: {detail}")]
    RateLimited {
        detail: String,
        retry_after: Option<Duration>,
    },

    /// 5xx answers and transport failures
    #[error("ACME transport error: {0}")]
    Transient(String),

    #[error("unknown ACME order '{0}'")]
    UnknownOrder(String),

    #[error("ACME account error: {0}")]
    Credentials(String),
}

impl AcmeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AcmeError::Transient(_))
    }

    fn from_problem(problem: &Problem) -> Self {
        let detail = problem
            .detail
            .clone()
            .or_else(|| problem.r#type.clone())
            .unwrap_or_else(|| "no detail provided".to_string());
        let rate_limited = problem.status == Some(429)
            || problem.r#type.as_deref() == Some(RATE_LIMITED_PROBLEM);

        if rate_limited {
            AcmeError::RateLimited {
                retry_after: retry_after_hint(&detail, Utc::now()),
                detail,
            }
        } else if problem.status.is_some_and(|s| s >= 500) {
            AcmeError::Transient(detail)
        } else {
            AcmeError::Rejected {
                problem_type: problem.r#type.clone(),
                detail,
                status: problem.status,
            }
        }
    }
}

impl From<instant_acme::Error> for AcmeError {
    fn from(err: instant_acme::Error) -> Self {
        match err {
            instant_acme::Error::Api(problem) => AcmeError::from_problem(&problem),
            other => AcmeError::Transient(other.to_string()),
        }
    }
}

/// When a rate limit lifts, as stated in the problem detail
/// ("..., retry after 2025-01-02 03:04:05 UTC: see ...").
///
/// `instant-acme` does not surface response headers, so `Retry-After`
/// itself is not visible here.
fn retry_after_hint(detail: &str, now: DateTime<Utc>) -> Option<Duration> {
    let (_, rest) = detail.split_once("retry after ")?;
    let stamp = rest.get(..19)?;
    let at = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S").ok()?;
    DateTime::<Utc>::from_naive_utc_and_offset(at, Utc)
        .signed_duration_since(now)
        .to_std()
        .ok()
}

/// Render an ACME problem document attached to an object
fn problem_message(problem: &Problem) -> String {
    match (&problem.r#type, &problem.detail) {
        (Some(kind), Some(detail)) => format!("{} ({})", detail, kind),
        (None, Some(detail)) => detail.clone(),
        (Some(kind), None) => kind.clone(),
        (None, None) => "no detail provided".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    /// Statuses from which an interrupted attempt can continue
    pub fn is_resumable(self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Ready)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSnapshot {
    pub url: String,
    pub status: OrderStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    /// Expired, revoked or deactivated
    Gone,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    Http01,
    Dns01,
    TlsAlpn01,
    Other(String),
}

impl ChallengeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ChallengeKind::Http01 => "http-01",
            ChallengeKind::Dns01 => "dns-01",
            ChallengeKind::TlsAlpn01 => "tls-alpn-01",
            ChallengeKind::Other(kind) => kind,
        }
    }
}

impl std::fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeSnapshot {
    pub kind: ChallengeKind,
    pub url: String,
    pub token: String,
    /// Token bound to the account key thumbprint
    pub key_authorization: String,
    /// Base64url SHA-256 of the key authorization, for TXT records
    pub dns_value: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationSnapshot {
    pub name: String,
    pub status: AuthorizationStatus,
    pub challenges: Vec<ChallengeSnapshot>,
}

impl AuthorizationSnapshot {
    /// Server-provided reason for a failed authorization
    pub fn failure_reason(&self) -> Option<String> {
        self.challenges.iter().find_map(|c| c.error.clone())
    }
}

/// Order-level ACME operations for one registered account
#[async_trait]
pub trait AcmeApi: Send + Sync {
    async fn new_order(&self, names: &[String]) -> Result<OrderSnapshot, AcmeError>;

    /// Fetch the current state of an order
    async fn order(&self, url: &str) -> Result<OrderSnapshot, AcmeError>;

    async fn authorizations(&self, order_url: &str)
        -> Result<Vec<AuthorizationSnapshot>, AcmeError>;

    async fn set_challenge_ready(&self, order_url: &str, challenge_url: &str)
        -> Result<(), AcmeError>;

    async fn finalize(&self, order_url: &str, csr_der: &[u8]) -> Result<OrderSnapshot, AcmeError>;

    /// Download the chain of a valid order
    async fn certificate(&self, order_url: &str) -> Result<Option<String>, AcmeError>;

    /// Release any state held for an order
    fn forget(&self, _order_url: &str) {}
}

/// A connected account
#[derive(Clone)]
pub struct AcmeSession {
    pub api: Arc<dyn AcmeApi>,
    pub account_uri: String,
    /// Serialized credentials to store in the account secret
    pub credentials_json: String,
    /// A new account was registered by this connect
    pub registered: bool,
}

impl std::fmt::Debug for AcmeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeSession")
            .field("account_uri", &self.account_uri)
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}

/// Registers or restores ACME accounts
#[async_trait]
pub trait AcmeConnector: Send + Sync {
    /// Restore the account from `credentials`, or register a new one
    /// with `email` as contact when none are stored.
    async fn connect(
        &self,
        server: &str,
        email: &str,
        credentials: Option<&str>,
    ) -> Result<AcmeSession, AcmeError>;
}

/// [`AcmeConnector`] backed by `instant-acme`
#[derive(Debug, Default, Clone)]
pub struct InstantAcmeConnector;

impl InstantAcmeConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AcmeConnector for InstantAcmeConnector {
    async fn connect(
        &self,
        server: &str,
        email: &str,
        credentials: Option<&str>,
    ) -> Result<AcmeSession, AcmeError> {
        if let Some(json) = credentials {
            let parsed: AccountCredentials = serde_json::from_str(json).map_err(|e| {
                AcmeError::Credentials(format!("stored account credentials are invalid: {}", e))
            })?;
            let account = Account::from_credentials(parsed).await?;
            debug!(server = %server, account = %account.id(), "Restored ACME account");
            return Ok(AcmeSession {
                account_uri: account.id().to_string(),
                api: Arc::new(InstantAcmeApi::new(account)),
                credentials_json: json.to_string(),
                registered: false,
            });
        }

        let contact = format!("mailto:{}", email);
        let (account, creds) = Account::create(
            &NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            server,
            None,
        )
        .await?;
        let credentials_json = serde_json::to_string(&creds)
            .map_err(|e| AcmeError::Credentials(format!("failed to encode credentials: {}", e)))?;

        info!(server = %server, account = %account.id(), "Registered ACME account");
        Ok(AcmeSession {
            account_uri: account.id().to_string(),
            api: Arc::new(InstantAcmeApi::new(account)),
            credentials_json,
            registered: true,
        })
    }
}

/// [`AcmeApi`] over an `instant-acme` account.
///
/// `instant-acme` orders are stateful handles, so they are kept per URL
/// for the lifetime of an attempt and dropped by [`AcmeApi::forget`].
pub struct InstantAcmeApi {
    account: Account,
    orders: DashMap<String, Arc<Mutex<Order>>>,
}

impl InstantAcmeApi {
    pub fn new(account: Account) -> Self {
        Self {
            account,
            orders: DashMap::new(),
        }
    }

    async fn handle(&self, url: &str) -> Result<Arc<Mutex<Order>>, AcmeError> {
        if let Some(order) = self.orders.get(url) {
            return Ok(order.value().clone());
        }
        trace!(order = %url, "Loading ACME order");
        let order = self.account.order(url.to_string()).await?;
        let handle = Arc::new(Mutex::new(order));
        self.orders.insert(url.to_string(), Arc::clone(&handle));
        Ok(handle)
    }
}

fn order_snapshot(url: &str, order: &mut Order) -> OrderSnapshot {
    let state = order.state();
    let status = match state.status {
        instant_acme::OrderStatus::Pending => OrderStatus::Pending,
        instant_acme::OrderStatus::Ready => OrderStatus::Ready,
        instant_acme::OrderStatus::Processing => OrderStatus::Processing,
        instant_acme::OrderStatus::Valid => OrderStatus::Valid,
        #[allow(unreachable_patterns)]
        _ => OrderStatus::Invalid,
    };
    OrderSnapshot {
        url: url.to_string(),
        status,
        error: state.error.as_ref().map(problem_message),
    }
}

fn challenge_kind(kind: &instant_acme::ChallengeType) -> ChallengeKind {
    match kind {
        instant_acme::ChallengeType::Http01 => ChallengeKind::Http01,
        instant_acme::ChallengeType::Dns01 => ChallengeKind::Dns01,
        instant_acme::ChallengeType::TlsAlpn01 => ChallengeKind::TlsAlpn01,
        #[allow(unreachable_patterns)]
        other => ChallengeKind::Other(format!("{:?}", other)),
    }
}

#[async_trait]
impl AcmeApi for InstantAcmeApi {
    async fn new_order(&self, names: &[String]) -> Result<OrderSnapshot, AcmeError> {
        let identifiers: Vec<Identifier> =
            names.iter().map(|n| Identifier::Dns(n.clone())).collect();
        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;
        let url = order.url().to_string();
        let snapshot = order_snapshot(&url, &mut order);
        debug!(order = %url, names = ?names, "Created ACME order");
        self.orders.insert(url, Arc::new(Mutex::new(order)));
        Ok(snapshot)
    }

    async fn order(&self, url: &str) -> Result<OrderSnapshot, AcmeError> {
        let handle = self.handle(url).await?;
        let mut order = handle.lock().await;
        order.refresh().await?;
        Ok(order_snapshot(url, &mut order))
    }

    async fn authorizations(
        &self,
        order_url: &str,
    ) -> Result<Vec<AuthorizationSnapshot>, AcmeError> {
        let handle = self.handle(order_url).await?;
        let mut order = handle.lock().await;
        let authorizations = order.authorizations().await?;

        let mut snapshots = Vec::with_capacity(authorizations.len());
        for authz in authorizations {
            #[allow(unreachable_patterns)]
            let name = match &authz.identifier {
                Identifier::Dns(name) => name.clone(),
                other => format!("{:?}", other),
            };
            let status = match authz.status {
                instant_acme::AuthorizationStatus::Pending => AuthorizationStatus::Pending,
                instant_acme::AuthorizationStatus::Valid => AuthorizationStatus::Valid,
                instant_acme::AuthorizationStatus::Invalid => AuthorizationStatus::Invalid,
                #[allow(unreachable_patterns)]
                _ => AuthorizationStatus::Gone,
            };
            let challenges = authz
                .challenges
                .iter()
                .map(|ch| {
                    let key_auth = order.key_authorization(ch);
                    ChallengeSnapshot {
                        kind: challenge_kind(&ch.r#type),
                        url: ch.url.clone(),
                        token: ch.token.clone(),
                        key_authorization: key_auth.as_str().to_string(),
                        dns_value: key_auth.dns_value(),
                        error: ch.error.as_ref().map(problem_message),
                    }
                })
                .collect();
            snapshots.push(AuthorizationSnapshot {
                name,
                status,
                challenges,
            });
        }
        Ok(snapshots)
    }

    async fn set_challenge_ready(
        &self,
        order_url: &str,
        challenge_url: &str,
    ) -> Result<(), AcmeError> {
        let handle = self.handle(order_url).await?;
        let mut order = handle.lock().await;
        order.set_challenge_ready(challenge_url).await?;
        Ok(())
    }

    async fn finalize(&self, order_url: &str, csr_der: &[u8]) -> Result<OrderSnapshot, AcmeError> {
        let handle = self.handle(order_url).await?;
        let mut order = handle.lock().await;
        order.finalize(csr_der).await?;
        Ok(order_snapshot(order_url, &mut order))
    }

    async fn certificate(&self, order_url: &str) -> Result<Option<String>, AcmeError> {
        let handle = self.handle(order_url).await?;
        let mut order = handle.lock().await;
        Ok(order.certificate().await?)
    }

    fn forget(&self, order_url: &str) {
        self.orders.remove(order_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(kind: Option<&str>, status: Option<u16>) -> Problem {
        serde_json::from_value(serde_json::json!({
            "type": kind,
            "detail": "something happened",
            "status": status,
        }))
        .unwrap()
    }

    #[test]
    fn test_problem_mapping() {
        assert!(matches!(
            AcmeError::from_problem(&problem(Some(RATE_LIMITED_PROBLEM), Some(429))),
            AcmeError::RateLimited { .. }
        ));
        assert!(matches!(
            AcmeError::from_problem(&problem(None, Some(429))),
            AcmeError::RateLimited { .. }
        ));
        assert!(AcmeError::from_problem(&problem(
            Some("urn:ietf:params:acme:error:serverInternal"),
            Some(503)
        ))
        .is_transient());

        match AcmeError::from_problem(&problem(
            Some("urn:ietf:params:acme:error:rejectedIdentifier"),
            Some(400),
        )) {
            AcmeError::Rejected {
                problem_type,
                status,
                ..
            } => {
                assert_eq!(
                    problem_type.as_deref(),
                    Some("urn:ietf:params:acme:error:rejectedIdentifier")
                );
                assert_eq!(status, Some(400));
            }
            other => panic!("unexpected mapping {:?}", other),
        }
    }

    #[test]
    fn test_rate_limit_carries_stated_retry_time() {
        let now = DateTime::parse_from_rfc3339("2025-01-02T03:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let detail = "too many certificates (5) already issued for this exact set of \
                      identifiers in the last 168h0m0s, retry after 2025-01-02 03:04:05 UTC: \
                      see https://letsencrypt.org/docs/rate-limits/";
        assert_eq!(retry_after_hint(detail, now), Some(Duration::from_secs(245)));
        assert_eq!(retry_after_hint("too many new orders recently", now), None);
        assert_eq!(
            retry_after_hint("retry after 2025-01-01 00:00:00 UTC", now),
            None
        );

        let limited: Problem = serde_json::from_value(serde_json::json!({
            "type": RATE_LIMITED_PROBLEM,
            "detail": "too many new orders recently, retry after 2999-01-01 00:00:00 UTC",
            "status": 429,
        }))
        .unwrap();
        match AcmeError::from_problem(&limited) {
            AcmeError::RateLimited { retry_after, .. } => assert!(retry_after.is_some()),
            other => panic!("unexpected mapping {:?}", other),
        }
    }

    #[test]
    fn test_authorization_failure_reason() {
        let authz = AuthorizationSnapshot {
            name: "a.example.com".into(),
            status: AuthorizationStatus::Invalid,
            challenges: vec![ChallengeSnapshot {
                kind: ChallengeKind::Http01,
                url: "https://acme.test/chall/1".into(),
                token: "tok".into(),
                key_authorization: "tok.thumb".into(),
                dns_value: "dns".into(),
                error: Some("connection refused".into()),
            }],
        };
        assert_eq!(authz.failure_reason().as_deref(), Some("connection refused"));
        assert!(OrderStatus::Ready.is_resumable());
        assert!(!OrderStatus::Processing.is_resumable());
    }
}
