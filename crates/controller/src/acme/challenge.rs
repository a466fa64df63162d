//! ACME challenge solvers
//!
//! Solvers make a challenge response visible to the CA. Serving the
//! HTTP-01 token path or publishing DNS records is the job of whatever
//! front end is deployed; this module keeps the token map it reads from.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace};

use super::client::{ChallengeKind, ChallengeSnapshot};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SolverError {
    #[error("solver '{solver}' failed to present challenge for {name}: {message}")]
    Present {
        solver: String,
        name: String,
        message: String,
    },

    #[error("solver '{solver}' does not handle {kind} challenges")]
    Unsupported { solver: String, kind: String },
}

/// One challenge handed to a solver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    /// Name being validated
    pub name: String,
    pub kind: ChallengeKind,
    pub token: String,
    pub key_authorization: String,
    pub dns_value: String,
}

impl ChallengeRequest {
    pub fn new(name: &str, challenge: &ChallengeSnapshot) -> Self {
        Self {
            name: name.to_string(),
            kind: challenge.kind.clone(),
            token: challenge.token.clone(),
            key_authorization: challenge.key_authorization.clone(),
            dns_value: challenge.dns_value.clone(),
        }
    }

    /// TXT record name for dns-01
    pub fn dns_record_name(&self) -> String {
        format!("_acme-challenge.{}", self.name.trim_start_matches("*."))
    }
}

#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, kind: &ChallengeKind, dns_name: &str) -> bool;

    async fn present(&self, request: &ChallengeRequest) -> Result<(), SolverError>;

    /// Undo `present`; must tolerate challenges that were never presented
    async fn cleanup(&self, request: &ChallengeRequest);
}

/// Pending HTTP-01 challenges, keyed by token.
///
/// Clones share the same map, so the HTTP front end and the solver can
/// hold separate handles.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    challenges: Arc<DashMap<String, String>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_challenge(&self, token: &str, key_authorization: &str) {
        debug!(token = %token, "Registering ACME HTTP-01 challenge");
        self.challenges
            .insert(token.to_string(), key_authorization.to_string());
    }

    pub fn remove_challenge(&self, token: &str) {
        if self.challenges.remove(token).is_some() {
            debug!(token = %token, "Removed ACME challenge");
        }
    }

    /// Key authorization to serve for `token`
    pub fn get_response(&self, token: &str) -> Option<String> {
        let result = self.challenges.get(token).map(|v| v.clone());
        trace!(token = %token, found = result.is_some(), "ACME challenge lookup");
        result
    }

    /// Token part of a challenge request path
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    pub fn pending_count(&self) -> usize {
        self.challenges.len()
    }
}

/// Solver that publishes HTTP-01 responses through a [`ChallengeManager`]
#[derive(Debug, Clone, Default)]
pub struct Http01Solver {
    manager: ChallengeManager,
}

impl Http01Solver {
    pub fn new(manager: ChallengeManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &ChallengeManager {
        &self.manager
    }
}

#[async_trait]
impl ChallengeSolver for Http01Solver {
    fn name(&self) -> &str {
        "http-01"
    }

    // Wildcard names can only be validated over DNS
    fn supports(&self, kind: &ChallengeKind, dns_name: &str) -> bool {
        *kind == ChallengeKind::Http01 && !dns_name.starts_with("*.")
    }

    async fn present(&self, request: &ChallengeRequest) -> Result<(), SolverError> {
        if !self.supports(&request.kind, &request.name) {
            return Err(SolverError::Unsupported {
                solver: self.name().to_string(),
                kind: request.kind.to_string(),
            });
        }
        self.manager
            .add_challenge(&request.token, &request.key_authorization);
        Ok(())
    }

    async fn cleanup(&self, request: &ChallengeRequest) {
        self.manager.remove_challenge(&request.token);
    }
}
