//! Issuer reconciler: validates backend configuration, runs the one-time
//! bootstrap and publishes readiness for the certificate reconciler.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use tessera_common::{ConditionStatus, ResourceKey};
use tessera_config::Issuer;

use super::{Action, Context, ReconcileError, REASON_READY};
use crate::events::{EventType, ObjectRef, REASON_ERR_ISSUER_SETUP, REASON_ISSUER_READY};
use crate::issuer::{IssueError, SetupOutcome};
use crate::store::StoreError;

pub struct IssuerReconciler {
    ctx: Arc<Context>,
    /// Consecutive setup failures per issuer
    failures: DashMap<ResourceKey, u32>,
}

impl IssuerReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            failures: DashMap::new(),
        }
    }

    pub async fn reconcile(&self, key: &ResourceKey) -> Result<Action, ReconcileError> {
        let Some(issuer) = self.ctx.store.get_issuer(key).await? else {
            trace!(issuer = %key, "Issuer no longer exists");
            self.ctx.backends.forget(key);
            self.failures.remove(key);
            return Ok(Action::await_change());
        };

        let setup = match self.ctx.backends.backend_for(&issuer) {
            Ok(backend) => {
                match tokio::time::timeout(self.ctx.config.attempt_timeout, backend.setup()).await
                {
                    Ok(result) => result,
                    Err(_) => Err(IssueError::NetworkTransient(format!(
                        "{} issuer setup timed out",
                        backend.kind()
                    ))),
                }
            }
            Err(e) => Err(e),
        };

        match setup {
            Ok(outcome) => self.ready(&issuer, outcome).await,
            Err(e) => self.not_ready(&issuer, e).await,
        }
    }

    async fn write_status(
        &self,
        issuer: &Issuer,
        status: tessera_config::IssuerStatus,
    ) -> Result<(), ReconcileError> {
        match self
            .ctx
            .store
            .update_issuer_status(&issuer.key, issuer.generation, status)
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict { .. }) | Err(StoreError::NotFound { .. }) => {
                debug!(issuer = %issuer.key, "Issuer changed while reconciling");
                Ok(())
            }
        }
    }

    async fn ready(&self, issuer: &Issuer, outcome: SetupOutcome) -> Result<Action, ReconcileError> {
        self.failures.remove(&issuer.key);
        let was_ready = issuer.is_ready();

        let status = issuer
            .status
            .with_ready(ConditionStatus::True, REASON_READY, &outcome.message, Utc::now())
            .with_acme_account_uri(
                outcome
                    .acme_account_uri
                    .or_else(|| issuer.status.acme_account_uri.clone()),
            );
        self.write_status(issuer, status).await?;

        if !was_ready {
            info!(
                issuer = %issuer.key,
                kind = issuer.spec.backend.kind_name(),
                message = %outcome.message,
                "Issuer ready"
            );
            self.ctx.recorder.record(
                ObjectRef::issuer(&issuer.key),
                EventType::Normal,
                REASON_ISSUER_READY,
                &outcome.message,
            );
        }
        Ok(Action::requeue(self.ctx.config.issuer_resync))
    }

    async fn not_ready(&self, issuer: &Issuer, err: IssueError) -> Result<Action, ReconcileError> {
        let attempts = {
            let mut entry = self.failures.entry(issuer.key.clone()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        let delay = self
            .ctx
            .config
            .issuer_backoff
            .delay_for(attempts.saturating_sub(1));

        warn!(
            issuer = %issuer.key,
            reason = err.reason(),
            error = %err,
            attempts = attempts,
            retry_in_ms = delay.as_millis() as u64,
            "Issuer setup failed"
        );
        self.ctx.recorder.record(
            ObjectRef::issuer(&issuer.key),
            EventType::Warning,
            REASON_ERR_ISSUER_SETUP,
            &format!("Error initializing issuer: {}", err),
        );

        let status = issuer.status.with_ready(
            ConditionStatus::False,
            err.reason(),
            &err.to_string(),
            Utc::now(),
        );
        self.write_status(issuer, status).await?;
        Ok(Action::requeue(delay))
    }
}
