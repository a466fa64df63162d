//! Reconcilers
//!
//! A reconciler reads the declared state of one resource, compares it with
//! what is observed, acts, writes status, and returns an [`Action`] telling
//! the controller when to look at the resource again.

mod certificate;
mod issuer;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use tessera_config::ControllerConfig;

use crate::events::EventRecorder;
use crate::issuer::BackendProvider;
use crate::secrets::{SecretStore, SecretStoreError};
use crate::store::{ResourceStore, StoreError};

pub use certificate::{CertificateReconciler, StatusOrderJournal};
pub use issuer::IssuerReconciler;

/// Ready reason of an up-to-date certificate or a usable issuer
pub const REASON_READY: &str = "Ready";

/// What the controller should do with a key after reconciling it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Action {
    pub requeue_after: Option<Duration>,
}

impl Action {
    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    /// Wait for the next change notification
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }
}

/// Failure of the reconciler itself, as opposed to a failed issuance
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("resource store: {0}")]
    Store(#[from] StoreError),

    #[error("secret store: {0}")]
    Secrets(#[from] SecretStoreError),
}

/// Collaborators shared by the reconcilers
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn ResourceStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub backends: Arc<dyn BackendProvider>,
    pub recorder: Arc<dyn EventRecorder>,
    pub config: ControllerConfig,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
