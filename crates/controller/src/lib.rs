//! Tessera Controller Library
//!
//! A certificate issuance and renewal engine. Declared certificates are
//! kept valid by reconciling them against pluggable issuer backends:
//!
//! - **ACME**: order, authorization and challenge handling against an
//!   RFC 8555 server, with resumable orders
//! - **CA**: local signing with a stored CA key pair
//! - **Self-signed**: each certificate signs itself
//! - **Vault**: signing through a PKI secrets-engine sign endpoint
//!
//! The [`Controller`] runs bounded worker pools over per-kind work queues
//! and serializes work on each certificate.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tessera_controller::{BackendFactory, Context, Controller, InstantAcmeConnector};
//! use tessera_controller::{MemoryResourceStore, MemorySecretStore, TracingRecorder};
//!
//! let config = tessera_config::Config::from_file("tessera.kdl")?;
//! let store = Arc::new(MemoryResourceStore::new());
//! store.apply_declaration(config.issuers, config.certificates);
//! let secrets = Arc::new(MemorySecretStore::new());
//!
//! let controller = Controller::new(Context {
//!     store,
//!     secrets: secrets.clone(),
//!     backends: Arc::new(BackendFactory::new(
//!         secrets,
//!         Arc::new(InstantAcmeConnector::new()),
//!         vec![],
//!         config.controller.clone(),
//!     )),
//!     recorder: Arc::new(TracingRecorder),
//!     config: config.controller,
//! });
//! controller.run(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! }).await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod controller;
pub mod events;
pub mod issuer;
pub mod pki;
pub mod queue;
pub mod reconcile;
pub mod scheduler;
pub mod secrets;
pub mod store;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Runtime
pub use controller::Controller;
pub use queue::WorkQueue;
pub use reconcile::{Action, CertificateReconciler, Context, IssuerReconciler, ReconcileError};

// Backends
pub use issuer::{
    BackendFactory, BackendProvider, IssueError, IssueRequest, IssuedBundle, IssuerBackend,
    OrderJournal, RetryClass, SetupOutcome,
};

// ACME
pub use acme::{AcmeConnector, ChallengeManager, ChallengeSolver, Http01Solver, InstantAcmeConnector};

// Collaborators
pub use events::{EventRecorder, EventType, MemoryRecorder, TracingRecorder};
pub use secrets::{FileSecretStore, MemorySecretStore, Secret, SecretStore};
pub use store::{MemoryResourceStore, ResourceStore};

// Certificate material
pub use pki::NameSet;
