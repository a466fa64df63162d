//! ACME protocol support
//!
//! - [`client`]: transport seam and the `instant-acme` implementation
//! - [`challenge`]: challenge solvers and the HTTP-01 token map
//! - [`orchestrator`]: the order/authorization/finalize state machine

pub mod challenge;
pub mod client;
pub mod orchestrator;

pub use challenge::{
    ChallengeManager, ChallengeRequest, ChallengeSolver, Http01Solver, SolverError,
    ACME_CHALLENGE_PREFIX,
};
pub use client::{
    AcmeApi, AcmeConnector, AcmeError, AcmeSession, AuthorizationSnapshot, AuthorizationStatus,
    ChallengeKind, ChallengeSnapshot, InstantAcmeApi, InstantAcmeConnector, OrderSnapshot,
    OrderStatus,
};
pub use orchestrator::AcmeOrchestrator;
