//! Tessera Common
//!
//! Types shared by the configuration and controller crates: resource
//! identifiers, status conditions, and retry policies.

pub mod conditions;
pub mod ids;
pub mod retry;

pub use conditions::{
    find_condition, ready_status, with_condition, Condition, ConditionStatus, ConditionType,
};
pub use ids::{IssuerKind, IssuerRef, ResourceKey};
pub use retry::{Backoff, RetryPolicy};
