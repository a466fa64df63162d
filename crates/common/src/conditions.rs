//! Status conditions shared by Issuer and Certificate resources.
//!
//! Conditions are values: updating a condition list produces a new list,
//! leaving the original untouched. Reconcilers compute the next status
//! and hand it to the store's single status-writer path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition type. Only `Ready` is tracked today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConditionType {
    #[default]
    Ready,
}

/// Tri-state condition status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A single observed condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionType,
    pub status: ConditionStatus,
    /// Machine-readable CamelCase reason
    pub reason: String,
    /// Human-readable detail
    pub message: String,
    /// When `status` last changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn ready(
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: ConditionType::Ready,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
        }
    }
}

/// Return a new condition list with `condition` applied.
///
/// The transition time of an existing condition of the same type is
/// preserved when its status does not change.
pub fn with_condition(conditions: &[Condition], mut condition: Condition) -> Vec<Condition> {
    let mut next: Vec<Condition> = Vec::with_capacity(conditions.len() + 1);
    let mut replaced = false;

    for existing in conditions {
        if existing.kind == condition.kind {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            next.push(condition.clone());
            replaced = true;
        } else {
            next.push(existing.clone());
        }
    }

    if !replaced {
        next.push(condition);
    }
    next
}

/// Find a condition of the given type
pub fn find_condition(conditions: &[Condition], kind: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.kind == kind)
}

/// Status of the Ready condition, `Unknown` when absent
pub fn ready_status(conditions: &[Condition]) -> ConditionStatus {
    find_condition(conditions, ConditionType::Ready)
        .map(|c| c.status)
        .unwrap_or_default()
}
