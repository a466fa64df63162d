//! Operator-facing event signals
//!
//! Warnings such as a backend shortening the requested duration are not
//! failures; they are recorded against the resource and issuance goes on.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use tessera_common::ResourceKey;

use crate::store::ResourceKind;

/// The backend issued a certificate shorter than requested
pub const REASON_WARN_CERTIFICATE_DURATION: &str = "WarnCertificateDuration";
/// renew-before was not shorter than the duration and has been reduced
pub const REASON_WARN_SCHEDULE_MODIFIED: &str = "WarnScheduleModified";
pub const REASON_ERR_ISSUE_CERT: &str = "ErrIssueCert";
pub const REASON_CERT_ISSUE_SUCCESS: &str = "CertIssueSuccess";
pub const REASON_ISSUER_READY: &str = "IssuerReady";
pub const REASON_ERR_ISSUER_SETUP: &str = "ErrIssuerSetup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Reference to the resource an event is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    pub kind: ResourceKind,
    pub key: ResourceKey,
}

impl ObjectRef {
    pub fn certificate(key: &ResourceKey) -> Self {
        Self {
            kind: ResourceKind::Certificate,
            key: key.clone(),
        }
    }

    pub fn issuer(key: &ResourceKey) -> Self {
        Self {
            kind: ResourceKind::Issuer,
            key: key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: Uuid,
    pub object: ObjectRef,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

pub trait EventRecorder: Send + Sync {
    fn record(&self, object: ObjectRef, event_type: EventType, reason: &str, message: &str);
}

/// Records events as structured log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl EventRecorder for TracingRecorder {
    fn record(&self, object: ObjectRef, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => info!(
                kind = %object.kind,
                object = %object.key,
                reason = reason,
                "{}",
                message
            ),
            EventType::Warning => warn!(
                kind = %object.kind,
                object = %object.key,
                reason = reason,
                "{}",
                message
            ),
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events for one object with the given reason
    pub fn with_reason(&self, key: &ResourceKey, reason: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| &e.object.key == key && e.reason == reason)
            .cloned()
            .collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, object: ObjectRef, event_type: EventType, reason: &str, message: &str) {
        self.events.lock().push(Event {
            id: Uuid::new_v4(),
            object,
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_recorder_filters_by_reason() {
        let recorder = MemoryRecorder::new();
        let web = ResourceKey::new("default", "web");
        let api = ResourceKey::new("default", "api");

        recorder.record(
            ObjectRef::certificate(&web),
            EventType::Warning,
            REASON_WARN_CERTIFICATE_DURATION,
            "capped",
        );
        recorder.record(
            ObjectRef::certificate(&api),
            EventType::Warning,
            REASON_WARN_CERTIFICATE_DURATION,
            "capped",
        );
        recorder.record(
            ObjectRef::certificate(&web),
            EventType::Normal,
            REASON_CERT_ISSUE_SUCCESS,
            "issued",
        );

        assert_eq!(recorder.events().len(), 3);
        let warnings = recorder.with_reason(&web, REASON_WARN_CERTIFICATE_DURATION);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].event_type, EventType::Warning);
        assert_ne!(recorder.events()[0].id, recorder.events()[1].id);
    }
}
