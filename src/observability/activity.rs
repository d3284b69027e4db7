use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{BatchCounters, BatchStatus};
use crate::error::ErrorKind;

/// One entry of the import audit trail
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ActivityEvent {
    BatchStarted {
        batch_id: Uuid,
        tenant_id: Uuid,
        source: String,
    },
    MatchedExisting {
        batch_id: Uuid,
        property_id: Option<Uuid>,
        external_id: String,
    },
    PossibleDuplicate {
        batch_id: Uuid,
        property_id: Option<Uuid>,
        existing_property_id: Option<Uuid>,
        fingerprint: String,
    },
    PropertyImported {
        batch_id: Uuid,
        property_id: Uuid,
        owner_id: Uuid,
        listing_id: Uuid,
        owner_status: String,
    },
    CanonicalAssignmentFailed {
        batch_id: Uuid,
        property_id: Uuid,
        listing_id: Uuid,
        reason: String,
    },
    RoleAssignmentFailed {
        batch_id: Uuid,
        property_id: Uuid,
        user_id: Uuid,
        reason: String,
    },
    RecordFailed {
        batch_id: Uuid,
        kind: ErrorKind,
        message: String,
    },
    PhotosProcessed {
        batch_id: Uuid,
        listing_id: Uuid,
        rendered: usize,
        failed: usize,
    },
    BatchSealed {
        batch_id: Uuid,
        status: BatchStatus,
        counters: BatchCounters,
        error_message: Option<String>,
    },
}

impl ActivityEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ActivityEvent::BatchStarted { .. } => "batch_started",
            ActivityEvent::MatchedExisting { .. } => "matched_existing",
            ActivityEvent::PossibleDuplicate { .. } => "possible_duplicate",
            ActivityEvent::PropertyImported { .. } => "property_imported",
            ActivityEvent::CanonicalAssignmentFailed { .. } => "canonical_assignment_failed",
            ActivityEvent::RoleAssignmentFailed { .. } => "role_assignment_failed",
            ActivityEvent::RecordFailed { .. } => "record_failed",
            ActivityEvent::PhotosProcessed { .. } => "photos_processed",
            ActivityEvent::BatchSealed { .. } => "batch_sealed",
        }
    }
}

/// Sink for audit events. Injected into the orchestrator so the trail does
/// not depend on how the process configured its global subscriber.
pub trait ActivityLog: Send + Sync {
    fn record(&self, event: ActivityEvent);
}

/// Emits every event as a structured `tracing` event on the `audit` target
#[derive(Debug, Default, Clone)]
pub struct TracingActivityLog;

impl ActivityLog for TracingActivityLog {
    fn record(&self, event: ActivityEvent) {
        match serde_json::to_string(&event) {
            Ok(payload) => info!(target: "audit", event = event.name(), payload = %payload, "audit"),
            Err(e) => warn!(target: "audit", event = event.name(), "unserializable audit event: {}", e),
        }
    }
}

/// Keeps events in memory, for tests and dry runs
#[derive(Debug, Default, Clone)]
pub struct MemoryActivityLog {
    events: Arc<Mutex<Vec<ActivityEvent>>>,
}

impl MemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events with the given name, in emission order
    pub fn named(&self, name: &str) -> Vec<ActivityEvent> {
        self.events().into_iter().filter(|e| e.name() == name).collect()
    }
}

impl ActivityLog for MemoryActivityLog {
    fn record(&self, event: ActivityEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
