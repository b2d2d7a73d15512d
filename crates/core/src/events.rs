//! Engine events for external consumers (notification, audit, reporting).
//!
//! Events are emitted after the underlying record write is durable, and
//! delivery is fire-and-forget: a sink must never block the caller and has
//! no way to fail a committed transition. Consumers see at-least-once
//! delivery and must be idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use visia_types::{CaseId, DeadlineId};

use crate::phase::Phase;
use crate::sla::DeadlineKind;

/// Emitted after every committed phase transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseChanged {
    pub case_id: CaseId,
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
}

/// Emitted when the SLA sweep marks a deadline breached. A breach is a
/// signal for human escalation, never an automatic workflow transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadlineBreached {
    pub case_id: CaseId,
    pub deadline_id: DeadlineId,
    pub kind: DeadlineKind,
    pub due_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
}

/// Destination for engine events.
///
/// Implementations must return quickly and must not panic; the engine calls
/// them synchronously after the transition is durable.
pub trait EventSink: Send + Sync {
    fn phase_changed(&self, event: &PhaseChanged);
    fn deadline_breached(&self, event: &DeadlineBreached);
}

/// Production default: events become structured log lines for downstream
/// shipping.
#[derive(Debug, Default, Clone)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn phase_changed(&self, event: &PhaseChanged) {
        tracing::info!(
            case_id = %event.case_id,
            from = %event.from,
            to = %event.to,
            at = %event.at,
            "phase changed"
        );
    }

    fn deadline_breached(&self, event: &DeadlineBreached) {
        tracing::warn!(
            case_id = %event.case_id,
            deadline_id = %event.deadline_id,
            kind = %event.kind,
            due_at = %event.due_at,
            "SLA deadline breached"
        );
    }
}

/// Collects events in memory; used by tests and the CLI simulation to
/// observe what the engine emitted.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    phase_changes: Mutex<Vec<PhaseChanged>>,
    breaches: Mutex<Vec<DeadlineBreached>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns all collected phase-change events.
    pub fn drain_phase_changes(&self) -> Vec<PhaseChanged> {
        std::mem::take(&mut self.phase_changes.lock().expect("sink lock poisoned"))
    }

    /// Removes and returns all collected breach events.
    pub fn drain_breaches(&self) -> Vec<DeadlineBreached> {
        std::mem::take(&mut self.breaches.lock().expect("sink lock poisoned"))
    }
}

impl EventSink for CollectingEventSink {
    fn phase_changed(&self, event: &PhaseChanged) {
        self.phase_changes
            .lock()
            .expect("sink lock poisoned")
            .push(event.clone());
    }

    fn deadline_breached(&self, event: &DeadlineBreached) {
        self.breaches
            .lock()
            .expect("sink lock poisoned")
            .push(event.clone());
    }
}
