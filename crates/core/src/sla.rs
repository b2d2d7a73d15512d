//! SLA Tracker.
//!
//! Deadlines are derived records, never created directly: entering a phase
//! that matches a configured rule creates one, entering the rule's
//! satisfying phase marks it met, and the periodic sweep marks overdue ones
//! breached. A breach is a signal for external alerting — the sweep never
//! mutates case phase; escalation remains an explicit actor decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use visia_types::{CaseId, DeadlineId};

use crate::config::CoreConfig;
use crate::events::{DeadlineBreached, EventSink};
use crate::phase::Phase;
use crate::store::RecordStore;

/// The service-level obligation a deadline tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineKind {
    /// Glasses must reach the subject within the configured window after
    /// prescription approval.
    Delivery,
    /// A follow-up appointment must happen within the configured window
    /// after delivery.
    FollowUp,
}

impl std::fmt::Display for DeadlineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadlineKind::Delivery => write!(f, "delivery"),
            DeadlineKind::FollowUp => write!(f, "follow_up"),
        }
    }
}

/// One configured phase → deadline derivation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeadlineRule {
    pub kind: DeadlineKind,
    /// Entering this phase creates the deadline.
    pub trigger: Phase,
    /// Due date offset from the trigger entry timestamp.
    pub offset_days: i64,
    /// Entering this phase marks the deadline met.
    pub satisfied_by: Phase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineStatus {
    Pending,
    Met,
    Breached,
    /// The case ended before the obligation was satisfied; distinct from
    /// `Met` so reporting never shows an unfulfilled SLA as fulfilled.
    Cancelled,
}

/// A derived, trackable due date attached to a case phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaDeadline {
    pub id: DeadlineId,
    pub case_id: CaseId,
    pub kind: DeadlineKind,
    /// The phase-entry timestamp the due date was derived from.
    pub basis: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub status: DeadlineStatus,
}

/// Service deriving and sweeping SLA deadlines.
pub struct SlaTracker {
    deadlines: RecordStore<DeadlineId, SlaDeadline>,
    rules: Vec<DeadlineRule>,
    sink: Arc<dyn EventSink>,
}

impl SlaTracker {
    pub fn new(config: &CoreConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            deadlines: RecordStore::new(),
            rules: config.deadline_rules().to_vec(),
            sink,
        }
    }

    /// Reacts to a committed phase entry: creates deadlines whose rule
    /// triggers on `phase`, marks met those satisfied by it, and cascades
    /// closure when the case reaches a terminal phase.
    ///
    /// Re-invocation for the same (case, phase) recomputes the existing
    /// pending deadline's due date instead of duplicating it, which also
    /// covers audit-approved corrections of a phase-entry timestamp.
    pub fn on_phase_entered(&self, case_id: CaseId, phase: Phase, entered_at: DateTime<Utc>) {
        for rule in &self.rules {
            if rule.satisfied_by == phase {
                self.close_pending(case_id, rule.kind, DeadlineStatus::Met);
            }
            if rule.trigger == phase {
                self.upsert(case_id, rule, entered_at);
            }
        }
        if phase.is_terminal() {
            // The case is over; whatever is still pending can no longer be
            // meaningfully breached — but it was not met either.
            for rule in &self.rules {
                self.close_pending(case_id, rule.kind, DeadlineStatus::Cancelled);
            }
        }
    }

    /// Scans pending deadlines past their due date, marks them breached,
    /// emits [`DeadlineBreached`] events, and returns them for external
    /// alerting. Idempotent: an already-breached deadline is not reported
    /// again. Safe to run concurrently with phase advances.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<SlaDeadline> {
        let mut breached = Vec::new();
        for (id, versioned) in self.deadlines.snapshot() {
            if versioned.value.status != DeadlineStatus::Pending || now < versioned.value.due_at {
                continue;
            }
            let flipped = self
                .deadlines
                .mutate(&id, |deadline| {
                    if deadline.status == DeadlineStatus::Pending && now >= deadline.due_at {
                        deadline.status = DeadlineStatus::Breached;
                        Some(deadline.clone())
                    } else {
                        None
                    }
                })
                .ok()
                .flatten();

            if let Some(deadline) = flipped {
                self.sink.deadline_breached(&DeadlineBreached {
                    case_id: deadline.case_id,
                    deadline_id: deadline.id,
                    kind: deadline.kind,
                    due_at: deadline.due_at,
                    detected_at: now,
                });
                breached.push(deadline);
            }
        }
        breached
    }

    /// Deadlines needing attention at `now`: already breached, plus pending
    /// ones past due that the sweep has not visited yet.
    pub fn overdue(&self, now: DateTime<Utc>) -> Vec<SlaDeadline> {
        let mut result: Vec<SlaDeadline> = self
            .deadlines
            .snapshot()
            .into_iter()
            .map(|(_, v)| v.value)
            .filter(|d| {
                d.status == DeadlineStatus::Breached
                    || (d.status == DeadlineStatus::Pending && now >= d.due_at)
            })
            .collect();
        result.sort_by_key(|d| d.due_at);
        result
    }

    /// All deadlines for one case, in due-date order.
    pub fn deadlines_for_case(&self, case_id: CaseId) -> Vec<SlaDeadline> {
        let mut result: Vec<SlaDeadline> = self
            .deadlines
            .snapshot()
            .into_iter()
            .map(|(_, v)| v.value)
            .filter(|d| d.case_id == case_id)
            .collect();
        result.sort_by_key(|d| d.due_at);
        result
    }

    fn pending_for(&self, case_id: CaseId, kind: DeadlineKind) -> Option<DeadlineId> {
        self.deadlines
            .snapshot()
            .into_iter()
            .find(|(_, v)| {
                v.value.case_id == case_id
                    && v.value.kind == kind
                    && v.value.status == DeadlineStatus::Pending
            })
            .map(|(id, _)| id)
    }

    fn upsert(&self, case_id: CaseId, rule: &DeadlineRule, basis: DateTime<Utc>) {
        let due_at = basis + chrono::Duration::days(rule.offset_days);
        if let Some(id) = self.pending_for(case_id, rule.kind) {
            // Recompute, never duplicate.
            let _ = self.deadlines.mutate(&id, |deadline| {
                deadline.basis = basis;
                deadline.due_at = due_at;
            });
            return;
        }
        let deadline = SlaDeadline {
            id: DeadlineId::new(),
            case_id,
            kind: rule.kind,
            basis,
            due_at,
            status: DeadlineStatus::Pending,
        };
        tracing::debug!(case = %case_id, kind = %rule.kind, due_at = %due_at, "deadline created");
        let _ = self.deadlines.insert(deadline.id, deadline);
    }

    fn close_pending(&self, case_id: CaseId, kind: DeadlineKind, status: DeadlineStatus) {
        if let Some(id) = self.pending_for(case_id, kind) {
            let _ = self.deadlines.mutate(&id, |deadline| {
                deadline.status = status;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::delivery_sla_rule;
    use crate::events::CollectingEventSink;

    fn tracker_with_sink() -> (SlaTracker, Arc<CollectingEventSink>) {
        let sink = Arc::new(CollectingEventSink::new());
        let config = CoreConfig::new(
            chrono::Duration::days(14),
            chrono::Duration::minutes(15),
            chrono::Duration::days(7),
            vec![delivery_sla_rule(14)],
            vec![],
        )
        .expect("valid config");
        (
            SlaTracker::new(&config, sink.clone() as Arc<dyn EventSink>),
            sink,
        )
    }

    #[test]
    fn prescription_entry_creates_a_fourteen_day_delivery_deadline() {
        let (tracker, _) = tracker_with_sink();
        let case_id = CaseId::new();
        let t = Utc::now();

        tracker.on_phase_entered(case_id, Phase::PrescriptionIssued, t);

        let deadlines = tracker.deadlines_for_case(case_id);
        assert_eq!(deadlines.len(), 1);
        assert_eq!(deadlines[0].due_at, t + chrono::Duration::days(14));
        assert_eq!(deadlines[0].status, DeadlineStatus::Pending);
    }

    #[test]
    fn sweep_breaches_only_past_due_deadlines() {
        let (tracker, sink) = tracker_with_sink();
        let case_id = CaseId::new();
        let t = Utc::now();
        tracker.on_phase_entered(case_id, Phase::PrescriptionIssued, t);

        // Ten days in: nothing to report.
        assert!(tracker.sweep(t + chrono::Duration::days(10)).is_empty());
        assert!(sink.drain_breaches().is_empty());

        // Fifteen days in: breached, once.
        let breached = tracker.sweep(t + chrono::Duration::days(15));
        assert_eq!(breached.len(), 1);
        assert_eq!(breached[0].case_id, case_id);
        assert_eq!(sink.drain_breaches().len(), 1);

        // Re-sweeping an already-breached deadline is a no-op.
        assert!(tracker.sweep(t + chrono::Duration::days(16)).is_empty());
        assert!(sink.drain_breaches().is_empty());
    }

    #[test]
    fn delivery_marks_the_deadline_met() {
        let (tracker, _) = tracker_with_sink();
        let case_id = CaseId::new();
        let t = Utc::now();
        tracker.on_phase_entered(case_id, Phase::PrescriptionIssued, t);
        tracker.on_phase_entered(case_id, Phase::Delivered, t + chrono::Duration::days(5));

        let deadlines = tracker.deadlines_for_case(case_id);
        assert_eq!(deadlines[0].status, DeadlineStatus::Met);
        assert!(tracker.sweep(t + chrono::Duration::days(20)).is_empty());
    }

    #[test]
    fn reentry_recomputes_instead_of_duplicating() {
        let (tracker, _) = tracker_with_sink();
        let case_id = CaseId::new();
        let t = Utc::now();
        tracker.on_phase_entered(case_id, Phase::PrescriptionIssued, t);

        // Corrected entry timestamp: the deadline moves, no second record.
        let corrected = t + chrono::Duration::days(2);
        tracker.on_phase_entered(case_id, Phase::PrescriptionIssued, corrected);

        let deadlines = tracker.deadlines_for_case(case_id);
        assert_eq!(deadlines.len(), 1);
        assert_eq!(deadlines[0].due_at, corrected + chrono::Duration::days(14));
    }

    #[test]
    fn terminal_phase_cancels_pending_deadlines_without_calling_them_met() {
        let (tracker, _) = tracker_with_sink();
        let case_id = CaseId::new();
        let t = Utc::now();
        tracker.on_phase_entered(case_id, Phase::PrescriptionIssued, t);
        tracker.on_phase_entered(case_id, Phase::Closed, t + chrono::Duration::days(3));

        // The glasses never arrived: the obligation is cancelled, not met,
        // and it no longer breaches.
        assert!(tracker.sweep(t + chrono::Duration::days(30)).is_empty());
        assert!(tracker.overdue(t + chrono::Duration::days(30)).is_empty());
        assert_eq!(
            tracker.deadlines_for_case(case_id)[0].status,
            DeadlineStatus::Cancelled
        );
    }

    #[test]
    fn overdue_lists_pending_past_due_before_any_sweep() {
        let (tracker, _) = tracker_with_sink();
        let case_id = CaseId::new();
        let t = Utc::now();
        tracker.on_phase_entered(case_id, Phase::PrescriptionIssued, t);

        assert!(tracker.overdue(t + chrono::Duration::days(10)).is_empty());
        let overdue = tracker.overdue(t + chrono::Duration::days(15));
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].status, DeadlineStatus::Pending);
    }
}
