//! Phase State Machine.
//!
//! The single writer of case phase history. Every advance validates the
//! static transition table, the payload, and the external facts the target
//! phase requires (resolved consent, an active resource reservation), then
//! commits the new history row with an optimistic version check: of two
//! racing writers with the same view of a case, exactly one wins and the
//! other receives `ConcurrentModification`.
//!
//! Facts are consulted through the [`ConsentFacts`] and [`ReservationFacts`]
//! traits so tests can substitute fakes for the gateway and the ledger.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use visia_types::{CaseId, ReservationId, SubjectId};

use crate::actor::Actor;
use crate::case::{Case, CaseStatus, PhaseRecord, Subject};
use crate::config::CoreConfig;
use crate::consent::{ConsentFacts, ConsentStatus};
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{EventSink, PhaseChanged};
use crate::ledger::ReservationFacts;
use crate::phase::{
    transition_rule, DecisionOutcome, Phase, PhasePayload, TransitionRule,
};
use crate::store::{RecordStore, StoreError};

/// Service owning subjects, cases, and the phase transition discipline.
pub struct PhaseStateMachine {
    subjects: RecordStore<SubjectId, Subject>,
    cases: RecordStore<CaseId, Case>,
    /// Subject -> its single active case. Guarded separately so two
    /// concurrent registrations for one subject serialize here.
    active: Mutex<HashMap<SubjectId, CaseId>>,
    consent: Arc<dyn ConsentFacts>,
    reservations: Arc<dyn ReservationFacts>,
    sink: Arc<dyn EventSink>,
    correction_window: chrono::Duration,
}

impl PhaseStateMachine {
    pub fn new(
        config: &CoreConfig,
        consent: Arc<dyn ConsentFacts>,
        reservations: Arc<dyn ReservationFacts>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            subjects: RecordStore::new(),
            cases: RecordStore::new(),
            active: Mutex::new(HashMap::new()),
            consent,
            reservations,
            sink,
            correction_window: config.correction_window(),
        }
    }

    /// Registers (or refreshes) a subject record.
    pub fn register_subject(&self, subject: Subject) {
        let id = subject.id;
        if self.subjects.insert(id, subject.clone()).is_err() {
            let _ = self.subjects.mutate(&id, |existing| *existing = subject);
        }
    }

    pub fn subject(&self, id: SubjectId) -> Option<Subject> {
        self.subjects.get(&id).map(|v| v.value)
    }

    /// Opens a new case in `Registered` for a subject.
    ///
    /// # Errors
    ///
    /// `SubjectHasActiveCase` if an open case already exists for the
    /// subject; `InvalidInput` for an unregistered subject.
    pub fn open_case(
        &self,
        subject_id: SubjectId,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Case> {
        if !self.subjects.contains(&subject_id) {
            return Err(WorkflowError::InvalidInput(format!(
                "subject {subject_id} is not registered"
            )));
        }

        let mut active = self.active.lock().expect("active index lock poisoned");
        if active.contains_key(&subject_id) {
            return Err(WorkflowError::SubjectHasActiveCase(subject_id));
        }

        let case = Case::open(subject_id, actor, now);
        // Fresh UUID key; duplicate insert is not reachable.
        let _ = self.cases.insert(case.id, case.clone());
        active.insert(subject_id, case.id);
        tracing::info!(case = %case.id, subject = %subject_id, "case opened");
        Ok(case)
    }

    /// Advances a case to `target`, validating the transition table, the
    /// payload, and all required external facts, then committing the new
    /// history row atomically against the version the case was read at.
    pub fn advance(
        &self,
        case_id: CaseId,
        target: Phase,
        actor: Actor,
        payload: PhasePayload,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Case> {
        let versioned = self
            .cases
            .get(&case_id)
            .ok_or(WorkflowError::CaseNotFound(case_id))?;
        let case = versioned.value;

        if case.status != CaseStatus::Active {
            return Err(WorkflowError::CaseClosed(case_id));
        }

        let from = case.current_phase();
        let rule = transition_rule(from, target)
            .ok_or(WorkflowError::InvalidTransition { from, to: target })?;

        payload.validate_for(target)?;
        self.check_gates(&case, from, target, rule, &payload, now)?;

        let mut updated = case.clone();
        updated.history.push(PhaseRecord {
            phase: target,
            entered_at: now,
            actor,
            payload,
        });
        updated.status = match target {
            Phase::Closed => CaseStatus::Closed,
            Phase::Cancelled | Phase::ConsentDenied => CaseStatus::Cancelled,
            _ => CaseStatus::Active,
        };

        match self
            .cases
            .compare_and_swap(&case_id, versioned.version, updated.clone())
        {
            Ok(_) => {}
            Err(StoreError::VersionConflict) => return Err(WorkflowError::ConcurrentModification),
            Err(_) => return Err(WorkflowError::CaseNotFound(case_id)),
        }

        if target.is_terminal() {
            self.active
                .lock()
                .expect("active index lock poisoned")
                .remove(&updated.subject_id);
        }

        // The transition is durable; event delivery is fire-and-forget and
        // cannot roll it back.
        self.sink.phase_changed(&PhaseChanged {
            case_id,
            from,
            to: target,
            at: now,
        });

        Ok(updated)
    }

    /// Records a reservation id against a case (weak reference; the ledger
    /// owns the reservation itself).
    pub fn note_reservation(
        &self,
        case_id: CaseId,
        reservation_id: ReservationId,
    ) -> WorkflowResult<()> {
        self.cases
            .mutate(&case_id, |case| {
                if !case.reservations.contains(&reservation_id) {
                    case.reservations.push(reservation_id);
                }
            })
            .map_err(|_| WorkflowError::CaseNotFound(case_id))
    }

    pub fn get_case(&self, case_id: CaseId) -> WorkflowResult<Case> {
        self.cases
            .get(&case_id)
            .map(|v| v.value)
            .ok_or(WorkflowError::CaseNotFound(case_id))
    }

    /// All cases, newest history first not guaranteed — callers sort.
    pub fn list_cases(&self) -> Vec<Case> {
        self.cases.snapshot().into_iter().map(|(_, v)| v.value).collect()
    }

    // ── Gate checks ─────────────────────────────────────────────────────

    fn check_gates(
        &self,
        case: &Case,
        from: Phase,
        target: Phase,
        rule: &TransitionRule,
        payload: &PhasePayload,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        if let Some(consent_type) = rule.consent_gate {
            let status = self.consent.consent_status(case.id, consent_type, now);
            let reason = match status {
                Some(ConsentStatus::Granted) => None,
                Some(ConsentStatus::Pending) => Some("consent not yet received"),
                Some(ConsentStatus::Denied) => Some("consent was denied"),
                Some(ConsentStatus::Expired) => Some("consent request expired without response"),
                None => Some("no consent request has been sent"),
            };
            if let Some(reason) = reason {
                return Err(WorkflowError::PreconditionUnmet(format!(
                    "{reason} ({consent_type} consent)"
                )));
            }
        }

        if let Some(resource_type) = rule.resource_gate {
            if !self
                .reservations
                .has_active_reservation(case.id, resource_type, now)
            {
                return Err(WorkflowError::PreconditionUnmet(format!(
                    "case holds no active {resource_type} reservation"
                )));
            }
        }

        // Re-decision is only open within the correction window measured
        // from the first decision.
        if from == target {
            if !rule.allows_reentry {
                return Err(WorkflowError::InvalidTransition { from, to: target });
            }
            if let Some(first) = case.first_entered_at(Phase::Decided) {
                if now - first > self.correction_window {
                    return Err(WorkflowError::PreconditionUnmet(
                        "re-decision correction window has elapsed".into(),
                    ));
                }
            }
        }

        // A prescription requires the standing decision to call for glasses.
        if target == Phase::PrescriptionIssued {
            match case.latest_payload(Phase::Decided) {
                Some(PhasePayload::Decision(decision))
                    if decision.outcome == DecisionOutcome::GlassesNeeded => {}
                _ => {
                    return Err(WorkflowError::PreconditionUnmet(
                        "decision outcome does not call for glasses".into(),
                    ))
                }
            }
        }

        // Aborting after assessment demands a recorded reason; normal
        // closure after follow-up does not.
        if target == Phase::Closed
            && from != Phase::FollowUpScheduled
            && !matches!(payload, PhasePayload::Closure(_))
        {
            return Err(WorkflowError::PreconditionUnmet(
                "closing an assessed case requires a recorded reason".into(),
            ));
        }

        Ok(())
    }
}
