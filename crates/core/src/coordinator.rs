//! Case Coordinator.
//!
//! The orchestration facade the API layer talks to. Multi-component
//! operations run here in a fixed order: check the consent gate, place the
//! resource hold, advance the phase, then confirm the hold. There are no
//! distributed transactions — each component call is individually atomic and
//! the coordinator compensates on failure by releasing the hold, which is
//! idempotent and therefore safe to repeat.
//!
//! Transient failures (a lost optimistic-concurrency race, a hold that
//! lapsed before confirmation) are retried once; persistent validation
//! failures surface to the caller unchanged.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use visia_types::{CaseId, ChannelRef, ConsentRequestId, NonEmptyText, ReservationId};

use crate::actor::Actor;
use crate::case::{Case, Subject};
use crate::config::CoreConfig;
use crate::consent::{
    ConsentChannel, ConsentGateway, ConsentOutcome, ConsentRequest, ResolveAck,
};
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::EventSink;
use crate::ledger::ResourceLedger;
use crate::machine::PhaseStateMachine;
use crate::phase::{
    transition_rule, AssessmentData, ClosureData, ConsentType, DecisionData, DeliveryData,
    FollowUpData, ManufacturingData, Phase, PhasePayload, PrescriptionData, ResourceKey,
    ResourceType,
};
use crate::sla::{SlaDeadline, SlaTracker};

/// What one periodic maintenance pass found and did.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SweepReport {
    /// Pending consent requests flipped to expired.
    pub expired_consents: usize,
    /// Reservation holds lapsed past their TTL.
    pub lapsed_reservations: usize,
    /// Deadlines newly marked breached.
    pub breached_deadlines: Vec<SlaDeadline>,
}

/// Orchestrates the state machine, resource ledger, consent gateway, and SLA
/// tracker behind one API.
pub struct WorkflowCoordinator {
    machine: PhaseStateMachine,
    ledger: Arc<ResourceLedger>,
    gateway: Arc<ConsentGateway>,
    sla: SlaTracker,
}

impl WorkflowCoordinator {
    pub fn new(
        config: &CoreConfig,
        channel: Arc<dyn ConsentChannel>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let ledger = Arc::new(ResourceLedger::new(config));
        let gateway = Arc::new(ConsentGateway::new(channel, config));
        let machine = PhaseStateMachine::new(
            config,
            gateway.clone(),
            ledger.clone(),
            sink.clone(),
        );
        let sla = SlaTracker::new(config, sink);
        Self {
            machine,
            ledger,
            gateway,
            sla,
        }
    }

    // ── Registration and consent ────────────────────────────────────────

    /// Registers (or refreshes) the subject and opens a case for them.
    pub fn register_case(
        &self,
        subject: Subject,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Case> {
        let subject_id = subject.id;
        self.machine.register_subject(subject);
        self.machine.open_case(subject_id, actor, now)
    }

    /// Sends a consent request to the case's guardian. For an assessment
    /// request on a freshly registered case this also moves the case to
    /// `ConsentPending`; re-sends and dispensing requests leave the phase
    /// alone.
    pub fn request_consent(
        &self,
        case_id: CaseId,
        consent_type: ConsentType,
        actor: Actor,
        now: DateTime<Utc>,
    ) -> WorkflowResult<ConsentRequestId> {
        let case = self.machine.get_case(case_id)?;
        let subject = self
            .machine
            .subject(case.subject_id)
            .ok_or_else(|| {
                WorkflowError::InvalidInput(format!("subject {} is not registered", case.subject_id))
            })?;

        let request_id = self.gateway.request_consent(
            case_id,
            consent_type,
            &subject.guardian_contact,
            now,
        )?;

        if consent_type == ConsentType::Assessment
            && case.current_phase() == Phase::Registered
        {
            self.advance_with_retry(case_id, Phase::ConsentPending, actor, PhasePayload::None, now)?;
        }
        Ok(request_id)
    }

    /// Applies an inbound consent callback from the external channel and,
    /// when it resolves the pending assessment request, advances the case
    /// accordingly. Duplicate and late callbacks are acknowledged without
    /// any further effect.
    pub fn resolve_consent(
        &self,
        channel_ref: &ChannelRef,
        outcome: ConsentOutcome,
        now: DateTime<Utc>,
    ) -> WorkflowResult<ResolveAck> {
        let ack = self.gateway.resolve(channel_ref, outcome, now)?;

        if let ResolveAck::Applied {
            case_id,
            consent_type: ConsentType::Assessment,
            outcome,
        } = ack
        {
            let target = match outcome {
                ConsentOutcome::Granted => Phase::ConsentGranted,
                ConsentOutcome::Denied => Phase::ConsentDenied,
            };
            // The consent record is the source of truth and is already
            // resolved at this point. The phase advance is follow-through:
            // if it fails — the case moved on, was cancelled, or lost its
            // concurrency retry — the ack stays positive so the channel
            // does not redeliver a callback that would only no-op. A case
            // stuck in `ConsentPending` with granted consent passes the
            // gate on the next explicit advance.
            if let Err(e) = self.advance_with_retry(
                case_id,
                target,
                Actor::system("consent-gateway"),
                PhasePayload::None,
                now,
            ) {
                tracing::warn!(
                    case = %case_id,
                    %target,
                    error = %e,
                    "consent resolved but the case did not advance"
                );
            }
        }
        Ok(ack)
    }

    /// Consent request state for a case, with lazy expiry applied.
    pub fn consent_request(
        &self,
        case_id: CaseId,
        consent_type: ConsentType,
        now: DateTime<Utc>,
    ) -> Option<ConsentRequest> {
        self.gateway.request(case_id, consent_type, now)
    }

    // ── Phase advancement ───────────────────────────────────────────────

    /// Advances a case, reserving (and afterwards confirming) a resource
    /// when the caller names one.
    ///
    /// Order of operations: consent pre-check, hold, advance, confirm. A
    /// failed advance releases the hold; a hold that lapses between the
    /// durable advance and its confirmation is re-taken once.
    pub fn advance(
        &self,
        case_id: CaseId,
        target: Phase,
        actor: Actor,
        payload: PhasePayload,
        resource: Option<&ResourceKey>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Case> {
        self.precheck_consent(case_id, target, now)?;

        let Some(key) = resource else {
            return self.advance_with_retry(case_id, target, actor, payload, now);
        };

        let reservation_id = self.ledger.reserve(key, case_id, now)?;
        if let Err(e) = self.machine.note_reservation(case_id, reservation_id) {
            let _ = self.ledger.release(reservation_id, now);
            return Err(e);
        }

        match self.advance_with_retry(case_id, target, actor, payload, now) {
            Ok(case) => {
                self.confirm_hold(case_id, key, reservation_id, now)?;
                Ok(case)
            }
            Err(e) => {
                // Compensation: the hold must not keep occupying capacity
                // for a transition that never happened. Release is
                // idempotent, so a repeat of this path is harmless.
                let _ = self.ledger.release(reservation_id, now);
                Err(e)
            }
        }
    }

    /// Books the appointment slot and records the clinical assessment.
    pub fn advance_to_assessment(
        &self,
        case_id: CaseId,
        actor: Actor,
        slot: &ResourceKey,
        data: AssessmentData,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Case> {
        if slot.kind != ResourceType::AppointmentSlot {
            return Err(WorkflowError::InvalidInput(format!(
                "{slot} is not an appointment slot"
            )));
        }
        self.advance(
            case_id,
            Phase::Assessed,
            actor,
            PhasePayload::Assessment(data),
            Some(slot),
            now,
        )
    }

    /// Records the clinician's decision. Re-invocation within the
    /// correction window appends an amended decision.
    pub fn record_decision(
        &self,
        case_id: CaseId,
        actor: Actor,
        data: DecisionData,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Case> {
        self.advance(
            case_id,
            Phase::Decided,
            actor,
            PhasePayload::Decision(data),
            None,
            now,
        )
    }

    /// Issues the glasses prescription, which starts the delivery SLA clock.
    pub fn issue_prescription(
        &self,
        case_id: CaseId,
        actor: Actor,
        data: PrescriptionData,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Case> {
        self.advance(
            case_id,
            Phase::PrescriptionIssued,
            actor,
            PhasePayload::Prescription(data),
            None,
            now,
        )
    }

    /// Places the manufacturing order, reserving one inventory unit from
    /// the bucket the issued prescription falls into.
    pub fn order_manufacturing(
        &self,
        case_id: CaseId,
        actor: Actor,
        order_reference: NonEmptyText,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Case> {
        let case = self.machine.get_case(case_id)?;
        let bucket = match case.latest_payload(Phase::PrescriptionIssued) {
            Some(PhasePayload::Prescription(p)) => p.range_bucket.clone(),
            _ => {
                return Err(WorkflowError::PreconditionUnmet(
                    "no prescription on record to manufacture against".into(),
                ))
            }
        };
        let key = ResourceKey::new(ResourceType::InventoryUnit, bucket.as_str());
        self.advance(
            case_id,
            Phase::ManufacturingOrdered,
            actor,
            PhasePayload::ManufacturingOrder(ManufacturingData { order_reference }),
            Some(&key),
            now,
        )
    }

    /// Records that the glasses reached the subject.
    pub fn record_delivery(
        &self,
        case_id: CaseId,
        actor: Actor,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Case> {
        self.advance(
            case_id,
            Phase::Delivered,
            actor,
            PhasePayload::Delivery(DeliveryData { notes }),
            None,
            now,
        )
    }

    /// Schedules the post-delivery follow-up appointment.
    pub fn schedule_follow_up(
        &self,
        case_id: CaseId,
        actor: Actor,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Case> {
        self.advance(
            case_id,
            Phase::FollowUpScheduled,
            actor,
            PhasePayload::FollowUp(FollowUpData { scheduled_for }),
            None,
            now,
        )
    }

    /// Closes a case. After follow-up no reason is needed; aborting earlier
    /// in the pathway requires one.
    pub fn close_case(
        &self,
        case_id: CaseId,
        actor: Actor,
        reason: Option<NonEmptyText>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Case> {
        let payload = match reason {
            Some(reason) => PhasePayload::Closure(ClosureData { reason }),
            None => PhasePayload::None,
        };
        self.advance(case_id, Phase::Closed, actor, payload, None, now)
    }

    /// Cancels a pre-assessment case (guardian withdrew, child left the
    /// school, and similar).
    pub fn cancel_case(
        &self,
        case_id: CaseId,
        actor: Actor,
        reason: Option<NonEmptyText>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Case> {
        let payload = match reason {
            Some(reason) => PhasePayload::Closure(ClosureData { reason }),
            None => PhasePayload::None,
        };
        self.advance(case_id, Phase::Cancelled, actor, payload, None, now)
    }

    // ── Reads and maintenance ───────────────────────────────────────────

    pub fn get_case(&self, case_id: CaseId) -> WorkflowResult<Case> {
        self.machine.get_case(case_id)
    }

    pub fn list_cases(&self) -> Vec<Case> {
        self.machine.list_cases()
    }

    pub fn subject(&self, id: visia_types::SubjectId) -> Option<Subject> {
        self.machine.subject(id)
    }

    /// Declares an additional resource at runtime.
    pub fn define_resource(&self, key: ResourceKey, capacity: u32) -> WorkflowResult<()> {
        self.ledger.define_resource(key, capacity)
    }

    /// Remaining free units for a resource.
    pub fn available(&self, key: &ResourceKey, now: DateTime<Utc>) -> WorkflowResult<u32> {
        self.ledger.available(key, now)
    }

    /// Deadlines needing attention: breached, or pending past due.
    pub fn list_overdue(&self, now: DateTime<Utc>) -> Vec<SlaDeadline> {
        self.sla.overdue(now)
    }

    pub fn deadlines_for_case(&self, case_id: CaseId) -> Vec<SlaDeadline> {
        self.sla.deadlines_for_case(case_id)
    }

    /// One maintenance pass: expires unanswered consent requests, lapses
    /// stale reservation holds, and marks overdue deadlines breached. Every
    /// step is idempotent, so overlapping sweeps are harmless.
    pub fn run_sweep(&self, now: DateTime<Utc>) -> SweepReport {
        SweepReport {
            expired_consents: self.gateway.sweep_expired(now),
            lapsed_reservations: self.ledger.sweep_expired(now),
            breached_deadlines: self.sla.sweep(now),
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Refuses early when the target's consent gate cannot pass, so no
    /// resource hold is burned on a doomed advance. The machine re-checks
    /// under its own read, so this is an optimization, not the enforcement.
    fn precheck_consent(
        &self,
        case_id: CaseId,
        target: Phase,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        let case = self.machine.get_case(case_id)?;
        let Some(rule) = transition_rule(case.current_phase(), target) else {
            // Let the machine produce the canonical error.
            return Ok(());
        };
        if let Some(consent_type) = rule.consent_gate {
            use crate::consent::{ConsentFacts, ConsentStatus};
            let status = self.gateway.consent_status(case_id, consent_type, now);
            if status != Some(ConsentStatus::Granted) {
                return Err(WorkflowError::PreconditionUnmet(format!(
                    "{consent_type} consent is not granted"
                )));
            }
        }
        Ok(())
    }

    /// Advances and feeds the committed transition to the SLA tracker.
    fn advance_tracked(
        &self,
        case_id: CaseId,
        target: Phase,
        actor: Actor,
        payload: PhasePayload,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Case> {
        let case = self.machine.advance(case_id, target, actor, payload, now)?;
        self.sla.on_phase_entered(case_id, target, now);
        Ok(case)
    }

    /// One automatic retry after a lost optimistic-concurrency race; the
    /// retry re-reads current state, so a genuinely conflicting write
    /// surfaces as a validation error instead.
    fn advance_with_retry(
        &self,
        case_id: CaseId,
        target: Phase,
        actor: Actor,
        payload: PhasePayload,
        now: DateTime<Utc>,
    ) -> WorkflowResult<Case> {
        match self.advance_tracked(case_id, target, actor.clone(), payload.clone(), now) {
            Err(WorkflowError::ConcurrentModification) => {
                tracing::debug!(case = %case_id, %target, "retrying after version conflict");
                self.advance_tracked(case_id, target, actor, payload, now)
            }
            other => other,
        }
    }

    /// Confirms the hold backing a now-durable transition. If the hold
    /// lapsed in the window between advance and confirm, one fresh
    /// reservation is taken and confirmed in its place.
    fn confirm_hold(
        &self,
        case_id: CaseId,
        key: &ResourceKey,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> WorkflowResult<()> {
        match self.ledger.commit(reservation_id, now) {
            // NotFound here means the hold lapsed and a sweep already
            // pruned its id; same recovery as a plain lapse.
            Err(WorkflowError::ReservationExpired(_) | WorkflowError::ReservationNotFound(_)) => {
                tracing::warn!(
                    case = %case_id,
                    resource = %key,
                    "hold lapsed before confirmation; re-reserving"
                );
                let replacement = self.ledger.reserve(key, case_id, now)?;
                self.machine.note_reservation(case_id, replacement)?;
                self.ledger.commit(replacement, now)
            }
            other => other,
        }
    }
}
