//! Subjects and cases.
//!
//! A `Case` is the unit of workflow: one subject moving through the pathway
//! once. Its phase history is append-only — rows are never mutated or
//! removed, and the current phase is always the phase of the last row. This
//! mirrors the record-keeping discipline of the surrounding clinical system:
//! corrections append, they do not rewrite.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use visia_types::{CaseId, ContactHandle, NonEmptyText, ReservationId, SubjectId};

use crate::actor::Actor;
use crate::phase::{Phase, PhasePayload};

/// The screened child. A subject has at most one active case at a time;
/// historical (closed) cases remain readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub name: NonEmptyText,
    pub birth_date: NaiveDate,
    pub school: NonEmptyText,
    /// Where consent requests for this subject are sent.
    pub guardian_contact: ContactHandle,
}

/// Lifecycle status of a case, derived from its terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Active,
    Closed,
    Cancelled,
}

/// One append-only history row: the phase entered, when, by whom, and the
/// validated payload captured at entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub entered_at: DateTime<Utc>,
    pub actor: Actor,
    pub payload: PhasePayload,
}

/// The unit of workflow tracking one subject through the pathway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub id: CaseId,
    pub subject_id: SubjectId,
    pub status: CaseStatus,
    /// Append-only, ordered by commit sequence. Never empty: opening a case
    /// writes the `Registered` row.
    pub history: Vec<PhaseRecord>,
    /// Weak references to reservations claimed for this case; the ledger
    /// owns the reservations themselves.
    pub reservations: Vec<ReservationId>,
}

impl Case {
    /// Opens a new case in `Registered` for the given subject.
    pub fn open(subject_id: SubjectId, actor: Actor, now: DateTime<Utc>) -> Self {
        Self {
            id: CaseId::new(),
            subject_id,
            status: CaseStatus::Active,
            history: vec![PhaseRecord {
                phase: Phase::Registered,
                entered_at: now,
                actor,
                payload: PhasePayload::None,
            }],
            reservations: Vec::new(),
        }
    }

    /// The phase of the last history row.
    pub fn current_phase(&self) -> Phase {
        self.history
            .last()
            .map(|record| record.phase)
            .unwrap_or(Phase::Registered)
    }

    /// Timestamp of the *first* entry into `phase`, if the case has passed
    /// through it. SLA deadlines are derived from first entry, so a
    /// re-decision does not silently move a due date.
    pub fn first_entered_at(&self, phase: Phase) -> Option<DateTime<Utc>> {
        self.history
            .iter()
            .find(|record| record.phase == phase)
            .map(|record| record.entered_at)
    }

    /// The most recent payload recorded for `phase`, if any. Used to read
    /// the latest decision or prescription off the history.
    pub fn latest_payload(&self, phase: Phase) -> Option<&PhasePayload> {
        self.history
            .iter()
            .rev()
            .find(|record| record.phase == phase)
            .map(|record| &record.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{DecisionData, DecisionOutcome};

    fn actor() -> Actor {
        Actor::new("E. Cartwright", "Coordinator").expect("valid actor")
    }

    #[test]
    fn open_case_starts_registered_and_active() {
        let case = Case::open(SubjectId::new(), actor(), Utc::now());
        assert_eq!(case.current_phase(), Phase::Registered);
        assert_eq!(case.status, CaseStatus::Active);
        assert_eq!(case.history.len(), 1);
    }

    #[test]
    fn first_entered_at_ignores_later_reentries() {
        let mut case = Case::open(SubjectId::new(), actor(), Utc::now());
        let first = Utc::now();
        let second = first + chrono::Duration::hours(2);
        for entered_at in [first, second] {
            case.history.push(PhaseRecord {
                phase: Phase::Decided,
                entered_at,
                actor: actor(),
                payload: PhasePayload::Decision(DecisionData {
                    outcome: DecisionOutcome::GlassesNeeded,
                    notes: None,
                }),
            });
        }
        assert_eq!(case.first_entered_at(Phase::Decided), Some(first));
    }

    #[test]
    fn latest_payload_returns_most_recent_row() {
        let mut case = Case::open(SubjectId::new(), actor(), Utc::now());
        for outcome in [
            DecisionOutcome::SpecialistReferral,
            DecisionOutcome::GlassesNeeded,
        ] {
            case.history.push(PhaseRecord {
                phase: Phase::Decided,
                entered_at: Utc::now(),
                actor: actor(),
                payload: PhasePayload::Decision(DecisionData {
                    outcome,
                    notes: None,
                }),
            });
        }
        match case.latest_payload(Phase::Decided) {
            Some(PhasePayload::Decision(data)) => {
                assert_eq!(data.outcome, DecisionOutcome::GlassesNeeded)
            }
            other => panic!("expected decision payload, got {other:?}"),
        }
    }
}
