//! The pathway phase graph.
//!
//! Phases form a fixed, domain-specific graph (deliberately not a
//! general-purpose workflow interpreter): each transition declares its legal
//! predecessors, the external facts it requires (resolved consent, an active
//! resource reservation) and whether it may be re-entered. The Phase State
//! Machine in [`crate::machine`] is the only component that walks this table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use visia_types::NonEmptyText;

// ============================================================================
// PHASES
// ============================================================================

/// A named stage in the pathway.
///
/// The main spine runs `Registered → ConsentPending → ConsentGranted →
/// Assessed → Decided → PrescriptionIssued → ManufacturingOrdered →
/// Delivered → FollowUpScheduled → Closed`. `ConsentDenied` and `Cancelled`
/// are terminal aborts reachable from any pre-assessment phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Registered,
    ConsentPending,
    ConsentGranted,
    Assessed,
    Decided,
    PrescriptionIssued,
    ManufacturingOrdered,
    Delivered,
    FollowUpScheduled,
    Closed,
    ConsentDenied,
    Cancelled,
}

impl Phase {
    /// All phases in spine order, aborts last.
    pub const ALL: [Phase; 12] = [
        Phase::Registered,
        Phase::ConsentPending,
        Phase::ConsentGranted,
        Phase::Assessed,
        Phase::Decided,
        Phase::PrescriptionIssued,
        Phase::ManufacturingOrdered,
        Phase::Delivered,
        Phase::FollowUpScheduled,
        Phase::Closed,
        Phase::ConsentDenied,
        Phase::Cancelled,
    ];

    /// Terminal phases: no transition leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Closed | Phase::ConsentDenied | Phase::Cancelled)
    }

    /// Phases before clinical assessment has taken place. Out-of-band aborts
    /// (`Cancelled`, `ConsentDenied`) are only legal from these; afterwards a
    /// case must be closed with a recorded reason to preserve the clinical
    /// audit trail.
    pub fn is_pre_assessment(&self) -> bool {
        matches!(
            self,
            Phase::Registered | Phase::ConsentPending | Phase::ConsentGranted
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Registered => "registered",
            Phase::ConsentPending => "consent_pending",
            Phase::ConsentGranted => "consent_granted",
            Phase::Assessed => "assessed",
            Phase::Decided => "decided",
            Phase::PrescriptionIssued => "prescription_issued",
            Phase::ManufacturingOrdered => "manufacturing_ordered",
            Phase::Delivered => "delivered",
            Phase::FollowUpScheduled => "follow_up_scheduled",
            Phase::Closed => "closed",
            Phase::ConsentDenied => "consent_denied",
            Phase::Cancelled => "cancelled",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for Phase {
    type Err = crate::error::WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.to_string() == s)
            .ok_or_else(|| {
                crate::error::WorkflowError::InvalidInput(format!("unknown phase: {s}"))
            })
    }
}

// ============================================================================
// CONSENT AND RESOURCE KEYS
// ============================================================================

/// The kind of guardian consent tracked per case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentType {
    /// Consent for the mobile-unit clinical assessment. Gates
    /// `ConsentGranted`.
    Assessment,
    /// Consent for dispensing and fitting prescribed glasses. Tracked and
    /// reportable, not a phase gate.
    Dispensing,
}

impl std::fmt::Display for ConsentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsentType::Assessment => write!(f, "assessment"),
            ConsentType::Dispensing => write!(f, "dispensing"),
        }
    }
}

/// The kind of finite resource the ledger tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Mobile-unit appointment slot (time + location capacity).
    AppointmentSlot,
    /// Glasses inventory, bucketed by prescription range.
    InventoryUnit,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::AppointmentSlot => write!(f, "appointment_slot"),
            ResourceType::InventoryUnit => write!(f, "inventory_unit"),
        }
    }
}

/// Addresses one capacity-bounded resource in the ledger, e.g. the slot
/// `appointment_slot/slot-2024-03-01-09:00` or the inventory bucket
/// `inventory_unit/sphere-minus-2-to-minus-4`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceKey {
    pub kind: ResourceType,
    pub id: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceType, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

// ============================================================================
// PHASE PAYLOADS
// ============================================================================

/// Outcome recorded when a clinician decides on an assessed case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Glasses are to be prescribed; the pathway continues.
    GlassesNeeded,
    /// Vision within normal bounds; the case moves to closure.
    NoInterventionNeeded,
    /// Findings outside the programme's remit; referred onwards.
    SpecialistReferral,
}

/// Clinical findings recorded on entering `Assessed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssessmentData {
    pub visual_acuity_left: NonEmptyText,
    pub visual_acuity_right: NonEmptyText,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Clinician decision recorded on entering `Decided`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionData {
    pub outcome: DecisionOutcome,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Glasses prescription recorded on entering `PrescriptionIssued`.
///
/// `range_bucket` names the inventory bucket the prescription falls into;
/// the manufacturing order reserves one unit from that bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrescriptionData {
    pub sphere_right: f64,
    pub sphere_left: f64,
    pub range_bucket: NonEmptyText,
}

/// Manufacturing order details recorded on entering `ManufacturingOrdered`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManufacturingData {
    pub order_reference: NonEmptyText,
}

/// Delivery confirmation recorded on entering `Delivered`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliveryData {
    #[serde(default)]
    pub notes: Option<String>,
}

/// Follow-up appointment recorded on entering `FollowUpScheduled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FollowUpData {
    pub scheduled_for: DateTime<Utc>,
}

/// Closure reason, mandatory when a case is aborted after assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClosureData {
    pub reason: NonEmptyText,
}

/// Per-phase payload attached to a history row.
///
/// The variant must match the phase being entered; the state machine rejects
/// mismatches before committing the transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhasePayload {
    None,
    Assessment(AssessmentData),
    Decision(DecisionData),
    Prescription(PrescriptionData),
    ManufacturingOrder(ManufacturingData),
    Delivery(DeliveryData),
    FollowUp(FollowUpData),
    Closure(ClosureData),
}

impl PhasePayload {
    /// Validates that this payload is acceptable for entering `target`.
    ///
    /// `Closed` and `Cancelled` accept either a closure reason or nothing;
    /// whether a reason is *mandatory* depends on the phase being left and is
    /// enforced by the state machine, which knows the predecessor.
    pub fn validate_for(&self, target: Phase) -> Result<(), crate::error::WorkflowError> {
        use crate::error::WorkflowError;

        let ok = match target {
            Phase::Assessed => matches!(self, PhasePayload::Assessment(_)),
            Phase::Decided => matches!(self, PhasePayload::Decision(_)),
            Phase::PrescriptionIssued => matches!(self, PhasePayload::Prescription(_)),
            Phase::ManufacturingOrdered => matches!(self, PhasePayload::ManufacturingOrder(_)),
            Phase::Delivered => {
                matches!(self, PhasePayload::Delivery(_) | PhasePayload::None)
            }
            Phase::FollowUpScheduled => matches!(self, PhasePayload::FollowUp(_)),
            Phase::Closed | Phase::Cancelled => {
                matches!(self, PhasePayload::Closure(_) | PhasePayload::None)
            }
            _ => matches!(self, PhasePayload::None),
        };

        if ok {
            Ok(())
        } else {
            Err(WorkflowError::PreconditionUnmet(format!(
                "payload does not match target phase {target}"
            )))
        }
    }
}

// ============================================================================
// TRANSITION TABLE
// ============================================================================

/// One legal transition in the phase graph.
#[derive(Debug, Clone, Copy)]
pub struct TransitionRule {
    /// Phase being entered.
    pub to: Phase,
    /// Legal predecessor phases.
    pub from: &'static [Phase],
    /// Consent that must be `granted` before entering.
    pub consent_gate: Option<ConsentType>,
    /// Resource type for which the case must hold an active reservation.
    pub resource_gate: Option<ResourceType>,
    /// Whether `to` may be re-entered from itself (the re-decision retry).
    pub allows_reentry: bool,
}

/// The whitelisted retry transition: `Decided` may be re-entered within the
/// configured correction window, appending a new history row.
const FROM_DECIDED_RETRY: &[Phase] = &[Phase::Assessed, Phase::Decided];

static TRANSITIONS: &[TransitionRule] = &[
    TransitionRule {
        to: Phase::ConsentPending,
        from: &[Phase::Registered],
        consent_gate: None,
        resource_gate: None,
        allows_reentry: false,
    },
    TransitionRule {
        to: Phase::ConsentGranted,
        from: &[Phase::ConsentPending],
        consent_gate: Some(ConsentType::Assessment),
        resource_gate: None,
        allows_reentry: false,
    },
    TransitionRule {
        to: Phase::Assessed,
        from: &[Phase::ConsentGranted],
        consent_gate: Some(ConsentType::Assessment),
        resource_gate: Some(ResourceType::AppointmentSlot),
        allows_reentry: false,
    },
    TransitionRule {
        to: Phase::Decided,
        from: FROM_DECIDED_RETRY,
        consent_gate: None,
        resource_gate: None,
        allows_reentry: true,
    },
    TransitionRule {
        to: Phase::PrescriptionIssued,
        from: &[Phase::Decided],
        consent_gate: None,
        resource_gate: None,
        allows_reentry: false,
    },
    TransitionRule {
        to: Phase::ManufacturingOrdered,
        from: &[Phase::PrescriptionIssued],
        consent_gate: None,
        resource_gate: Some(ResourceType::InventoryUnit),
        allows_reentry: false,
    },
    TransitionRule {
        to: Phase::Delivered,
        from: &[Phase::ManufacturingOrdered],
        consent_gate: None,
        resource_gate: None,
        allows_reentry: false,
    },
    TransitionRule {
        to: Phase::FollowUpScheduled,
        from: &[Phase::Delivered],
        consent_gate: None,
        resource_gate: None,
        allows_reentry: false,
    },
    // Normal closure after follow-up, plus closed-with-reason aborts from
    // every post-assessment phase.
    TransitionRule {
        to: Phase::Closed,
        from: &[
            Phase::FollowUpScheduled,
            Phase::Assessed,
            Phase::Decided,
            Phase::PrescriptionIssued,
            Phase::ManufacturingOrdered,
            Phase::Delivered,
        ],
        consent_gate: None,
        resource_gate: None,
        allows_reentry: false,
    },
    TransitionRule {
        to: Phase::ConsentDenied,
        from: &[Phase::Registered, Phase::ConsentPending, Phase::ConsentGranted],
        consent_gate: None,
        resource_gate: None,
        allows_reentry: false,
    },
    TransitionRule {
        to: Phase::Cancelled,
        from: &[Phase::Registered, Phase::ConsentPending, Phase::ConsentGranted],
        consent_gate: None,
        resource_gate: None,
        allows_reentry: false,
    },
];

/// Looks up the rule governing `from → to`, if that edge exists.
pub fn transition_rule(from: Phase, to: Phase) -> Option<&'static TransitionRule> {
    TRANSITIONS
        .iter()
        .find(|rule| rule.to == to && rule.from.contains(&from))
}

/// The full transition table, for introspection (CLI graph printing).
pub fn transition_table() -> &'static [TransitionRule] {
    TRANSITIONS
}
