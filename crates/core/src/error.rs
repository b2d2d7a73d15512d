use crate::phase::{Phase, ResourceKey};
use visia_types::{CaseId, ReservationId, SubjectId};

/// Error taxonomy for the pathway workflow engine.
///
/// Validation errors (`InvalidTransition`, `PreconditionUnmet`, `CaseClosed`)
/// are terminal for the calling request. `ConcurrentModification` and
/// `ReservationExpired` are recoverable by re-reading state and retrying.
/// `CapacityExceeded` carries the resource key so the caller can pick an
/// alternative.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: Phase, to: Phase },
    #[error("precondition unmet: {0}")]
    PreconditionUnmet(String),
    #[error("capacity exhausted for resource {key}")]
    CapacityExceeded { key: ResourceKey },
    #[error("reservation {0} has expired or is no longer held")]
    ReservationExpired(ReservationId),
    #[error("record was modified concurrently; re-read and retry")]
    ConcurrentModification,
    #[error("case {0} is closed")]
    CaseClosed(CaseId),
    #[error("case {0} not found")]
    CaseNotFound(CaseId),
    #[error("subject {0} already has an active case")]
    SubjectHasActiveCase(SubjectId),
    #[error("reservation {0} not found")]
    ReservationNotFound(ReservationId),
    #[error("no consent request matches the supplied channel reference")]
    ConsentRequestNotFound,
    #[error("consent channel unavailable: {0}")]
    ExternalChannelUnavailable(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to parse pathway configuration: {0}")]
    YamlDeserialization(#[from] serde_yaml::Error),
}

impl WorkflowError {
    /// Stable machine-readable discriminant, used by API surfaces so callers
    /// can branch on the error kind without parsing messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::PreconditionUnmet(_) => "precondition_unmet",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::ReservationExpired(_) => "reservation_expired",
            Self::ConcurrentModification => "concurrent_modification",
            Self::CaseClosed(_) => "case_closed",
            Self::CaseNotFound(_) => "case_not_found",
            Self::SubjectHasActiveCase(_) => "subject_has_active_case",
            Self::ReservationNotFound(_) => "reservation_not_found",
            Self::ConsentRequestNotFound => "consent_request_not_found",
            Self::ExternalChannelUnavailable(_) => "external_channel_unavailable",
            Self::InvalidInput(_) => "invalid_input",
            Self::Serialization(_) => "serialization",
            Self::YamlDeserialization(_) => "yaml_deserialization",
        }
    }

    /// Whether the coordinator may retry the operation once automatically
    /// after re-reading current state.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification | Self::ReservationExpired(_)
        )
    }
}

pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;
