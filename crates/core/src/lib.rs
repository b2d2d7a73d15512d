//! # Visia Core
//!
//! Workflow engine for the school vision programme: one case per screened
//! child, moving through a fixed pathway from registration via consent,
//! mobile-unit assessment, and glasses manufacturing to delivery, follow-up,
//! and closure.
//!
//! The crate is built from four cooperating services:
//! - [`machine::PhaseStateMachine`] — validates and commits phase
//!   transitions against the static table in [`phase`], with optimistic
//!   concurrency per case.
//! - [`ledger::ResourceLedger`] — capacity-bounded reservations over
//!   appointment slots and glasses inventory.
//! - [`consent::ConsentGateway`] — reconciles outbound guardian consent
//!   requests with asynchronous, at-least-once inbound callbacks.
//! - [`sla::SlaTracker`] — derives delivery/follow-up deadlines from phase
//!   entries and sweeps them for breaches.
//!
//! [`coordinator::WorkflowCoordinator`] composes the four behind the API
//! the service layer calls. Everything is deterministic under test: all
//! time-dependent operations take an explicit `now`.
//!
//! **No API concerns**: authentication, HTTP servers, and wire formats
//! belong in `api-rest` and `api-shared`.

pub mod actor;
pub mod case;
pub mod config;
pub mod consent;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod ledger;
pub mod machine;
pub mod phase;
pub mod sla;
pub mod store;

pub use actor::Actor;
pub use case::{Case, CaseStatus, PhaseRecord, Subject};
pub use config::{CoreConfig, ResourceSpec};
pub use consent::{
    ConsentChannel, ConsentGateway, ConsentOutcome, ConsentRequest, ConsentStatus,
    LoggingConsentChannel, ResolveAck,
};
pub use coordinator::{SweepReport, WorkflowCoordinator};
pub use error::{WorkflowError, WorkflowResult};
pub use events::{CollectingEventSink, DeadlineBreached, EventSink, PhaseChanged, TracingEventSink};
pub use ledger::{Reservation, ReservationState, ResourceLedger};
pub use machine::PhaseStateMachine;
pub use phase::{
    AssessmentData, ClosureData, ConsentType, DecisionData, DecisionOutcome, DeliveryData,
    FollowUpData, ManufacturingData, Phase, PhasePayload, PrescriptionData, ResourceKey,
    ResourceType,
};
pub use sla::{DeadlineKind, DeadlineRule, DeadlineStatus, SlaDeadline, SlaTracker};
pub use visia_types::{
    CaseId, ChannelRef, ConsentRequestId, ContactHandle, DeadlineId, NonEmptyText, ReservationId,
    SubjectId,
};
