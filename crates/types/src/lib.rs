//! # Visia Types
//!
//! Validated value types and typed identifiers shared across the visia
//! workspace. These types guarantee their invariants at construction time so
//! that downstream code never has to re-validate.

pub mod ids;
pub mod text;

pub use ids::{CaseId, ChannelRef, ConsentRequestId, DeadlineId, ReservationId, SubjectId};
pub use text::{ContactHandle, NonEmptyText, TextError};
