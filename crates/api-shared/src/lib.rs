//! # API Shared
//!
//! Shared utilities and definitions for the Visia service layer.
//!
//! Contains:
//! - Shared services like `HealthService`
//! - Actor-identity extraction from request headers
//!
//! Used by `api-rest` and the embedded server in `visia-run`.

pub mod auth;
pub mod health;

pub use auth::{actor_from_headers, AuthError, ACTOR_NAME_HEADER, ACTOR_ROLE_HEADER};
pub use health::{HealthRes, HealthService};
