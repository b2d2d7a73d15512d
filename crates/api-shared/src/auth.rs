//! Actor identity extraction.
//!
//! The engine performs no authentication itself; the deployment fronts the
//! service with a gateway that verifies identity and forwards it in plain
//! headers. This module turns those headers into a [`visia_core::Actor`]
//! recorded against every history row.

use visia_core::Actor;

/// Header carrying the authenticated user's display name.
pub const ACTOR_NAME_HEADER: &str = "x-actor-name";
/// Header carrying the authenticated user's professional role.
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    #[error("invalid actor identity: {0}")]
    InvalidActor(String),
}

/// Builds the acting identity from the forwarded header values.
///
/// # Errors
///
/// Returns an error when either header is absent or blank.
pub fn actor_from_headers(name: Option<&str>, role: Option<&str>) -> Result<Actor, AuthError> {
    let name = name.ok_or(AuthError::MissingHeader(ACTOR_NAME_HEADER))?;
    let role = role.ok_or(AuthError::MissingHeader(ACTOR_ROLE_HEADER))?;
    Actor::new(name, role).map_err(|e| AuthError::InvalidActor(e.to_string()))
}
