//! Actor identity recorded against history rows.
//!
//! The engine performs no authorization: the API layer passes an
//! authenticated actor through opaquely and the engine only records who did
//! what. Validation here is limited to well-formedness.

use serde::{Deserialize, Serialize};
use visia_types::NonEmptyText;

/// The person (or system component) performing a workflow operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// The full name of the actor.
    pub name: NonEmptyText,
    /// The professional role of the actor (e.g., "Clinician", "Coordinator").
    pub role: NonEmptyText,
}

impl Actor {
    /// Creates an actor from raw name/role strings.
    ///
    /// # Errors
    ///
    /// Returns an error if either field is empty or whitespace-only.
    pub fn new(
        name: impl AsRef<str>,
        role: impl AsRef<str>,
    ) -> Result<Self, visia_types::TextError> {
        Ok(Self {
            name: NonEmptyText::new(name)?,
            role: NonEmptyText::new(role)?,
        })
    }

    /// Actor recorded for transitions triggered by the engine itself, such
    /// as the advance following an inbound consent resolution.
    pub fn system(component: &str) -> Self {
        Self {
            name: NonEmptyText::new(component).unwrap_or_else(|_| {
                NonEmptyText::new("system").expect("literal is non-empty")
            }),
            role: NonEmptyText::new("system").expect("literal is non-empty"),
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_name() {
        assert!(Actor::new("  ", "Clinician").is_err());
    }

    #[test]
    fn system_actor_has_system_role() {
        let actor = Actor::system("consent-gateway");
        assert_eq!(actor.role.as_str(), "system");
        assert_eq!(actor.name.as_str(), "consent-gateway");
    }
}
