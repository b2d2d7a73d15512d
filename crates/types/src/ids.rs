//! Typed identifiers.
//!
//! Every entity in the pathway engine is addressed by its own identifier type
//! wrapping a UUID. Distinct types prevent a case id from being passed where,
//! say, a reservation id is expected.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identifies a screened child across cases.
    SubjectId
);
uuid_id!(
    /// Identifies one pathway case (the unit of workflow).
    CaseId
);
uuid_id!(
    /// Identifies a claim on a finite resource held by the ledger.
    ReservationId
);
uuid_id!(
    /// Identifies an outbound consent request.
    ConsentRequestId
);
uuid_id!(
    /// Opaque reference assigned by the external messaging channel; inbound
    /// callbacks are correlated through it.
    ChannelRef
);
uuid_id!(
    /// Identifies a derived SLA deadline record.
    DeadlineId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(CaseId::new(), CaseId::new());
    }

    #[test]
    fn id_parses_its_own_display_output() {
        let id = ReservationId::new();
        let parsed: ReservationId = id.to_string().parse().expect("parse id");
        assert_eq!(id, parsed);
    }

    #[test]
    fn id_serializes_as_bare_uuid() {
        let id = SubjectId::new();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
    }
}
