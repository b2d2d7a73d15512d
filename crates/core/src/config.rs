//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and passed into the
//! engine; nothing in the request path reads environment variables or other
//! ambient state. Domain policy windows (consent expiry, reservation hold
//! TTL, the re-decision correction window) are explicit parameters here
//! rather than hardcoded constants.

use serde::Deserialize;

use crate::error::{WorkflowError, WorkflowResult};
use crate::phase::{Phase, ResourceKey, ResourceType};
use crate::sla::{DeadlineKind, DeadlineRule};

/// Declares one capacity-bounded resource (appointment slot or inventory
/// bucket) available to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub key: ResourceKey,
    pub capacity: u32,
}

/// Engine configuration resolved at startup.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    consent_expiry: chrono::Duration,
    reservation_ttl: chrono::Duration,
    correction_window: chrono::Duration,
    deadline_rules: Vec<DeadlineRule>,
    resources: Vec<ResourceSpec>,
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// # Errors
    ///
    /// Returns `WorkflowError::InvalidInput` if any window is non-positive,
    /// a resource declares zero capacity or a duplicate key, or a deadline
    /// rule is satisfied by its own trigger phase.
    pub fn new(
        consent_expiry: chrono::Duration,
        reservation_ttl: chrono::Duration,
        correction_window: chrono::Duration,
        deadline_rules: Vec<DeadlineRule>,
        resources: Vec<ResourceSpec>,
    ) -> WorkflowResult<Self> {
        for (name, window) in [
            ("consent_expiry", consent_expiry),
            ("reservation_ttl", reservation_ttl),
            ("correction_window", correction_window),
        ] {
            if window <= chrono::Duration::zero() {
                return Err(WorkflowError::InvalidInput(format!(
                    "{name} must be a positive duration"
                )));
            }
        }

        for spec in &resources {
            if spec.capacity == 0 {
                return Err(WorkflowError::InvalidInput(format!(
                    "resource {} declares zero capacity",
                    spec.key
                )));
            }
            let occurrences = resources.iter().filter(|s| s.key == spec.key).count();
            if occurrences > 1 {
                return Err(WorkflowError::InvalidInput(format!(
                    "resource {} declared more than once",
                    spec.key
                )));
            }
        }

        for rule in &deadline_rules {
            if rule.trigger == rule.satisfied_by {
                return Err(WorkflowError::InvalidInput(format!(
                    "deadline rule {} is satisfied by its own trigger phase {}",
                    rule.kind, rule.trigger
                )));
            }
            if rule.offset_days <= 0 {
                return Err(WorkflowError::InvalidInput(format!(
                    "deadline rule {} must have a positive offset",
                    rule.kind
                )));
            }
        }

        Ok(Self {
            consent_expiry,
            reservation_ttl,
            correction_window,
            deadline_rules,
            resources,
        })
    }

    /// Parses a pathway configuration file (YAML). Unknown keys are
    /// rejected so that typos fail at startup instead of silently
    /// disabling a rule.
    pub fn from_yaml(input: &str) -> WorkflowResult<Self> {
        let raw: PathwayConfigFile = serde_yaml::from_str(input)?;
        Self::new(
            chrono::Duration::days(raw.consent_expiry_days),
            chrono::Duration::minutes(raw.reservation_ttl_minutes),
            chrono::Duration::days(raw.correction_window_days),
            raw.deadlines,
            raw.resources
                .into_iter()
                .map(|r| ResourceSpec {
                    key: ResourceKey::new(r.kind, r.id),
                    capacity: r.capacity,
                })
                .collect(),
        )
    }

    /// How long an outbound consent request stays answerable before it is
    /// treated as non-response.
    pub fn consent_expiry(&self) -> chrono::Duration {
        self.consent_expiry
    }

    /// How long an uncommitted reservation hold lasts.
    pub fn reservation_ttl(&self) -> chrono::Duration {
        self.reservation_ttl
    }

    /// How long after the first decision a clinician may amend it.
    pub fn correction_window(&self) -> chrono::Duration {
        self.correction_window
    }

    pub fn deadline_rules(&self) -> &[DeadlineRule] {
        &self.deadline_rules
    }

    pub fn resources(&self) -> &[ResourceSpec] {
        &self.resources
    }
}

/// On-disk shape of the pathway configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathwayConfigFile {
    consent_expiry_days: i64,
    reservation_ttl_minutes: i64,
    correction_window_days: i64,
    #[serde(default)]
    resources: Vec<ResourceEntry>,
    #[serde(default)]
    deadlines: Vec<DeadlineRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResourceEntry {
    kind: ResourceType,
    id: String,
    capacity: u32,
}

/// The standard rule set for this pathway: a 14-day delivery SLA from
/// prescription approval. Used by tests and as a fallback when a config
/// file declares no deadlines.
pub fn delivery_sla_rule(offset_days: i64) -> DeadlineRule {
    DeadlineRule {
        kind: DeadlineKind::Delivery,
        trigger: Phase::PrescriptionIssued,
        offset_days,
        satisfied_by: Phase::Delivered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"consent_expiry_days: 14
reservation_ttl_minutes: 15
correction_window_days: 7
resources:
  - kind: appointment_slot
    id: slot-2024-03-01-09:00
    capacity: 1
  - kind: inventory_unit
    id: sphere-minus-2-to-minus-4
    capacity: 25
deadlines:
  - kind: delivery
    trigger: prescription_issued
    offset_days: 14
    satisfied_by: delivered
"#;

    #[test]
    fn parses_sample_pathway_file() {
        let cfg = CoreConfig::from_yaml(SAMPLE).expect("parse sample");
        assert_eq!(cfg.consent_expiry(), chrono::Duration::days(14));
        assert_eq!(cfg.reservation_ttl(), chrono::Duration::minutes(15));
        assert_eq!(cfg.resources().len(), 2);
        assert_eq!(cfg.deadline_rules().len(), 1);
        assert_eq!(cfg.deadline_rules()[0].trigger, Phase::PrescriptionIssued);
    }

    #[test]
    fn rejects_unknown_keys() {
        let input = format!("{SAMPLE}unexpected_key: true\n");
        let err = CoreConfig::from_yaml(&input).expect_err("should reject unknown key");
        assert!(matches!(err, WorkflowError::YamlDeserialization(_)));
    }

    #[test]
    fn rejects_zero_capacity() {
        let input = SAMPLE.replace("capacity: 1\n", "capacity: 0\n");
        let err = CoreConfig::from_yaml(&input).expect_err("should reject zero capacity");
        assert!(matches!(err, WorkflowError::InvalidInput(_)));
    }

    #[test]
    fn rejects_non_positive_windows() {
        let input = SAMPLE.replace("consent_expiry_days: 14", "consent_expiry_days: 0");
        assert!(CoreConfig::from_yaml(&input).is_err());
    }

    #[test]
    fn rejects_rule_satisfied_by_its_trigger() {
        let input = SAMPLE.replace("satisfied_by: delivered", "satisfied_by: prescription_issued");
        assert!(CoreConfig::from_yaml(&input).is_err());
    }

    #[test]
    fn rejects_duplicate_resource_keys() {
        let input = SAMPLE.replace(
            "id: sphere-minus-2-to-minus-4",
            "id: slot-2024-03-01-09:00",
        );
        let input = input.replace("kind: inventory_unit", "kind: appointment_slot");
        assert!(CoreConfig::from_yaml(&input).is_err());
    }
}
