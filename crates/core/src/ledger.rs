//! Resource Ledger.
//!
//! Tracks finite, reservable resources: appointment slots and glasses
//! inventory buckets. The ledger is the single writer of capacity counts.
//! A reservation starts as a `held` claim with a TTL; it either gets
//! committed by the coordinator once the associated phase transition is
//! durable, or it lapses (explicit release, or expiry) and its capacity
//! returns to the pool.
//!
//! Invariant, enforced inside every per-key mutation: for each resource key,
//! unexpired held + committed reservations never exceed capacity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use visia_types::{CaseId, ReservationId};

use crate::config::CoreConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::phase::{ResourceKey, ResourceType};
use crate::store::{RecordStore, StoreError};

/// Lifecycle of a claim on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Claimed but not yet confirmed; counts against capacity until it
    /// expires or is released.
    Held,
    /// Confirmed; counts against capacity until released.
    Committed,
    /// No longer counts against capacity.
    Released,
}

/// A time-bounded claim on a resource, tied to exactly one case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub case_id: CaseId,
    pub state: ReservationState,
    pub held_at: DateTime<Utc>,
    /// Holds lapse at this instant unless committed first.
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    /// Whether this reservation currently occupies capacity.
    fn occupies(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            ReservationState::Committed => true,
            ReservationState::Held => now < self.expires_at,
            ReservationState::Released => false,
        }
    }
}

/// One record per resource key: its capacity and every reservation ever
/// made against it (lapsed ones stay for audit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub key: ResourceKey,
    pub capacity: u32,
    pub reservations: Vec<Reservation>,
}

impl ResourceRecord {
    fn occupied(&self, now: DateTime<Utc>) -> usize {
        self.reservations.iter().filter(|r| r.occupies(now)).count()
    }

    /// Flips holds past their TTL to `Released`. Called lazily at the start
    /// of every mutation so capacity checks never count stale holds.
    fn lapse_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut lapsed = 0;
        for reservation in &mut self.reservations {
            if reservation.state == ReservationState::Held && now >= reservation.expires_at {
                reservation.state = ReservationState::Released;
                lapsed += 1;
            }
        }
        lapsed
    }
}

/// Answers the state machine's question "does this case hold an active
/// reservation of this type?" without exposing ledger internals. Fakes
/// substitute for this in machine tests.
pub trait ReservationFacts: Send + Sync {
    fn has_active_reservation(
        &self,
        case_id: CaseId,
        resource_type: ResourceType,
        now: DateTime<Utc>,
    ) -> bool;
}

/// Service managing reservations over all declared resources.
#[derive(Debug)]
pub struct ResourceLedger {
    records: RecordStore<ResourceKey, ResourceRecord>,
    /// Reservation id -> resource key, so commit/release need not scan.
    index: Mutex<HashMap<ReservationId, ResourceKey>>,
    reservation_ttl: chrono::Duration,
}

impl ResourceLedger {
    /// Builds the ledger with the resources declared in configuration.
    pub fn new(config: &CoreConfig) -> Self {
        let records = RecordStore::new();
        for spec in config.resources() {
            // Config validation already rejected duplicates.
            let _ = records.insert(
                spec.key.clone(),
                ResourceRecord {
                    key: spec.key.clone(),
                    capacity: spec.capacity,
                    reservations: Vec::new(),
                },
            );
        }
        Self {
            records,
            index: Mutex::new(HashMap::new()),
            reservation_ttl: config.reservation_ttl(),
        }
    }

    /// Declares an additional resource at runtime (e.g. a newly published
    /// clinic date).
    pub fn define_resource(&self, key: ResourceKey, capacity: u32) -> WorkflowResult<()> {
        if capacity == 0 {
            return Err(WorkflowError::InvalidInput(format!(
                "resource {key} declares zero capacity"
            )));
        }
        self.records
            .insert(
                key.clone(),
                ResourceRecord {
                    key: key.clone(),
                    capacity,
                    reservations: Vec::new(),
                },
            )
            .map_err(|_| WorkflowError::InvalidInput(format!("resource {key} already declared")))
    }

    /// Places a `held` claim on `key` for `case_id`.
    ///
    /// The capacity check and the insertion happen inside the same per-key
    /// critical section, so two racing callers for the last unit cannot
    /// both succeed.
    ///
    /// # Errors
    ///
    /// `CapacityExceeded` when every unit is held or committed;
    /// `InvalidInput` for an undeclared resource key.
    pub fn reserve(
        &self,
        key: &ResourceKey,
        case_id: CaseId,
        now: DateTime<Utc>,
    ) -> WorkflowResult<ReservationId> {
        let ttl = self.reservation_ttl;
        let outcome = self
            .records
            .mutate(key, |record| {
                record.lapse_expired(now);
                if record.occupied(now) >= record.capacity as usize {
                    return None;
                }
                let reservation = Reservation {
                    id: ReservationId::new(),
                    case_id,
                    state: ReservationState::Held,
                    held_at: now,
                    expires_at: now + ttl,
                };
                let id = reservation.id;
                record.reservations.push(reservation);
                Some(id)
            })
            .map_err(|_| WorkflowError::InvalidInput(format!("unknown resource key {key}")))?;

        match outcome {
            Some(id) => {
                self.index
                    .lock()
                    .expect("ledger index lock poisoned")
                    .insert(id, key.clone());
                tracing::debug!(reservation = %id, resource = %key, case = %case_id, "reserved");
                Ok(id)
            }
            None => Err(WorkflowError::CapacityExceeded { key: key.clone() }),
        }
    }

    /// Confirms a held reservation. Idempotent: committing an
    /// already-committed reservation is a no-op success.
    ///
    /// # Errors
    ///
    /// `ReservationExpired` if the hold lapsed (or was released) before
    /// commit — the caller must re-reserve. `ReservationNotFound` for an
    /// unknown id.
    pub fn commit(&self, id: ReservationId, now: DateTime<Utc>) -> WorkflowResult<()> {
        let key = self.key_for(id)?;
        let committed = self
            .records
            .mutate(&key, |record| {
                record.lapse_expired(now);
                let reservation = record.reservations.iter_mut().find(|r| r.id == id)?;
                match reservation.state {
                    ReservationState::Committed => Some(true),
                    ReservationState::Held => {
                        reservation.state = ReservationState::Committed;
                        Some(true)
                    }
                    ReservationState::Released => Some(false),
                }
            })
            .map_err(store_missing(id))?;

        match committed {
            Some(true) => Ok(()),
            Some(false) => Err(WorkflowError::ReservationExpired(id)),
            None => Err(WorkflowError::ReservationNotFound(id)),
        }
    }

    /// Releases a reservation, returning its capacity to the pool.
    /// Idempotent: releasing an already-released (or expired) reservation
    /// succeeds — the compensation path may run twice.
    pub fn release(&self, id: ReservationId, now: DateTime<Utc>) -> WorkflowResult<()> {
        let key = self.key_for(id)?;
        let found = self
            .records
            .mutate(&key, |record| {
                record.lapse_expired(now);
                match record.reservations.iter_mut().find(|r| r.id == id) {
                    Some(reservation) => {
                        reservation.state = ReservationState::Released;
                        true
                    }
                    None => false,
                }
            })
            .map_err(store_missing(id))?;

        if found {
            Ok(())
        } else {
            Err(WorkflowError::ReservationNotFound(id))
        }
    }

    /// Actively lapses expired holds across all resources. The same check
    /// runs lazily on every mutation; this sweep exists so capacity frees
    /// up even for keys nobody is touching.
    ///
    /// Released reservations are also dropped from the id lookup index so
    /// it does not grow without bound; their rows stay on the resource
    /// record for audit, but the id can no longer be committed, released,
    /// or read back.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut lapsed = 0;
        let mut stale: Vec<ReservationId> = Vec::new();
        for (key, _) in self.records.snapshot() {
            if let Ok(n) = self.records.mutate(&key, |record| {
                let n = record.lapse_expired(now);
                stale.extend(
                    record
                        .reservations
                        .iter()
                        .filter(|r| r.state == ReservationState::Released)
                        .map(|r| r.id),
                );
                n
            }) {
                lapsed += n;
            }
        }
        if !stale.is_empty() {
            let mut index = self.index.lock().expect("ledger index lock poisoned");
            for id in &stale {
                index.remove(id);
            }
        }
        if lapsed > 0 {
            tracing::info!(count = lapsed, "lapsed expired reservation holds");
        }
        lapsed
    }

    /// Reads a reservation by id.
    pub fn reservation(&self, id: ReservationId) -> WorkflowResult<Reservation> {
        let key = self.key_for(id)?;
        let record = self
            .records
            .get(&key)
            .ok_or(WorkflowError::ReservationNotFound(id))?;
        record
            .value
            .reservations
            .into_iter()
            .find(|r| r.id == id)
            .ok_or(WorkflowError::ReservationNotFound(id))
    }

    /// Remaining free units for a resource key.
    pub fn available(&self, key: &ResourceKey, now: DateTime<Utc>) -> WorkflowResult<u32> {
        let record = self
            .records
            .get(key)
            .ok_or_else(|| WorkflowError::InvalidInput(format!("unknown resource key {key}")))?;
        let occupied = record.value.occupied(now) as u32;
        Ok(record.value.capacity.saturating_sub(occupied))
    }

    fn key_for(&self, id: ReservationId) -> WorkflowResult<ResourceKey> {
        self.index
            .lock()
            .expect("ledger index lock poisoned")
            .get(&id)
            .cloned()
            .ok_or(WorkflowError::ReservationNotFound(id))
    }
}

impl ReservationFacts for ResourceLedger {
    fn has_active_reservation(
        &self,
        case_id: CaseId,
        resource_type: ResourceType,
        now: DateTime<Utc>,
    ) -> bool {
        self.records.snapshot().into_iter().any(|(key, record)| {
            key.kind == resource_type
                && record
                    .value
                    .reservations
                    .iter()
                    .any(|r| r.case_id == case_id && r.occupies(now))
        })
    }
}

fn store_missing(id: ReservationId) -> impl Fn(StoreError) -> WorkflowError {
    move |_| WorkflowError::ReservationNotFound(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{delivery_sla_rule, ResourceSpec};
    use std::sync::Arc;
    use std::thread;

    fn config_with(resources: Vec<ResourceSpec>) -> CoreConfig {
        CoreConfig::new(
            chrono::Duration::days(14),
            chrono::Duration::minutes(15),
            chrono::Duration::days(7),
            vec![delivery_sla_rule(14)],
            resources,
        )
        .expect("valid config")
    }

    fn slot(id: &str) -> ResourceKey {
        ResourceKey::new(ResourceType::AppointmentSlot, id)
    }

    fn single_slot_ledger() -> (ResourceLedger, ResourceKey) {
        let key = slot("slot-2024-03-01-09:00");
        let ledger = ResourceLedger::new(&config_with(vec![ResourceSpec {
            key: key.clone(),
            capacity: 1,
        }]));
        (ledger, key)
    }

    #[test]
    fn reserve_respects_capacity() {
        let (ledger, key) = single_slot_ledger();
        let now = Utc::now();

        ledger.reserve(&key, CaseId::new(), now).expect("first hold");
        let err = ledger
            .reserve(&key, CaseId::new(), now)
            .expect_err("second hold must fail");
        assert!(matches!(err, WorkflowError::CapacityExceeded { .. }));
    }

    #[test]
    fn concurrent_reserves_grant_exactly_one() {
        let (ledger, key) = single_slot_ledger();
        let ledger = Arc::new(ledger);
        let now = Utc::now();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let key = key.clone();
                thread::spawn(move || ledger.reserve(&key, CaseId::new(), now))
            })
            .collect();

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .collect();
        let granted = results.iter().filter(|r| r.is_ok()).count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(WorkflowError::CapacityExceeded { .. })))
            .count();
        assert_eq!((granted, refused), (1, 1));
    }

    #[test]
    fn expired_hold_frees_capacity_for_a_new_reserve() {
        let (ledger, key) = single_slot_ledger();
        let now = Utc::now();
        let original = ledger.reserve(&key, CaseId::new(), now).expect("hold");

        let later = now + chrono::Duration::minutes(16);
        let replacement = ledger
            .reserve(&key, CaseId::new(), later)
            .expect("hold after expiry");
        assert_ne!(original, replacement);

        // The lapsed hold can no longer be committed by its original caller.
        let err = ledger
            .commit(original, later)
            .expect_err("commit after expiry");
        assert!(matches!(err, WorkflowError::ReservationExpired(_)));
    }

    #[test]
    fn commit_is_idempotent() {
        let (ledger, key) = single_slot_ledger();
        let now = Utc::now();
        let id = ledger.reserve(&key, CaseId::new(), now).expect("hold");

        ledger.commit(id, now).expect("first commit");
        ledger.commit(id, now).expect("second commit is a no-op");
        assert_eq!(
            ledger.reservation(id).expect("reservation").state,
            ReservationState::Committed
        );
    }

    #[test]
    fn committed_reservation_does_not_expire() {
        let (ledger, key) = single_slot_ledger();
        let now = Utc::now();
        let id = ledger.reserve(&key, CaseId::new(), now).expect("hold");
        ledger.commit(id, now).expect("commit");

        let much_later = now + chrono::Duration::days(2);
        assert_eq!(ledger.sweep_expired(much_later), 0);
        let err = ledger
            .reserve(&key, CaseId::new(), much_later)
            .expect_err("capacity still taken");
        assert!(matches!(err, WorkflowError::CapacityExceeded { .. }));
    }

    #[test]
    fn release_is_idempotent_and_frees_capacity() {
        let (ledger, key) = single_slot_ledger();
        let now = Utc::now();
        let id = ledger.reserve(&key, CaseId::new(), now).expect("hold");

        ledger.release(id, now).expect("first release");
        ledger.release(id, now).expect("second release succeeds");
        assert_eq!(ledger.available(&key, now).expect("available"), 1);
    }

    #[test]
    fn sweep_lapses_stale_holds() {
        let (ledger, key) = single_slot_ledger();
        let now = Utc::now();
        ledger.reserve(&key, CaseId::new(), now).expect("hold");

        let later = now + chrono::Duration::hours(1);
        assert_eq!(ledger.sweep_expired(later), 1);
        // Re-sweeping finds nothing new.
        assert_eq!(ledger.sweep_expired(later), 0);
        assert_eq!(ledger.available(&key, later).expect("available"), 1);
    }

    #[test]
    fn sweep_forgets_released_reservation_ids() {
        let (ledger, key) = single_slot_ledger();
        let now = Utc::now();
        let released = ledger.reserve(&key, CaseId::new(), now).expect("hold");
        ledger.release(released, now).expect("release");
        let committed = ledger.reserve(&key, CaseId::new(), now).expect("hold");
        ledger.commit(committed, now).expect("commit");

        ledger.sweep_expired(now);

        // The released id is gone from the index; the live one is not.
        let err = ledger
            .reservation(released)
            .expect_err("released id forgotten");
        assert!(matches!(err, WorkflowError::ReservationNotFound(_)));
        assert_eq!(
            ledger.reservation(committed).expect("still tracked").state,
            ReservationState::Committed
        );
        assert_eq!(ledger.available(&key, now).expect("available"), 0);
    }

    #[test]
    fn reservation_facts_sees_held_and_committed_claims() {
        let (ledger, key) = single_slot_ledger();
        let now = Utc::now();
        let case_id = CaseId::new();

        assert!(!ledger.has_active_reservation(case_id, ResourceType::AppointmentSlot, now));
        let id = ledger.reserve(&key, case_id, now).expect("hold");
        assert!(ledger.has_active_reservation(case_id, ResourceType::AppointmentSlot, now));

        ledger.commit(id, now).expect("commit");
        assert!(ledger.has_active_reservation(case_id, ResourceType::AppointmentSlot, now));

        // But an expired hold of another case never counts.
        assert!(!ledger.has_active_reservation(CaseId::new(), ResourceType::AppointmentSlot, now));
    }

    #[test]
    fn unknown_resource_key_is_rejected() {
        let (ledger, _) = single_slot_ledger();
        let err = ledger
            .reserve(&slot("slot-that-does-not-exist"), CaseId::new(), Utc::now())
            .expect_err("unknown key");
        assert!(matches!(err, WorkflowError::InvalidInput(_)));
    }

    #[test]
    fn define_resource_rejects_duplicates_and_zero_capacity() {
        let (ledger, key) = single_slot_ledger();
        assert!(ledger.define_resource(key, 2).is_err());
        assert!(ledger
            .define_resource(slot("slot-2024-03-02-09:00"), 0)
            .is_err());
        assert!(ledger
            .define_resource(slot("slot-2024-03-02-09:00"), 2)
            .is_ok());
    }
}
