//! Consent Gateway Adapter.
//!
//! Reconciles outbound consent requests with asynchronous inbound responses
//! from the external messaging channel. Outbound sends go through the
//! [`ConsentChannel`] trait (the transport itself is a third-party concern);
//! inbound callbacks arrive via [`ConsentGateway::resolve`], which tolerates
//! duplicate and out-of-order delivery — the channel only promises
//! at-least-once.
//!
//! At most one pending request exists per (case, consent type); a new
//! request supersedes an expired or denied predecessor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use visia_types::{CaseId, ChannelRef, ConsentRequestId, ContactHandle};

use crate::config::CoreConfig;
use crate::error::{WorkflowError, WorkflowResult};
use crate::phase::ConsentType;
use crate::store::RecordStore;

/// Status of a consent request.
///
/// `Expired` gates exactly like `Denied` but is kept distinct so reporting
/// can separate guardian non-response from active refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    Pending,
    Granted,
    Denied,
    Expired,
}

impl std::fmt::Display for ConsentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConsentStatus::Pending => "pending",
            ConsentStatus::Granted => "granted",
            ConsentStatus::Denied => "denied",
            ConsentStatus::Expired => "expired",
        };
        write!(f, "{name}")
    }
}

/// Outcome reported by the external channel for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentOutcome {
    Granted,
    Denied,
}

/// One outbound consent request and its resolution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRequest {
    pub id: ConsentRequestId,
    pub case_id: CaseId,
    pub consent_type: ConsentType,
    pub sent_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub channel_ref: ChannelRef,
    pub status: ConsentStatus,
}

/// Result of applying an inbound callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAck {
    /// The request transitioned out of `Pending`.
    Applied {
        case_id: CaseId,
        consent_type: ConsentType,
        outcome: ConsentOutcome,
    },
    /// Duplicate or late callback against an already-resolved or superseded
    /// request; deliberately not an error.
    NoOp,
}

/// Failure reported by the outbound channel transport.
#[derive(Debug, thiserror::Error)]
#[error("consent channel send failed: {0}")]
pub struct ChannelError(pub String);

/// Outbound side of the messaging integration, provided by the collaborator
/// that owns the transport. Send failures are retryable and never fatal to
/// case state.
pub trait ConsentChannel: Send + Sync {
    fn send_request(
        &self,
        target: &ContactHandle,
        request_id: ConsentRequestId,
        consent_type: ConsentType,
    ) -> Result<ChannelRef, ChannelError>;
}

/// Development/default channel: logs the outbound request and fabricates a
/// channel reference. Deployments substitute the real provider adapter.
#[derive(Debug, Default, Clone)]
pub struct LoggingConsentChannel;

impl ConsentChannel for LoggingConsentChannel {
    fn send_request(
        &self,
        target: &ContactHandle,
        request_id: ConsentRequestId,
        consent_type: ConsentType,
    ) -> Result<ChannelRef, ChannelError> {
        let channel_ref = ChannelRef::new();
        tracing::info!(
            %target,
            request = %request_id,
            %consent_type,
            channel_ref = %channel_ref,
            "consent request dispatched"
        );
        Ok(channel_ref)
    }
}

/// Answers the state machine's consent gate. Fakes substitute for this in
/// machine tests.
pub trait ConsentFacts: Send + Sync {
    /// Current status for (case, type), accounting for expiry at `now`.
    /// `None` when no request was ever sent.
    fn consent_status(
        &self,
        case_id: CaseId,
        consent_type: ConsentType,
        now: DateTime<Utc>,
    ) -> Option<ConsentStatus>;
}

type PairKey = (CaseId, ConsentType);

/// Service reconciling outbound requests with inbound resolutions.
pub struct ConsentGateway {
    requests: RecordStore<ConsentRequestId, ConsentRequest>,
    /// Latest request per (case, consent type); earlier ones are superseded.
    by_pair: Mutex<HashMap<PairKey, ConsentRequestId>>,
    by_channel: Mutex<HashMap<ChannelRef, ConsentRequestId>>,
    channel: std::sync::Arc<dyn ConsentChannel>,
    expiry_window: chrono::Duration,
}

impl ConsentGateway {
    pub fn new(channel: std::sync::Arc<dyn ConsentChannel>, config: &CoreConfig) -> Self {
        Self {
            requests: RecordStore::new(),
            by_pair: Mutex::new(HashMap::new()),
            by_channel: Mutex::new(HashMap::new()),
            channel,
            expiry_window: config.consent_expiry(),
        }
    }

    /// Sends a consent request to the guardian, or returns the existing
    /// pending request's id if one is still outstanding (idempotent — a
    /// double-tapped button must not spam the guardian).
    ///
    /// The per-pair slot is claimed under the index lock *before* the
    /// outbound send, so two racing callers for the same (case, type) agree
    /// on one request id and the guardian is messaged once; the send itself
    /// runs outside the critical section.
    ///
    /// # Errors
    ///
    /// `ExternalChannelUnavailable` if the outbound send fails; the claim is
    /// rolled back in that case, so a later retry starts clean.
    pub fn request_consent(
        &self,
        case_id: CaseId,
        consent_type: ConsentType,
        target: &ContactHandle,
        now: DateTime<Utc>,
    ) -> WorkflowResult<ConsentRequestId> {
        let request_id = {
            let mut by_pair = self.by_pair.lock().expect("consent index lock poisoned");
            if let Some(&existing) = by_pair.get(&(case_id, consent_type)) {
                match self.requests.get(&existing) {
                    // A racing caller claimed the slot and its send is still
                    // in flight; that id is the pending request.
                    None => return Ok(existing),
                    Some(current) => {
                        if current.value.status == ConsentStatus::Pending
                            && now < current.value.expires_at
                        {
                            return Ok(existing);
                        }
                        self.lapse_if_expired(existing, now);
                    }
                }
            }
            // Claim the slot before sending; a resolved or expired
            // predecessor is superseded here.
            let id = ConsentRequestId::new();
            by_pair.insert((case_id, consent_type), id);
            id
        };

        match self.channel.send_request(target, request_id, consent_type) {
            Ok(channel_ref) => {
                let request = ConsentRequest {
                    id: request_id,
                    case_id,
                    consent_type,
                    sent_at: now,
                    expires_at: now + self.expiry_window,
                    channel_ref,
                    status: ConsentStatus::Pending,
                };
                // Fresh UUID key; duplicate insert is not reachable.
                let _ = self.requests.insert(request_id, request);
                self.by_channel
                    .lock()
                    .expect("consent index lock poisoned")
                    .insert(channel_ref, request_id);
                Ok(request_id)
            }
            Err(e) => {
                let mut by_pair = self.by_pair.lock().expect("consent index lock poisoned");
                if by_pair.get(&(case_id, consent_type)) == Some(&request_id) {
                    by_pair.remove(&(case_id, consent_type));
                }
                Err(WorkflowError::ExternalChannelUnavailable(e.to_string()))
            }
        }
    }

    /// Applies an inbound callback from the external channel.
    ///
    /// Duplicate callbacks, callbacks for superseded requests, and
    /// callbacks racing past expiry all resolve to [`ResolveAck::NoOp`] —
    /// never an error, and never a second phase-advance trigger.
    ///
    /// # Errors
    ///
    /// `ConsentRequestNotFound` only when the channel reference matches no
    /// request at all (a misdirected callback).
    pub fn resolve(
        &self,
        channel_ref: &ChannelRef,
        outcome: ConsentOutcome,
        now: DateTime<Utc>,
    ) -> WorkflowResult<ResolveAck> {
        let request_id = self
            .by_channel
            .lock()
            .expect("consent index lock poisoned")
            .get(channel_ref)
            .copied()
            .ok_or(WorkflowError::ConsentRequestNotFound)?;

        self.lapse_if_expired(request_id, now);

        let applied = self
            .requests
            .mutate(&request_id, |request| {
                if request.status != ConsentStatus::Pending {
                    return None;
                }
                request.status = match outcome {
                    ConsentOutcome::Granted => ConsentStatus::Granted,
                    ConsentOutcome::Denied => ConsentStatus::Denied,
                };
                Some((request.case_id, request.consent_type))
            })
            .map_err(|_| WorkflowError::ConsentRequestNotFound)?;

        // A resolution against a superseded request is also a no-op.
        if let Some((case_id, consent_type)) = applied {
            let current = self
                .by_pair
                .lock()
                .expect("consent index lock poisoned")
                .get(&(case_id, consent_type))
                .copied();
            if current == Some(request_id) {
                return Ok(ResolveAck::Applied {
                    case_id,
                    consent_type,
                    outcome,
                });
            }
        }
        Ok(ResolveAck::NoOp)
    }

    /// The latest request for (case, type), with lazy expiry applied.
    pub fn request(
        &self,
        case_id: CaseId,
        consent_type: ConsentType,
        now: DateTime<Utc>,
    ) -> Option<ConsentRequest> {
        let request = self.current_request(case_id, consent_type)?;
        self.lapse_if_expired(request.id, now);
        self.requests.get(&request.id).map(|v| v.value)
    }

    /// Actively expires overdue pending requests. The same check runs
    /// lazily on every read; the sweep keeps reporting current for
    /// requests nobody is querying.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for (id, versioned) in self.requests.snapshot() {
            if versioned.value.status == ConsentStatus::Pending
                && now >= versioned.value.expires_at
                && self.lapse_if_expired(id, now)
            {
                expired += 1;
            }
        }
        if expired > 0 {
            tracing::info!(count = expired, "expired unanswered consent requests");
        }
        expired
    }

    fn current_request(&self, case_id: CaseId, consent_type: ConsentType) -> Option<ConsentRequest> {
        let id = *self
            .by_pair
            .lock()
            .expect("consent index lock poisoned")
            .get(&(case_id, consent_type))?;
        self.requests.get(&id).map(|v| v.value)
    }

    /// Flips a pending request past its window to `Expired`. Returns
    /// whether a flip happened.
    fn lapse_if_expired(&self, id: ConsentRequestId, now: DateTime<Utc>) -> bool {
        self.requests
            .mutate(&id, |request| {
                if request.status == ConsentStatus::Pending && now >= request.expires_at {
                    request.status = ConsentStatus::Expired;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false)
    }
}

impl ConsentFacts for ConsentGateway {
    fn consent_status(
        &self,
        case_id: CaseId,
        consent_type: ConsentType,
        now: DateTime<Utc>,
    ) -> Option<ConsentStatus> {
        self.request(case_id, consent_type, now).map(|r| r.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::delivery_sla_rule;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    /// Test double recording outbound sends; can be switched to fail.
    #[derive(Default)]
    struct ScriptedChannel {
        fail: AtomicBool,
        sent: StdMutex<Vec<(ConsentRequestId, ChannelRef)>>,
    }

    impl ConsentChannel for ScriptedChannel {
        fn send_request(
            &self,
            _target: &ContactHandle,
            request_id: ConsentRequestId,
            _consent_type: ConsentType,
        ) -> Result<ChannelRef, ChannelError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ChannelError("provider timeout".into()));
            }
            let channel_ref = ChannelRef::new();
            self.sent
                .lock()
                .expect("test lock")
                .push((request_id, channel_ref));
            Ok(channel_ref)
        }
    }

    fn gateway() -> (ConsentGateway, Arc<ScriptedChannel>) {
        let channel = Arc::new(ScriptedChannel::default());
        let config = CoreConfig::new(
            chrono::Duration::days(14),
            chrono::Duration::minutes(15),
            chrono::Duration::days(7),
            vec![delivery_sla_rule(14)],
            vec![],
        )
        .expect("valid config");
        (
            ConsentGateway::new(channel.clone() as Arc<dyn ConsentChannel>, &config),
            channel,
        )
    }

    fn contact() -> ContactHandle {
        ContactHandle::new("+44700900001").expect("valid handle")
    }

    #[test]
    fn repeated_requests_reuse_the_pending_one() {
        let (gateway, channel) = gateway();
        let case_id = CaseId::new();
        let now = Utc::now();

        let first = gateway
            .request_consent(case_id, ConsentType::Assessment, &contact(), now)
            .expect("first request");
        let second = gateway
            .request_consent(case_id, ConsentType::Assessment, &contact(), now)
            .expect("repeat request");

        assert_eq!(first, second);
        assert_eq!(channel.sent.lock().expect("test lock").len(), 1);
    }

    #[test]
    fn racing_requests_for_one_pair_send_once() {
        let (gateway, channel) = gateway();
        let gateway = Arc::new(gateway);
        let case_id = CaseId::new();
        let now = Utc::now();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let gateway = Arc::clone(&gateway);
                std::thread::spawn(move || {
                    gateway.request_consent(case_id, ConsentType::Assessment, &contact(), now)
                })
            })
            .collect();
        let ids: Vec<ConsentRequestId> = handles
            .into_iter()
            .map(|h| h.join().expect("no panic").expect("request succeeds"))
            .collect();

        // The guardian hears about it exactly once, whichever caller wins.
        assert_eq!(ids[0], ids[1]);
        assert_eq!(channel.sent.lock().expect("test lock").len(), 1);
    }

    #[test]
    fn resolve_applies_once_then_noops() {
        let (gateway, channel) = gateway();
        let case_id = CaseId::new();
        let now = Utc::now();

        gateway
            .request_consent(case_id, ConsentType::Assessment, &contact(), now)
            .expect("request");
        let (_, channel_ref) = channel.sent.lock().expect("test lock")[0];

        let first = gateway
            .resolve(&channel_ref, ConsentOutcome::Granted, now)
            .expect("resolve");
        assert!(matches!(first, ResolveAck::Applied { .. }));

        let second = gateway
            .resolve(&channel_ref, ConsentOutcome::Granted, now)
            .expect("duplicate resolve");
        assert_eq!(second, ResolveAck::NoOp);

        assert_eq!(
            gateway.consent_status(case_id, ConsentType::Assessment, now),
            Some(ConsentStatus::Granted)
        );
    }

    #[test]
    fn unknown_channel_ref_is_an_error() {
        let (gateway, _) = gateway();
        let err = gateway
            .resolve(&ChannelRef::new(), ConsentOutcome::Granted, Utc::now())
            .expect_err("misdirected callback");
        assert!(matches!(err, WorkflowError::ConsentRequestNotFound));
    }

    #[test]
    fn pending_request_expires_and_a_new_one_is_accepted() {
        let (gateway, channel) = gateway();
        let case_id = CaseId::new();
        let now = Utc::now();

        let first = gateway
            .request_consent(case_id, ConsentType::Assessment, &contact(), now)
            .expect("request");

        let later = now + chrono::Duration::days(15);
        assert_eq!(
            gateway.consent_status(case_id, ConsentType::Assessment, later),
            Some(ConsentStatus::Expired)
        );

        // A new request supersedes the expired one.
        let replacement = gateway
            .request_consent(case_id, ConsentType::Assessment, &contact(), later)
            .expect("new request after expiry");
        assert_ne!(first, replacement);
        assert_eq!(channel.sent.lock().expect("test lock").len(), 2);
        assert_eq!(
            gateway.consent_status(case_id, ConsentType::Assessment, later),
            Some(ConsentStatus::Pending)
        );
    }

    #[test]
    fn late_callback_for_superseded_request_is_a_noop() {
        let (gateway, channel) = gateway();
        let case_id = CaseId::new();
        let now = Utc::now();

        gateway
            .request_consent(case_id, ConsentType::Assessment, &contact(), now)
            .expect("request");
        let later = now + chrono::Duration::days(15);
        gateway
            .request_consent(case_id, ConsentType::Assessment, &contact(), later)
            .expect("replacement request");

        // Guardian answers the *old* message after it expired.
        let (_, old_ref) = channel.sent.lock().expect("test lock")[0];
        let ack = gateway
            .resolve(&old_ref, ConsentOutcome::Granted, later)
            .expect("late callback");
        assert_eq!(ack, ResolveAck::NoOp);
        assert_eq!(
            gateway.consent_status(case_id, ConsentType::Assessment, later),
            Some(ConsentStatus::Pending)
        );
    }

    #[test]
    fn send_failure_surfaces_as_channel_unavailable_and_leaves_no_record() {
        let (gateway, channel) = gateway();
        channel.fail.store(true, Ordering::SeqCst);
        let case_id = CaseId::new();
        let now = Utc::now();

        let err = gateway
            .request_consent(case_id, ConsentType::Assessment, &contact(), now)
            .expect_err("send fails");
        assert!(matches!(err, WorkflowError::ExternalChannelUnavailable(_)));
        assert_eq!(
            gateway.consent_status(case_id, ConsentType::Assessment, now),
            None
        );

        // Retry succeeds once the channel recovers.
        channel.fail.store(false, Ordering::SeqCst);
        gateway
            .request_consent(case_id, ConsentType::Assessment, &contact(), now)
            .expect("retry succeeds");
    }

    #[test]
    fn sweep_expires_overdue_requests() {
        let (gateway, _) = gateway();
        let now = Utc::now();
        gateway
            .request_consent(CaseId::new(), ConsentType::Assessment, &contact(), now)
            .expect("request");
        gateway
            .request_consent(CaseId::new(), ConsentType::Dispensing, &contact(), now)
            .expect("request");

        let later = now + chrono::Duration::days(15);
        assert_eq!(gateway.sweep_expired(later), 2);
        assert_eq!(gateway.sweep_expired(later), 0);
    }
}
