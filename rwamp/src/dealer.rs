use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use rwamp_utils::Counter;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::observation::{UriObservation, UriObservationMap};
use crate::topic::{MatchPolicy, Uri, UriError};
use crate::types::{DashMap, ObservationId, Payload, RequestId, RouterError, SessionId};

/// How calls are dispatched when multiple callees are registered for the
/// same procedure. Every policy except `all`/`all-progressive` produces
/// exactly one result or error back to the caller per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvokePolicy {
    #[serde(rename = "single")]
    Single,
    #[serde(rename = "first")]
    First,
    #[serde(rename = "last")]
    Last,
    #[serde(rename = "roundrobin")]
    RoundRobin,
    #[serde(rename = "random")]
    Random,
    #[serde(rename = "all")]
    All,
    #[serde(rename = "all_progressive")]
    AllProgressive,
}

impl Default for InvokePolicy {
    fn default() -> Self {
        InvokePolicy::Single
    }
}

impl InvokePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvokePolicy::Single => "single",
            InvokePolicy::First => "first",
            InvokePolicy::Last => "last",
            InvokePolicy::RoundRobin => "roundrobin",
            InvokePolicy::Random => "random",
            InvokePolicy::All => "all",
            InvokePolicy::AllProgressive => "all_progressive",
        }
    }

    /// Whether further callees may register alongside an existing one.
    #[inline]
    pub fn is_shared(&self) -> bool {
        !matches!(self, InvokePolicy::Single)
    }
}

impl FromStr for InvokePolicy {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, UriError> {
        match s {
            "single" => Ok(InvokePolicy::Single),
            "first" => Ok(InvokePolicy::First),
            "last" => Ok(InvokePolicy::Last),
            "roundrobin" => Ok(InvokePolicy::RoundRobin),
            "random" => Ok(InvokePolicy::Random),
            "all" => Ok(InvokePolicy::All),
            "all_progressive" => Ok(InvokePolicy::AllProgressive),
            _ => Err(UriError::InvalidPolicy(format!("invalid invocation policy `{}`", s))),
        }
    }
}

impl fmt::Display for InvokePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-registration state beyond the observer set: the invocation policy
/// (fixed at first registration) and the round-robin cursor.
#[derive(Debug)]
pub struct RegistrationExtra {
    pub invoke: InvokePolicy,
    roundrobin_current: AtomicUsize,
}

impl RegistrationExtra {
    fn new(invoke: InvokePolicy) -> Self {
        Self { invoke, roundrobin_current: AtomicUsize::new(0) }
    }
}

pub type Registration = UriObservation<RegistrationExtra>;

#[derive(Debug)]
pub struct RegisterAck {
    pub registration: Arc<Registration>,
    pub was_first_callee: bool,
}

pub struct UnregisterAck {
    pub procedure: String,
    pub was_registered: bool,
    pub was_last_callee: bool,
}

/// One forwarded invocation: deliver the call to this callee under this
/// invocation ID and route its yield back through [`Dealer::yield_result`].
#[derive(Debug, Clone)]
pub struct Invocation {
    pub invocation_id: u64,
    pub callee: SessionId,
    pub registration_id: ObservationId,
    pub procedure: String,
}

/// A reply owed to a caller: either (partial or final) results, or an error.
#[derive(Debug, Clone)]
pub struct CallReply {
    pub caller: SessionId,
    pub call_id: RequestId,
    pub outcome: CallOutcome,
}

#[derive(Debug, Clone)]
pub enum CallOutcome {
    Result { results: Vec<Payload>, progress: bool },
    Error { uri: String, message: String },
}

struct Gather {
    remaining: AtomicUsize,
    results: Mutex<Vec<Payload>>,
}

struct PendingInvocation {
    caller: SessionId,
    call_id: RequestId,
    callee: SessionId,
    progressive: bool,
    gather: Option<Arc<Gather>>,
}

/// The RPC half of the router: the realm-scoped registration map, callee
/// selection per invocation policy, and the pending-invocation table
/// correlating callee yields back to callers.
pub struct Dealer {
    registrations: RwLock<UriObservationMap<RegistrationExtra>>,
    invocations: DashMap<u64, PendingInvocation>,
    next_invocation_id: AtomicU64,
    registrations_count: Counter,
    procedures_count: Counter,
}

impl Default for Dealer {
    fn default() -> Self {
        Self {
            registrations: RwLock::new(UriObservationMap::default()),
            invocations: DashMap::default(),
            next_invocation_id: AtomicU64::new(1),
            registrations_count: Counter::new(),
            procedures_count: Counter::new(),
        }
    }
}

impl Dealer {
    /// Register a callee for a procedure. A procedure already registered
    /// under a single-callee policy rejects any further registration; a
    /// multi-callee registration rejects a differing policy and otherwise
    /// appends the callee in registration order.
    pub async fn register(
        &self,
        callee: SessionId,
        procedure: &str,
        policy: MatchPolicy,
        invoke: InvokePolicy,
    ) -> Result<RegisterAck, RouterError> {
        let uri = Uri::from_str(procedure).map_err(|e| RouterError::InvalidUri(e.to_string()))?;
        let mut registrations = self.registrations.write().await;

        if let Some(existing) = registrations.get_observation(procedure, policy) {
            if !existing.extra.invoke.is_shared() {
                return Err(RouterError::ProcedureAlreadyExists(procedure.to_owned()));
            }
            if existing.extra.invoke != invoke {
                return Err(RouterError::InvocationPolicyConflict {
                    procedure: procedure.to_owned(),
                    has: existing.extra.invoke.to_string(),
                    requested: invoke.to_string(),
                });
            }
        }

        let (registration, was_already_registered, was_first_callee) = registrations
            .add_observer(callee, &uri, policy, RegistrationExtra::new(invoke))
            .map_err(|e| RouterError::InvalidUri(e.to_string()))?;
        if was_first_callee {
            self.procedures_count.inc();
        }
        if !was_already_registered {
            self.registrations_count.inc();
        }
        log::debug!(
            "session {} registered {:?} ({}, {}), id: {}",
            callee,
            procedure,
            policy,
            invoke,
            registration.id
        );
        Ok(RegisterAck { registration, was_first_callee })
    }

    pub async fn unregister(
        &self,
        callee: SessionId,
        registration_id: ObservationId,
    ) -> Result<UnregisterAck, RouterError> {
        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .get_observation_by_id(registration_id)
            .ok_or(RouterError::NoSuchRegistration(registration_id))?;
        let (was_registered, was_last_callee) = registrations.drop_observer(callee, &registration);
        if was_registered {
            self.registrations_count.dec();
        }
        if was_last_callee {
            self.procedures_count.dec();
        }
        Ok(UnregisterAck { procedure: registration.uri.clone(), was_registered, was_last_callee })
    }

    pub async fn get_registration(
        &self,
        procedure: &str,
        policy: MatchPolicy,
    ) -> Option<Arc<Registration>> {
        self.registrations.read().await.get_observation(procedure, policy)
    }

    pub async fn get_registration_by_id(&self, id: ObservationId) -> Option<Arc<Registration>> {
        self.registrations.read().await.get_observation_by_id(id)
    }

    /// Route a call: find the best-matching registration, select the
    /// callee(s) per its invocation policy and create one pending invocation
    /// per selected callee. The returned invocations are to be delivered to
    /// the callees by the realm.
    pub async fn begin_call(
        &self,
        caller: SessionId,
        call_id: RequestId,
        procedure: &str,
    ) -> Result<Vec<Invocation>, RouterError> {
        let uri = Uri::from_str(procedure).map_err(|e| RouterError::InvalidUri(e.to_string()))?;
        if uri.is_wildcard() {
            return Err(RouterError::InvalidUri(format!("cannot call pattern `{}`", procedure)));
        }

        let registration = self
            .registrations
            .read()
            .await
            .best_matching_observation(procedure)
            .ok_or_else(|| RouterError::NoSuchProcedure(procedure.to_owned()))?;

        let callees = registration.observers_snapshot();
        if callees.is_empty() {
            // unreachable given the cleanup invariant
            return Err(RouterError::NoSuchProcedure(procedure.to_owned()));
        }

        let selected: Vec<SessionId> = match registration.extra.invoke {
            InvokePolicy::Single | InvokePolicy::First => vec![callees[0]],
            InvokePolicy::Last => vec![callees[callees.len() - 1]],
            InvokePolicy::RoundRobin => {
                let idx = registration.extra.roundrobin_current.fetch_add(1, Ordering::Relaxed);
                vec![callees[idx % callees.len()]]
            }
            InvokePolicy::Random => {
                let idx = rand::rng().random_range(0..callees.len());
                vec![callees[idx]]
            }
            InvokePolicy::All | InvokePolicy::AllProgressive => callees,
        };

        let progressive = registration.extra.invoke == InvokePolicy::AllProgressive;
        let gather = if registration.extra.invoke == InvokePolicy::All {
            Some(Arc::new(Gather {
                remaining: AtomicUsize::new(selected.len()),
                results: Mutex::new(Vec::with_capacity(selected.len())),
            }))
        } else {
            None
        };

        let mut out = Vec::with_capacity(selected.len());
        for callee in selected {
            let invocation_id = self.next_invocation_id.fetch_add(1, Ordering::Relaxed);
            self.invocations.insert(
                invocation_id,
                PendingInvocation { caller, call_id, callee, progressive, gather: gather.clone() },
            );
            out.push(Invocation {
                invocation_id,
                callee,
                registration_id: registration.id,
                procedure: registration.uri.clone(),
            });
        }
        log::debug!(
            "call {} from session {} to {:?} ({}): {} invocation(s)",
            call_id,
            caller,
            procedure,
            registration.extra.invoke,
            out.len()
        );
        Ok(out)
    }

    /// A callee yielded a result for an invocation. Returns the reply owed
    /// to the caller, if this yield produces one: a progressive yield on a
    /// still-open call, the single final result, or (under `all`) the
    /// gathered results once the last callee has yielded.
    pub fn yield_result(
        &self,
        callee: SessionId,
        invocation_id: u64,
        payload: Payload,
        progress: bool,
    ) -> Result<Option<CallReply>, RouterError> {
        let pending = self.invocations.get(&invocation_id).ok_or(RouterError::NoSuchCall(invocation_id))?;
        if pending.callee != callee {
            return Err(RouterError::NoSuchCall(invocation_id));
        }
        let caller = pending.caller;
        let call_id = pending.call_id;
        let progressive = pending.progressive;
        let gather = pending.gather.clone();
        drop(pending);

        if let Some(gather) = gather {
            // gathered mode: only final yields count; no streaming
            if progress {
                return Ok(None);
            }
            gather.results.lock().push(payload);
            self.invocations.remove(&invocation_id);
            if gather.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                let results = std::mem::take(&mut *gather.results.lock());
                return Ok(Some(CallReply {
                    caller,
                    call_id,
                    outcome: CallOutcome::Result { results, progress: false },
                }));
            }
            return Ok(None);
        }

        if progressive {
            // streamed mode: every final callee yield flows to the caller,
            // marked progressive until the last open invocation closes
            if progress {
                return Ok(Some(CallReply {
                    caller,
                    call_id,
                    outcome: CallOutcome::Result { results: vec![payload], progress: true },
                }));
            }
            self.invocations.remove(&invocation_id);
            let still_open = self
                .invocations
                .iter()
                .any(|e| e.value().caller == caller && e.value().call_id == call_id);
            return Ok(Some(CallReply {
                caller,
                call_id,
                outcome: CallOutcome::Result { results: vec![payload], progress: still_open },
            }));
        }

        if progress {
            return Ok(Some(CallReply {
                caller,
                call_id,
                outcome: CallOutcome::Result { results: vec![payload], progress: true },
            }));
        }
        self.invocations.remove(&invocation_id);
        Ok(Some(CallReply { caller, call_id, outcome: CallOutcome::Result { results: vec![payload], progress: false } }))
    }

    /// A callee failed an invocation. The first error wins: it is forwarded
    /// to the caller and any sibling invocations of the same call are
    /// cancelled.
    pub fn yield_error(
        &self,
        callee: SessionId,
        invocation_id: u64,
        error_uri: &str,
        message: &str,
    ) -> Result<Option<CallReply>, RouterError> {
        let pending =
            self.invocations.remove(&invocation_id).ok_or(RouterError::NoSuchCall(invocation_id))?.1;
        if pending.callee != callee {
            self.invocations.insert(invocation_id, pending);
            return Err(RouterError::NoSuchCall(invocation_id));
        }
        self.invocations.retain(|_, p| !(p.caller == pending.caller && p.call_id == pending.call_id));
        Ok(Some(CallReply {
            caller: pending.caller,
            call_id: pending.call_id,
            outcome: CallOutcome::Error { uri: error_uri.to_owned(), message: message.to_owned() },
        }))
    }

    /// Drop every registration a departing session holds. Returns the IDs
    /// of the dropped registrations.
    pub async fn drop_session_registrations(&self, callee: SessionId) -> Vec<ObservationId> {
        let mut registrations = self.registrations.write().await;
        let held: Vec<_> =
            registrations.iter().filter(|r| r.has_observer(callee)).cloned().collect();
        let mut dropped = Vec::with_capacity(held.len());
        for registration in held {
            let (was_registered, was_last) = registrations.drop_observer(callee, &registration);
            if was_registered {
                self.registrations_count.dec();
                dropped.push(registration.id);
            }
            if was_last {
                self.procedures_count.dec();
            }
        }
        dropped
    }

    /// Cancel in-flight invocations involving a departing session. Calls
    /// whose callee left are answered to their callers with
    /// `wamp.error.canceled`; calls whose caller left are discarded.
    pub fn drop_session_invocations(&self, session: SessionId) -> Vec<CallReply> {
        let mut replies = Vec::new();
        let affected: Vec<u64> = self
            .invocations
            .iter()
            .filter(|e| e.value().callee == session || e.value().caller == session)
            .map(|e| *e.key())
            .collect();
        for invocation_id in affected {
            if let Some((_, pending)) = self.invocations.remove(&invocation_id) {
                if pending.callee == session && pending.caller != session {
                    match pending.gather {
                        Some(gather) => {
                            if gather.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                                let results = std::mem::take(&mut *gather.results.lock());
                                replies.push(CallReply {
                                    caller: pending.caller,
                                    call_id: pending.call_id,
                                    outcome: CallOutcome::Result { results, progress: false },
                                });
                            }
                        }
                        None => replies.push(CallReply {
                            caller: pending.caller,
                            call_id: pending.call_id,
                            outcome: CallOutcome::Error {
                                uri: "wamp.error.canceled".to_owned(),
                                message: format!("callee session {} left the realm", session),
                            },
                        }),
                    }
                }
            }
        }
        replies
    }

    #[inline]
    pub fn registrations_count(&self) -> isize {
        self.registrations_count.count()
    }

    #[inline]
    pub fn procedures_count(&self) -> isize {
        self.procedures_count.count()
    }

    #[inline]
    pub fn invocations_inflight(&self) -> usize {
        self.invocations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn single_invocation(dealer: &Dealer, caller: SessionId, call_id: RequestId, procedure: &str) -> Invocation {
        let mut invs = dealer.begin_call(caller, call_id, procedure).await.unwrap();
        assert_eq!(invs.len(), 1);
        invs.pop().unwrap()
    }

    #[tokio::test]
    async fn test_single_policy_conflict() {
        let dealer = Dealer::default();
        dealer.register(1, "com.example.add", MatchPolicy::Exact, InvokePolicy::Single).await.unwrap();

        let err = dealer
            .register(2, "com.example.add", MatchPolicy::Exact, InvokePolicy::Single)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::ProcedureAlreadyExists(_)));
        assert_eq!(err.uri(), "wamp.error.procedure_already_exists");
    }

    #[tokio::test]
    async fn test_invocation_policy_conflict() {
        let dealer = Dealer::default();
        dealer.register(1, "com.example.add", MatchPolicy::Exact, InvokePolicy::RoundRobin).await.unwrap();

        let err = dealer
            .register(2, "com.example.add", MatchPolicy::Exact, InvokePolicy::Random)
            .await
            .unwrap_err();
        assert_eq!(err.uri(), "wamp.error.procedure_exists_with_conflicting_invocation_policy");

        // same shared policy appends
        let ack = dealer
            .register(2, "com.example.add", MatchPolicy::Exact, InvokePolicy::RoundRobin)
            .await
            .unwrap();
        assert!(!ack.was_first_callee);
        assert_eq!(ack.registration.observers_count(), 2);
    }

    #[tokio::test]
    async fn test_round_robin_rotation() {
        let dealer = Dealer::default();
        for callee in [1, 2, 3] {
            dealer.register(callee, "com.example.add", MatchPolicy::Exact, InvokePolicy::RoundRobin).await.unwrap();
        }

        let mut delivered = Vec::new();
        for call_id in 0..6 {
            let inv = single_invocation(&dealer, 10, call_id, "com.example.add").await;
            delivered.push(inv.callee);
            dealer.yield_result(inv.callee, inv.invocation_id, Payload::from("ok"), false).unwrap();
        }
        assert_eq!(delivered, vec![1, 2, 3, 1, 2, 3]);
        assert_eq!(dealer.invocations_inflight(), 0);
    }

    #[tokio::test]
    async fn test_first_and_last() {
        let dealer = Dealer::default();
        for callee in [1, 2, 3] {
            dealer.register(callee, "p.first", MatchPolicy::Exact, InvokePolicy::First).await.unwrap();
            dealer.register(callee, "p.last", MatchPolicy::Exact, InvokePolicy::Last).await.unwrap();
        }
        assert_eq!(single_invocation(&dealer, 10, 1, "p.first").await.callee, 1);
        assert_eq!(single_invocation(&dealer, 10, 2, "p.last").await.callee, 3);
    }

    #[tokio::test]
    async fn test_random_selects_registered_callee() {
        let dealer = Dealer::default();
        for callee in [1, 2, 3] {
            dealer.register(callee, "p.random", MatchPolicy::Exact, InvokePolicy::Random).await.unwrap();
        }
        for call_id in 0..20 {
            let inv = single_invocation(&dealer, 10, call_id, "p.random").await;
            assert!([1, 2, 3].contains(&inv.callee));
            dealer.yield_result(inv.callee, inv.invocation_id, Payload::from("ok"), false).unwrap();
        }
    }

    #[tokio::test]
    async fn test_all_gathers_results() {
        let dealer = Dealer::default();
        for callee in [1, 2, 3] {
            dealer.register(callee, "p.all", MatchPolicy::Exact, InvokePolicy::All).await.unwrap();
        }
        let invs = dealer.begin_call(10, 1, "p.all").await.unwrap();
        assert_eq!(invs.len(), 3);

        let mut reply = None;
        for inv in &invs {
            let r = dealer
                .yield_result(inv.callee, inv.invocation_id, Payload::from(format!("r{}", inv.callee)), false)
                .unwrap();
            if r.is_some() {
                assert!(reply.is_none());
                reply = r;
            }
        }
        let reply = reply.unwrap();
        assert_eq!(reply.caller, 10);
        match reply.outcome {
            CallOutcome::Result { results, progress } => {
                assert!(!progress);
                assert_eq!(results.len(), 3);
            }
            CallOutcome::Error { .. } => panic!("expected gathered result"),
        }
    }

    #[tokio::test]
    async fn test_all_progressive_streams() {
        let dealer = Dealer::default();
        for callee in [1, 2] {
            dealer.register(callee, "p.stream", MatchPolicy::Exact, InvokePolicy::AllProgressive).await.unwrap();
        }
        let invs = dealer.begin_call(10, 1, "p.stream").await.unwrap();

        let first = dealer
            .yield_result(invs[0].callee, invs[0].invocation_id, Payload::from("a"), false)
            .unwrap()
            .unwrap();
        assert!(matches!(first.outcome, CallOutcome::Result { progress: true, .. }));

        let last = dealer
            .yield_result(invs[1].callee, invs[1].invocation_id, Payload::from("b"), false)
            .unwrap()
            .unwrap();
        assert!(matches!(last.outcome, CallOutcome::Result { progress: false, .. }));
    }

    #[tokio::test]
    async fn test_no_such_procedure_and_bad_yield() {
        let dealer = Dealer::default();
        let err = dealer.begin_call(10, 1, "nope.nothing").await.unwrap_err();
        assert_eq!(err.uri(), "wamp.error.no_such_procedure");

        dealer.register(1, "p.q", MatchPolicy::Exact, InvokePolicy::Single).await.unwrap();
        let inv = single_invocation(&dealer, 10, 1, "p.q").await;

        // wrong callee cannot answer
        assert!(dealer.yield_result(99, inv.invocation_id, Payload::from("x"), false).is_err());
        assert_eq!(dealer.invocations_inflight(), 1);

        // a yield consumes the invocation
        dealer.yield_result(1, inv.invocation_id, Payload::from("x"), false).unwrap();
        assert!(dealer.yield_result(1, inv.invocation_id, Payload::from("x"), false).is_err());
    }

    #[tokio::test]
    async fn test_yield_error_propagates() {
        let dealer = Dealer::default();
        dealer.register(1, "p.q", MatchPolicy::Exact, InvokePolicy::Single).await.unwrap();
        let inv = single_invocation(&dealer, 10, 7, "p.q").await;

        let reply = dealer
            .yield_error(1, inv.invocation_id, "com.example.error", "boom")
            .unwrap()
            .unwrap();
        assert_eq!(reply.call_id, 7);
        assert!(matches!(reply.outcome, CallOutcome::Error { ref uri, .. } if uri == "com.example.error"));
    }

    #[tokio::test]
    async fn test_prefix_registration_matches_call() {
        let dealer = Dealer::default();
        dealer.register(1, "com.example", MatchPolicy::Prefix, InvokePolicy::Single).await.unwrap();
        let inv = single_invocation(&dealer, 10, 1, "com.example.sub.proc").await;
        assert_eq!(inv.callee, 1);
    }

    #[tokio::test]
    async fn test_callee_leave_cancels() {
        let dealer = Dealer::default();
        dealer.register(1, "p.q", MatchPolicy::Exact, InvokePolicy::Single).await.unwrap();
        let inv = single_invocation(&dealer, 10, 3, "p.q").await;
        assert_eq!(inv.callee, 1);

        let replies = dealer.drop_session_invocations(1);
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0].outcome, CallOutcome::Error { ref uri, .. } if uri == "wamp.error.canceled"));

        let dropped = dealer.drop_session_registrations(1).await;
        assert_eq!(dropped.len(), 1);
        assert_eq!(dealer.procedures_count(), 0);
    }
}
