use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use rwamp_utils::Counter;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::broker::{Broker, SubscribeAck, UnsubscribeAck};
use crate::dealer::{
    CallOutcome, CallReply, Dealer, InvokePolicy, RegisterAck, UnregisterAck,
};
use crate::topic::MatchPolicy;
use crate::types::{
    AuthId, AuthRole, DashMap, HashMap, HashSet, ObservationId, Payload, RequestId, RouterError,
    SessionId, TopicName,
};

/// Messages a realm pushes to a joined session's transport channel.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    /// An event published to a topic this session subscribes to.
    Event {
        subscription_id: ObservationId,
        publication_id: u64,
        topic: TopicName,
        payload: Payload,
    },
    /// An invocation of a procedure this session is registered for.
    Invocation {
        invocation_id: u64,
        registration_id: ObservationId,
        procedure: TopicName,
        payload: Payload,
    },
    /// A (partial or final) result for a call this session issued.
    CallResult { call_id: RequestId, results: Vec<Payload>, progress: bool },
    /// An error reply for a call this session issued.
    CallError { call_id: RequestId, uri: String, message: String },
}

pub type SessionTx = mpsc::UnboundedSender<SessionMessage>;

/// Source of realm/role topology and of dynamic authenticators. The router
/// core consults it during authentication; a node embedding the router
/// provides the implementation.
#[async_trait]
pub trait RealmContainer: Send + Sync {
    async fn has_realm(&self, realm: &str) -> bool;

    async fn has_role(&self, realm: &str, role: &str) -> bool;

    /// Invoke a dynamic authenticator procedure for the given realm. The
    /// details value carries the in-flight handshake (authid, method,
    /// credentials); the returned value is the assigned principal.
    async fn call_authenticator(
        &self,
        realm: &str,
        procedure: &str,
        details: Value,
    ) -> anyhow::Result<Value>;
}

/// Fixed realm/role topology, configured up front. Carries no dynamic
/// authenticators.
pub struct StaticRealmContainer {
    realms: RwLock<HashMap<String, HashSet<String>>>,
}

impl Default for StaticRealmContainer {
    fn default() -> Self {
        Self { realms: RwLock::new(HashMap::default()) }
    }
}

impl StaticRealmContainer {
    pub fn add_realm<'a>(&self, realm: &str, roles: impl IntoIterator<Item = &'a str>) {
        self.realms
            .write()
            .entry(realm.to_owned())
            .or_default()
            .extend(roles.into_iter().map(|r| r.to_owned()));
    }
}

#[async_trait]
impl RealmContainer for StaticRealmContainer {
    async fn has_realm(&self, realm: &str) -> bool {
        let realms = self.realms.read();
        // an unconfigured container admits any realm
        realms.is_empty() || realms.contains_key(realm)
    }

    async fn has_role(&self, realm: &str, role: &str) -> bool {
        let realms = self.realms.read();
        if realms.is_empty() {
            return true;
        }
        realms.get(realm).map(|roles| roles.contains(role)).unwrap_or(false)
    }

    async fn call_authenticator(
        &self,
        realm: &str,
        procedure: &str,
        _details: Value,
    ) -> anyhow::Result<Value> {
        Err(anyhow::anyhow!(
            "no dynamic authenticator {:?} available in realm {:?}",
            procedure,
            realm
        ))
    }
}

struct SessionEntry {
    authid: AuthId,
    authrole: AuthRole,
    tx: SessionTx,
}

pub struct PublishAck {
    pub publication_id: u64,
    pub receivers: usize,
}

pub struct LeaveSummary {
    pub dropped_subscriptions: Vec<ObservationId>,
    pub dropped_registrations: Vec<ObservationId>,
    pub cancelled_calls: usize,
}

/// An isolated routing domain: its own session table, subscription map and
/// registration map. Nothing routes across realms.
pub struct Realm {
    name: String,
    container: Arc<dyn RealmContainer>,
    broker: Broker,
    dealer: Dealer,
    sessions: DashMap<SessionId, SessionEntry>,
    next_publication_id: AtomicU64,
    sessions_count: Counter,
}

/// Fresh router-scoped session ID, drawn from the WAMP 53-bit ID space.
pub fn generate_session_id() -> SessionId {
    rand::rng().random_range(1..(1u64 << 53))
}

impl Realm {
    pub fn new(name: &str, container: Arc<dyn RealmContainer>) -> Self {
        Self {
            name: name.to_owned(),
            container,
            broker: Broker::default(),
            dealer: Dealer::default(),
            sessions: DashMap::default(),
            next_publication_id: AtomicU64::new(1),
            sessions_count: Counter::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn container(&self) -> &Arc<dyn RealmContainer> {
        &self.container
    }

    #[inline]
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    #[inline]
    pub fn dealer(&self) -> &Dealer {
        &self.dealer
    }

    /// Attach an authenticated session to the realm.
    pub async fn join(
        &self,
        session_id: SessionId,
        authid: &str,
        authrole: &str,
        tx: SessionTx,
    ) -> Result<(), RouterError> {
        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(session_id) {
            Entry::Occupied(_) => {
                Err(RouterError::NotAuthorized(format!("session {} already joined", session_id)))
            }
            Entry::Vacant(e) => {
                e.insert(SessionEntry {
                    authid: AuthId::from(authid),
                    authrole: AuthRole::from(authrole),
                    tx,
                });
                self.sessions_count.inc();
                log::info!(
                    "session {} joined realm {:?} as authid {:?}, authrole {:?}",
                    session_id,
                    self.name,
                    authid,
                    authrole
                );
                Ok(())
            }
        }
    }

    /// Detach a session, dropping everything it holds: subscriptions,
    /// registrations and in-flight invocations. Callers of calls the
    /// departing session was serving get a cancellation error.
    pub async fn leave(&self, session_id: SessionId) -> Result<LeaveSummary, RouterError> {
        let (_, _entry) =
            self.sessions.remove(&session_id).ok_or(RouterError::NoSuchSession(session_id))?;
        self.sessions_count.dec();

        let dropped_subscriptions = self.broker.drop_session(session_id).await;
        let dropped_registrations = self.dealer.drop_session_registrations(session_id).await;
        let cancel_replies = self.dealer.drop_session_invocations(session_id);
        let cancelled_calls = cancel_replies.len();
        for reply in cancel_replies {
            self.deliver_reply(reply);
        }
        log::info!(
            "session {} left realm {:?}: {} subscription(s), {} registration(s) dropped",
            session_id,
            self.name,
            dropped_subscriptions.len(),
            dropped_registrations.len()
        );
        Ok(LeaveSummary { dropped_subscriptions, dropped_registrations, cancelled_calls })
    }

    #[inline]
    pub fn is_joined(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn session_auth(&self, session_id: SessionId) -> Option<(AuthId, AuthRole)> {
        self.sessions.get(&session_id).map(|e| (e.authid.clone(), e.authrole.clone()))
    }

    fn check_joined(&self, session_id: SessionId) -> Result<(), RouterError> {
        if self.sessions.contains_key(&session_id) {
            Ok(())
        } else {
            Err(RouterError::NoSuchSession(session_id))
        }
    }

    pub async fn subscribe(
        &self,
        session_id: SessionId,
        topic: &str,
        policy: MatchPolicy,
    ) -> Result<SubscribeAck, RouterError> {
        self.check_joined(session_id)?;
        self.broker.subscribe(session_id, topic, policy).await
    }

    pub async fn unsubscribe(
        &self,
        session_id: SessionId,
        subscription_id: ObservationId,
    ) -> Result<UnsubscribeAck, RouterError> {
        self.check_joined(session_id)?;
        self.broker.unsubscribe(session_id, subscription_id).await
    }

    /// Publish an event to every session whose subscription matches the
    /// topic. The publisher itself is excluded unless `exclude_me` is false.
    /// Delivery is fan-out over a snapshot of the matched observer sets; a
    /// session whose channel has gone away is skipped.
    pub async fn publish(
        &self,
        publisher: SessionId,
        topic: &str,
        payload: Payload,
        exclude_me: bool,
    ) -> Result<PublishAck, RouterError> {
        self.check_joined(publisher)?;
        let matched = self.broker.match_subscriptions(topic).await?;
        let publication_id = self.next_publication_id.fetch_add(1, Ordering::Relaxed);
        let topic = TopicName::from(topic);

        let mut receivers = 0;
        for subscription in matched {
            for observer in subscription.observers_snapshot() {
                if exclude_me && observer == publisher {
                    continue;
                }
                let msg = SessionMessage::Event {
                    subscription_id: subscription.id,
                    publication_id,
                    topic: topic.clone(),
                    payload: payload.clone(),
                };
                if self.deliver(observer, msg) {
                    receivers += 1;
                }
            }
        }
        log::debug!(
            "publication {} to {:?} in realm {:?}: {} receiver(s)",
            publication_id,
            topic,
            self.name,
            receivers
        );
        Ok(PublishAck { publication_id, receivers })
    }

    pub async fn register(
        &self,
        session_id: SessionId,
        procedure: &str,
        policy: MatchPolicy,
        invoke: InvokePolicy,
    ) -> Result<RegisterAck, RouterError> {
        self.check_joined(session_id)?;
        self.dealer.register(session_id, procedure, policy, invoke).await
    }

    pub async fn unregister(
        &self,
        session_id: SessionId,
        registration_id: ObservationId,
    ) -> Result<UnregisterAck, RouterError> {
        self.check_joined(session_id)?;
        self.dealer.unregister(session_id, registration_id).await
    }

    /// Issue a call: select callee(s) per the registration's invocation
    /// policy and deliver one invocation message to each. Results flow back
    /// through [`Realm::yield_result`].
    pub async fn call(
        &self,
        caller: SessionId,
        call_id: RequestId,
        procedure: &str,
        payload: Payload,
    ) -> Result<(), RouterError> {
        self.check_joined(caller)?;
        let invocations = self.dealer.begin_call(caller, call_id, procedure).await?;
        for inv in invocations {
            let msg = SessionMessage::Invocation {
                invocation_id: inv.invocation_id,
                registration_id: inv.registration_id,
                procedure: TopicName::from(inv.procedure.as_str()),
                payload: payload.clone(),
            };
            if !self.deliver(inv.callee, msg) {
                log::warn!(
                    "invocation {} for call {} undeliverable, callee session {} gone",
                    inv.invocation_id,
                    call_id,
                    inv.callee
                );
            }
        }
        Ok(())
    }

    /// Route a callee's yield back to the caller.
    pub fn yield_result(
        &self,
        callee: SessionId,
        invocation_id: u64,
        payload: Payload,
        progress: bool,
    ) -> Result<(), RouterError> {
        if let Some(reply) = self.dealer.yield_result(callee, invocation_id, payload, progress)? {
            self.deliver_reply(reply);
        }
        Ok(())
    }

    /// Route a callee's error back to the caller, cancelling sibling
    /// invocations of the same call.
    pub fn yield_error(
        &self,
        callee: SessionId,
        invocation_id: u64,
        error_uri: &str,
        message: &str,
    ) -> Result<(), RouterError> {
        if let Some(reply) = self.dealer.yield_error(callee, invocation_id, error_uri, message)? {
            self.deliver_reply(reply);
        }
        Ok(())
    }

    fn deliver_reply(&self, reply: CallReply) {
        let msg = match reply.outcome {
            CallOutcome::Result { results, progress } => {
                SessionMessage::CallResult { call_id: reply.call_id, results, progress }
            }
            CallOutcome::Error { uri, message } => {
                SessionMessage::CallError { call_id: reply.call_id, uri, message }
            }
        };
        self.deliver(reply.caller, msg);
    }

    fn deliver(&self, session_id: SessionId, msg: SessionMessage) -> bool {
        match self.sessions.get(&session_id) {
            Some(entry) => entry.tx.send(msg).is_ok(),
            None => false,
        }
    }

    #[inline]
    pub fn sessions_count(&self) -> isize {
        self.sessions_count.count()
    }
}
