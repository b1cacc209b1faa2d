use std::str::FromStr;
use std::sync::Arc;

use rwamp_utils::Counter;
use tokio::sync::RwLock;

use crate::observation::{UriObservation, UriObservationMap};
use crate::topic::{MatchPolicy, Uri};
use crate::types::{ObservationId, RouterError, SessionId};

pub type Subscription = UriObservation<()>;

pub struct SubscribeAck {
    pub subscription: Arc<Subscription>,
    pub was_already_subscribed: bool,
    pub was_first_subscriber: bool,
}

pub struct UnsubscribeAck {
    pub topic: String,
    pub was_subscribed: bool,
    pub was_last_subscriber: bool,
}

/// The pub/sub half of the router: the realm-scoped subscription map plus
/// the match queries a publish is routed with. All mutation goes through a
/// single write lock, serializing operations on the same topic in event
/// order.
pub struct Broker {
    subscriptions: RwLock<UriObservationMap<()>>,
    subscriptions_count: Counter,
    topics_count: Counter,
}

impl Default for Broker {
    fn default() -> Self {
        Self {
            subscriptions: RwLock::new(UriObservationMap::default()),
            subscriptions_count: Counter::new(),
            topics_count: Counter::new(),
        }
    }
}

impl Broker {
    pub async fn subscribe(
        &self,
        subscriber: SessionId,
        topic: &str,
        policy: MatchPolicy,
    ) -> Result<SubscribeAck, RouterError> {
        let uri = Uri::from_str(topic).map_err(|e| RouterError::InvalidUri(e.to_string()))?;
        let (subscription, was_already_subscribed, was_first_subscriber) = self
            .subscriptions
            .write()
            .await
            .add_observer(subscriber, &uri, policy, ())
            .map_err(|e| RouterError::InvalidUri(e.to_string()))?;
        if was_first_subscriber {
            self.topics_count.inc();
        }
        if !was_already_subscribed {
            self.subscriptions_count.inc();
        }
        log::debug!(
            "session {} subscribed to {:?} ({}), id: {}",
            subscriber,
            topic,
            policy,
            subscription.id
        );
        Ok(SubscribeAck { subscription, was_already_subscribed, was_first_subscriber })
    }

    pub async fn unsubscribe(
        &self,
        subscriber: SessionId,
        subscription_id: ObservationId,
    ) -> Result<UnsubscribeAck, RouterError> {
        let mut subscriptions = self.subscriptions.write().await;
        let subscription = subscriptions
            .get_observation_by_id(subscription_id)
            .ok_or(RouterError::NoSuchSubscription(subscription_id))?;
        let (was_subscribed, was_last_subscriber) = subscriptions.drop_observer(subscriber, &subscription);
        if was_subscribed {
            self.subscriptions_count.dec();
        }
        if was_last_subscriber {
            self.topics_count.dec();
        }
        log::debug!("session {} unsubscribed from {:?}, id: {}", subscriber, subscription.uri, subscription.id);
        Ok(UnsubscribeAck { topic: subscription.uri.clone(), was_subscribed, was_last_subscriber })
    }

    /// Exact index lookup for (topic, policy), not a match query.
    pub async fn get_subscription(&self, topic: &str, policy: MatchPolicy) -> Option<Arc<Subscription>> {
        self.subscriptions.read().await.get_observation(topic, policy)
    }

    pub async fn get_subscription_by_id(&self, id: ObservationId) -> Option<Arc<Subscription>> {
        self.subscriptions.read().await.get_observation_by_id(id)
    }

    /// All subscriptions matching the concrete topic, across the three
    /// policies. This is what a publish is dispatched with.
    pub async fn match_subscriptions(&self, topic: &str) -> Result<Vec<Arc<Subscription>>, RouterError> {
        let uri = Uri::from_str(topic).map_err(|e| RouterError::InvalidUri(e.to_string()))?;
        if uri.is_wildcard() {
            return Err(RouterError::InvalidUri(format!("cannot publish to pattern `{}`", topic)));
        }
        Ok(self.subscriptions.read().await.match_observations(topic))
    }

    /// Drop every subscription a departing session holds. Returns the IDs of
    /// the dropped subscriptions.
    pub async fn drop_session(&self, subscriber: SessionId) -> Vec<ObservationId> {
        let mut subscriptions = self.subscriptions.write().await;
        let held: Vec<_> =
            subscriptions.iter().filter(|s| s.has_observer(subscriber)).cloned().collect();
        let mut dropped = Vec::with_capacity(held.len());
        for subscription in held {
            let (was_subscribed, was_last) = subscriptions.drop_observer(subscriber, &subscription);
            if was_subscribed {
                self.subscriptions_count.dec();
                dropped.push(subscription.id);
            }
            if was_last {
                self.topics_count.dec();
            }
        }
        dropped
    }

    #[inline]
    pub fn subscriptions_count(&self) -> isize {
        self.subscriptions_count.count()
    }

    #[inline]
    pub fn topics_count(&self) -> isize {
        self.topics_count.count()
    }

    #[cfg(test)]
    pub(crate) async fn check_invariants(&self) -> bool {
        self.subscriptions.read().await.check_invariants()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_publish_match() {
        let broker = Broker::default();
        let ack = broker.subscribe(1, "com.example.topic1", MatchPolicy::Exact).await.unwrap();
        assert!(ack.was_first_subscriber);
        assert!(!ack.was_already_subscribed);

        let matched = broker.match_subscriptions("com.example.topic1").await.unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, ack.subscription.id);

        let ack2 = broker.subscribe(1, "com.example.topic1", MatchPolicy::Exact).await.unwrap();
        assert!(ack2.was_already_subscribed);
        assert_eq!(ack2.subscription.observers_count(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_cleanup() {
        let broker = Broker::default();
        let ack = broker.subscribe(1, "a.b", MatchPolicy::Exact).await.unwrap();
        broker.subscribe(2, "a.b", MatchPolicy::Exact).await.unwrap();

        let un = broker.unsubscribe(1, ack.subscription.id).await.unwrap();
        assert!(un.was_subscribed);
        assert!(!un.was_last_subscriber);

        let un = broker.unsubscribe(2, ack.subscription.id).await.unwrap();
        assert!(un.was_last_subscriber);
        assert_eq!(broker.subscriptions_count(), 0);
        assert_eq!(broker.topics_count(), 0);
        assert!(broker.check_invariants().await);

        assert!(matches!(
            broker.unsubscribe(2, ack.subscription.id).await,
            Err(RouterError::NoSuchSubscription(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_to_pattern_rejected() {
        let broker = Broker::default();
        assert!(matches!(
            broker.match_subscriptions("com.example..create").await,
            Err(RouterError::InvalidUri(_))
        ));
        assert!(matches!(broker.match_subscriptions("").await, Err(RouterError::InvalidUri(_))));
    }

    #[tokio::test]
    async fn test_drop_session() {
        let broker = Broker::default();
        broker.subscribe(1, "a.b", MatchPolicy::Exact).await.unwrap();
        broker.subscribe(1, "a.c", MatchPolicy::Exact).await.unwrap();
        broker.subscribe(2, "a.b", MatchPolicy::Exact).await.unwrap();

        let dropped = broker.drop_session(1).await;
        assert_eq!(dropped.len(), 2);
        assert_eq!(broker.subscriptions_count(), 1);
        assert_eq!(broker.topics_count(), 1);
        assert!(broker.check_invariants().await);
    }
}
