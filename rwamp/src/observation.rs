use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rwamp_utils::{timestamp_millis, TimestampMillis};

use crate::matcher::WildcardMatcher;
use crate::topic::{MatchPolicy, Uri, UriError};
use crate::trie::PrefixTrie;
use crate::types::{HashMap, HashSet, ObservationId, SessionId};

static NEXT_OBSERVATION_ID: AtomicU64 = AtomicU64::new(1);

#[inline]
fn next_observation_id() -> ObservationId {
    NEXT_OBSERVATION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Insertion-ordered set of session handles. Ordering matters on the dealer
/// side, where invocation policies pick callees by registration order.
#[derive(Debug, Default)]
pub struct OrderedSet<T> {
    list: Vec<T>,
    set: HashSet<T>,
}

impl<T: std::hash::Hash + Eq + Clone> OrderedSet<T> {
    #[inline]
    pub fn add(&mut self, item: T) -> bool {
        if self.set.insert(item.clone()) {
            self.list.push(item);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn remove(&mut self, item: &T) -> bool {
        if self.set.remove(item) {
            self.list.retain(|x| x != item);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn contains(&self, item: &T) -> bool {
        self.set.contains(item)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.list.get(index)
    }

    #[inline]
    pub fn first(&self) -> Option<&T> {
        self.list.first()
    }

    #[inline]
    pub fn last(&self) -> Option<&T> {
        self.list.last()
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.list.iter()
    }
}

/// A URI observation maintained by the broker (subscription) or dealer
/// (registration): the URI or pattern it was created for, its matching
/// policy, and the set of observing sessions. Owned by the containing
/// [`UriObservationMap`]; handles given out are read-only.
#[derive(Debug)]
pub struct UriObservation<E> {
    pub id: ObservationId,
    pub uri: String,
    pub policy: MatchPolicy,
    pub created: TimestampMillis,
    pub extra: E,
    observers: RwLock<OrderedSet<SessionId>>,
}

impl<E> UriObservation<E> {
    fn new(uri: String, policy: MatchPolicy, extra: E) -> Self {
        Self {
            id: next_observation_id(),
            uri,
            policy,
            created: timestamp_millis(),
            extra,
            observers: RwLock::new(OrderedSet::default()),
        }
    }

    #[inline]
    pub fn observers_count(&self) -> usize {
        self.observers.read().len()
    }

    #[inline]
    pub fn has_observer(&self, observer: SessionId) -> bool {
        self.observers.read().contains(&observer)
    }

    /// Snapshot of the observer set in insertion order. Delivery always works
    /// on such a snapshot taken at match time.
    #[inline]
    pub fn observers_snapshot(&self) -> Vec<SessionId> {
        self.observers.read().iter().copied().collect()
    }
}

/// The current set of observations maintained by a broker or dealer, with
/// one index per matching policy plus a reverse index by observation ID.
///
/// Invariant: every observation reachable from the reverse index is
/// reachable from exactly one policy index and vice versa, and no index
/// holds an observation with an empty observer set.
pub struct UriObservationMap<E> {
    observations_exact: HashMap<String, Arc<UriObservation<E>>>,
    observations_prefix: PrefixTrie<Arc<UriObservation<E>>>,
    observations_wildcard: WildcardMatcher<Arc<UriObservation<E>>>,
    observation_by_id: HashMap<ObservationId, Arc<UriObservation<E>>>,
}

impl<E> Default for UriObservationMap<E> {
    #[inline]
    fn default() -> Self {
        Self {
            observations_exact: HashMap::default(),
            observations_prefix: PrefixTrie::default(),
            observations_wildcard: WildcardMatcher::default(),
            observation_by_id: HashMap::default(),
        }
    }
}

impl<E> UriObservationMap<E> {
    /// Add an observer under (uri, policy), creating the observation if
    /// absent. Idempotent per observer. Returns the observation plus
    /// `(was_already_observed, was_first_observer)`.
    pub fn add_observer(
        &mut self,
        observer: SessionId,
        uri: &Uri,
        policy: MatchPolicy,
        extra: E,
    ) -> Result<(Arc<UriObservation<E>>, bool, bool), UriError> {
        uri.validate(policy)?;
        let key = uri.to_string();

        let mut was_first_observer = false;
        let observation = match self.get_observation(&key, policy) {
            Some(observation) => observation,
            None => {
                was_first_observer = true;
                let observation = Arc::new(UriObservation::new(key.clone(), policy, extra));
                match policy {
                    MatchPolicy::Exact => {
                        self.observations_exact.insert(key, observation.clone());
                    }
                    MatchPolicy::Prefix => {
                        self.observations_prefix.insert(&key, observation.clone());
                    }
                    MatchPolicy::Wildcard => {
                        self.observations_wildcard.insert(&key, observation.clone());
                    }
                }
                self.observation_by_id.insert(observation.id, observation.clone());
                observation
            }
        };

        let was_already_observed = !observation.observers.write().add(observer);
        Ok((observation, was_already_observed, was_first_observer))
    }

    /// Exact index lookup for (uri, policy), not a match query.
    #[inline]
    pub fn get_observation(&self, uri: &str, policy: MatchPolicy) -> Option<Arc<UriObservation<E>>> {
        match policy {
            MatchPolicy::Exact => self.observations_exact.get(uri).cloned(),
            MatchPolicy::Prefix => self.observations_prefix.get(uri).cloned(),
            MatchPolicy::Wildcard => self.observations_wildcard.get(uri).cloned(),
        }
    }

    #[inline]
    pub fn get_observation_by_id(&self, id: ObservationId) -> Option<Arc<UriObservation<E>>> {
        self.observation_by_id.get(&id).cloned()
    }

    /// All observations matching the concrete URI, across the three
    /// policies. The indices are disjoint, so each observation appears at
    /// most once.
    pub fn match_observations(&self, uri: &str) -> Vec<Arc<UriObservation<E>>> {
        let mut observations = Vec::new();
        if let Some(observation) = self.observations_exact.get(uri) {
            observations.push(observation.clone());
        }
        for observation in self.observations_prefix.lookup_prefixes(uri) {
            observations.push(observation.clone());
        }
        for observation in self.observations_wildcard.matches(uri) {
            observations.push(observation.clone());
        }
        observations
    }

    /// The observation that best matches the given URI: exact wins, then the
    /// longest matching prefix, then any matching wildcard. This is what the
    /// dealer uses to route a call.
    pub fn best_matching_observation(&self, uri: &str) -> Option<Arc<UriObservation<E>>> {
        if let Some(observation) = self.observations_exact.get(uri) {
            return Some(observation.clone());
        }
        if let Some(observation) = self.observations_prefix.lookup_prefixes(uri).into_iter().last() {
            return Some(observation.clone());
        }
        self.observations_wildcard.matches(uri).into_iter().next().cloned()
    }

    /// Drop an observer from an observation. If the observer set becomes
    /// empty the observation is removed from every index it participates in.
    /// Returns `(was_observed, was_last_observer)`.
    pub fn drop_observer(
        &mut self,
        observer: SessionId,
        observation: &Arc<UriObservation<E>>,
    ) -> (bool, bool) {
        let (was_observed, was_last_observer) = {
            let mut observers = observation.observers.write();
            let was_observed = observers.remove(&observer);
            (was_observed, was_observed && observers.is_empty())
        };

        if was_last_observer {
            self.delete_observation(observation);
        }
        (was_observed, was_last_observer)
    }

    fn delete_observation(&mut self, observation: &Arc<UriObservation<E>>) {
        let removed = match observation.policy {
            MatchPolicy::Exact => self.observations_exact.remove(&observation.uri).is_some(),
            MatchPolicy::Prefix => self.observations_prefix.remove(&observation.uri).is_some(),
            MatchPolicy::Wildcard => self.observations_wildcard.remove(&observation.uri).is_some(),
        };
        debug_assert!(removed, "observation {} missing from its policy index", observation.id);
        let reverse_removed = self.observation_by_id.remove(&observation.id).is_some();
        debug_assert!(reverse_removed, "observation {} missing from reverse index", observation.id);
    }

    #[inline]
    pub fn observations_count(&self) -> usize {
        self.observation_by_id.len()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Arc<UriObservation<E>>> {
        self.observation_by_id.values()
    }

    /// Verify the index/reverse-index invariant. Cheap enough to call from
    /// tests after arbitrary add/drop sequences.
    pub fn check_invariants(&self) -> bool {
        let policy_total = self.observations_exact.len()
            + self.observations_prefix.len()
            + self.observations_wildcard.len();
        if policy_total != self.observation_by_id.len() {
            return false;
        }
        self.observation_by_id.values().all(|observation| {
            observation.observers_count() > 0
                && self
                    .get_observation(&observation.uri, observation.policy)
                    .map(|o| o.id == observation.id)
                    .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn uri(s: &str) -> Uri {
        Uri::from_str(s).unwrap()
    }

    #[test]
    fn test_idempotent_subscribe() {
        let mut map: UriObservationMap<()> = UriObservationMap::default();
        let (s1, already1, first1) = map.add_observer(1, &uri("a.b.c"), MatchPolicy::Exact, ()).unwrap();
        assert!(!already1);
        assert!(first1);

        let (s2, already2, first2) = map.add_observer(1, &uri("a.b.c"), MatchPolicy::Exact, ()).unwrap();
        assert!(already2);
        assert!(!first2);
        assert_eq!(s1.id, s2.id);
        assert_eq!(s2.observers_count(), 1);
    }

    #[test]
    fn test_match_across_policies() {
        let mut map: UriObservationMap<()> = UriObservationMap::default();
        map.add_observer(1, &uri("com.example.topic1"), MatchPolicy::Exact, ()).unwrap();
        map.add_observer(2, &uri("com.example"), MatchPolicy::Prefix, ()).unwrap();
        map.add_observer(3, &uri("com.example..create"), MatchPolicy::Wildcard, ()).unwrap();

        let matched = map.match_observations("com.example.topic1");
        assert_eq!(matched.len(), 2);

        let matched = map.match_observations("com.example.widget.create");
        assert_eq!(matched.len(), 2);

        // exact does not match longer names
        let mut map: UriObservationMap<()> = UriObservationMap::default();
        map.add_observer(1, &uri("a.b"), MatchPolicy::Exact, ()).unwrap();
        assert!(map.match_observations("a.b.c").is_empty());
    }

    #[test]
    fn test_prefix_drop_leaves_shorter() {
        let mut map: UriObservationMap<()> = UriObservationMap::default();
        map.add_observer(1, &uri("com.example"), MatchPolicy::Prefix, ()).unwrap();
        let (sub, _, _) = map.add_observer(1, &uri("com.example.sub"), MatchPolicy::Prefix, ()).unwrap();

        assert_eq!(map.match_observations("com.example.sub.leaf").len(), 2);

        let (was_observed, was_last) = map.drop_observer(1, &sub);
        assert!(was_observed);
        assert!(was_last);

        let matched = map.match_observations("com.example.sub.leaf");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].uri, "com.example");
        assert!(map.check_invariants());
    }

    #[test]
    fn test_cleanup_invariant() {
        let mut map: UriObservationMap<()> = UriObservationMap::default();
        let (a, _, _) = map.add_observer(1, &uri("a.b.c"), MatchPolicy::Exact, ()).unwrap();
        map.add_observer(2, &uri("a.b.c"), MatchPolicy::Exact, ()).unwrap();
        let (w, _, _) = map.add_observer(3, &uri("a..c"), MatchPolicy::Wildcard, ()).unwrap();
        let (p, _, _) = map.add_observer(4, &uri("a.b"), MatchPolicy::Prefix, ()).unwrap();
        assert!(map.check_invariants());

        let (was_observed, was_last) = map.drop_observer(1, &a);
        assert!(was_observed);
        assert!(!was_last);
        assert!(map.get_observation_by_id(a.id).is_some());

        let (was_observed, was_last) = map.drop_observer(2, &a);
        assert!(was_observed);
        assert!(was_last);
        assert!(map.get_observation_by_id(a.id).is_none());

        map.drop_observer(3, &w);
        map.drop_observer(4, &p);
        assert_eq!(map.observations_count(), 0);
        assert!(map.check_invariants());

        // dropping again reports not-observed
        let (was_observed, was_last) = map.drop_observer(2, &a);
        assert!(!was_observed);
        assert!(!was_last);
    }

    #[test]
    fn test_policy_validation() {
        let mut map: UriObservationMap<()> = UriObservationMap::default();
        assert!(map.add_observer(1, &uri("a..c"), MatchPolicy::Exact, ()).is_err());
        assert!(map.add_observer(1, &uri("a.b.c"), MatchPolicy::Wildcard, ()).is_err());
        assert_eq!(map.observations_count(), 0);
    }

    #[test]
    fn test_observation_ids_unique() {
        let mut map: UriObservationMap<()> = UriObservationMap::default();
        let (a, _, _) = map.add_observer(1, &uri("a.b"), MatchPolicy::Exact, ()).unwrap();
        let (b, _, _) = map.add_observer(1, &uri("a.c"), MatchPolicy::Exact, ()).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(map.get_observation_by_id(b.id).unwrap().uri, "a.c");
    }
}
