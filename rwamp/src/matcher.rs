use crate::topic::{pattern_key_of, reduced_form};
use crate::types::HashMap;

/// Index of wildcard patterns, keyed first by component count, then by the
/// boolean wildcard-position tuple (pattern key). Many patterns can share a
/// pattern key while differing in literal components, so the patterns
/// themselves are stored by their full string. Matching a concrete URI
/// builds its reduced form once per live pattern key and does a direct
/// lookup.
pub struct WildcardMatcher<V> {
    patterns: HashMap<String, V>,
    pattern_keys: HashMap<usize, HashMap<Vec<bool>, usize>>,
}

impl<V> Default for WildcardMatcher<V> {
    #[inline]
    fn default() -> Self {
        Self { patterns: HashMap::default(), pattern_keys: HashMap::default() }
    }
}

impl<V> WildcardMatcher<V> {
    #[inline]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    #[inline]
    pub fn contains_key(&self, pattern: &str) -> bool {
        self.patterns.contains_key(pattern)
    }

    #[inline]
    pub fn get(&self, pattern: &str) -> Option<&V> {
        self.patterns.get(pattern)
    }

    /// Insert a value under the given pattern, returning the previous value
    /// if the pattern was already present. The pattern-key refcount only
    /// grows for genuinely new patterns.
    #[inline]
    pub fn insert(&mut self, pattern: &str, value: V) -> Option<V> {
        let old = self.patterns.insert(pattern.to_owned(), value);
        if old.is_none() {
            let key = pattern_key_of(pattern);
            *self.pattern_keys.entry(key.len()).or_default().entry(key).or_insert(0) += 1;
        }
        old
    }

    /// Remove the value under the given pattern, decrementing the pattern-key
    /// refcount and dropping the key (and its length bucket) at zero.
    #[inline]
    pub fn remove(&mut self, pattern: &str) -> Option<V> {
        let removed = self.patterns.remove(pattern)?;

        let key = pattern_key_of(pattern);
        let key_len = key.len();
        if let Some(keys) = self.pattern_keys.get_mut(&key_len) {
            if let Some(count) = keys.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    keys.remove(&key);
                }
            }
            if keys.is_empty() {
                self.pattern_keys.remove(&key_len);
            }
        }
        Some(removed)
    }

    /// All values whose patterns match the concrete URI.
    #[inline]
    pub fn matches<'a>(&'a self, uri: &str) -> Vec<&'a V> {
        let components: Vec<&str> = uri.split('.').collect();
        let mut out = Vec::new();
        if let Some(keys) = self.pattern_keys.get(&components.len()) {
            for key in keys.keys() {
                let reduced = reduced_form(&components, key);
                if let Some(v) = self.patterns.get(&reduced) {
                    out.push(v);
                }
            }
        }
        out
    }

    #[inline]
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.patterns.values()
    }

    /// Number of live pattern keys across all lengths. Exposed for cleanup
    /// assertions.
    #[inline]
    pub fn pattern_keys_size(&self) -> usize {
        self.pattern_keys.values().map(|keys| keys.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::WildcardMatcher;

    #[test]
    fn test_wildcard_match() {
        let mut m: WildcardMatcher<u32> = WildcardMatcher::default();
        m.insert("com.example..create", 1);
        m.insert("com.example..delete", 2);
        m.insert("com..widget.create", 3);

        let found = m.matches("com.example.widget.create");
        assert_eq!(found.len(), 2);
        assert!(found.contains(&&1));
        assert!(found.contains(&&3));

        assert_eq!(m.matches("com.example.anything.create"), vec![&1]);
        assert!(m.matches("com.example.create").is_empty());
        assert_eq!(m.matches("com.example.widget.delete"), vec![&2]);
    }

    #[test]
    fn test_same_key_confusable_patterns() {
        let mut m: WildcardMatcher<u32> = WildcardMatcher::default();
        m.insert("a..c", 1);
        m.insert("x..z", 2);
        assert_eq!(m.pattern_keys_size(), 1);

        assert_eq!(m.matches("a.b.c"), vec![&1]);
        assert_eq!(m.matches("x.y.z"), vec![&2]);
        assert!(m.matches("a.b.z").is_empty());
    }

    #[test]
    fn test_refcount_cleanup() {
        let mut m: WildcardMatcher<u32> = WildcardMatcher::default();
        m.insert("a..c", 1);
        m.insert("x..z", 2);

        assert_eq!(m.remove("a..c"), Some(1));
        assert_eq!(m.pattern_keys_size(), 1);
        assert_eq!(m.matches("x.y.z"), vec![&2]);

        assert_eq!(m.remove("x..z"), Some(2));
        assert!(m.is_empty());
        assert_eq!(m.pattern_keys_size(), 0);
        assert_eq!(m.remove("x..z"), None);
    }

    #[test]
    fn test_insert_replace_keeps_refcount() {
        let mut m: WildcardMatcher<u32> = WildcardMatcher::default();
        m.insert("a..c", 1);
        assert_eq!(m.insert("a..c", 9), Some(1));
        assert_eq!(m.pattern_keys_size(), 1);
        assert_eq!(m.remove("a..c"), Some(9));
        assert_eq!(m.pattern_keys_size(), 0);
    }
}
