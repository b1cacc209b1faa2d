use crate::types::HashMap;

struct Node<V> {
    value: Option<V>,
    branches: HashMap<u8, Node<V>>,
}

impl<V> Default for Node<V> {
    #[inline]
    fn default() -> Node<V> {
        Self { value: None, branches: HashMap::default() }
    }
}

/// Byte-level trie supporting "all stored keys that are a prefix of a query
/// string" in a single walk of the query. Prefix matching is over the literal
/// string, not component-aware.
pub struct PrefixTrie<V> {
    root: Node<V>,
    len: usize,
}

impl<V> Default for PrefixTrie<V> {
    #[inline]
    fn default() -> Self {
        Self { root: Node::default(), len: 0 }
    }
}

impl<V> PrefixTrie<V> {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value under the given key, returning the previous value if
    /// the key was already present.
    #[inline]
    pub fn insert(&mut self, key: &str, value: V) -> Option<V> {
        let mut node = &mut self.root;
        for b in key.bytes() {
            node = node.branches.entry(b).or_default();
        }
        let old = node.value.replace(value);
        if old.is_none() {
            self.len += 1;
        }
        old
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&V> {
        let mut node = &self.root;
        for b in key.bytes() {
            node = node.branches.get(&b)?;
        }
        node.value.as_ref()
    }

    #[inline]
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove the value under the given key, pruning branches that become
    /// empty so no dangling nodes are left behind.
    #[inline]
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let removed = Self::_remove(&mut self.root, key.as_bytes());
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn _remove(node: &mut Node<V>, path: &[u8]) -> Option<V> {
        if path.is_empty() {
            node.value.take()
        } else {
            let b = path[0];
            let x = node.branches.get_mut(&b)?;
            let res = Self::_remove(x, &path[1..]);
            if x.value.is_none() && x.branches.is_empty() {
                node.branches.remove(&b);
            }
            res
        }
    }

    /// All values whose keys are prefixes of the query, shortest first.
    #[inline]
    pub fn lookup_prefixes<'a>(&'a self, query: &str) -> Vec<&'a V> {
        let mut out = Vec::new();
        let mut node = &self.root;
        if let Some(v) = node.value.as_ref() {
            out.push(v);
        }
        for b in query.bytes() {
            match node.branches.get(&b) {
                Some(n) => {
                    node = n;
                    if let Some(v) = node.value.as_ref() {
                        out.push(v);
                    }
                }
                None => break,
            }
        }
        out
    }

    #[inline]
    pub fn values(&self) -> Vec<&V> {
        let mut out = Vec::with_capacity(self.len);
        Self::_values(&self.root, &mut out);
        out
    }

    fn _values<'a>(node: &'a Node<V>, out: &mut Vec<&'a V>) {
        if let Some(v) = node.value.as_ref() {
            out.push(v);
        }
        for n in node.branches.values() {
            Self::_values(n, out);
        }
    }

    /// Number of trie nodes, root excluded. Exposed for cleanup assertions.
    #[inline]
    pub fn nodes_size(&self) -> usize {
        Self::_nodes_size(&self.root)
    }

    fn _nodes_size(node: &Node<V>) -> usize {
        node.branches.len() + node.branches.values().map(Self::_nodes_size).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::PrefixTrie;

    #[test]
    fn test_prefix_lookup() {
        let mut t: PrefixTrie<u32> = PrefixTrie::default();
        t.insert("com.example", 1);
        t.insert("com.example.sub", 2);
        t.insert("com.other", 3);

        let found = t.lookup_prefixes("com.example.sub.leaf");
        assert_eq!(found, vec![&1, &2]);

        // literal string prefix, not component-aware
        let found = t.lookup_prefixes("com.examples.leaf");
        assert_eq!(found, vec![&1]);

        assert!(t.lookup_prefixes("net.example").is_empty());
    }

    #[test]
    fn test_insert_replace() {
        let mut t: PrefixTrie<u32> = PrefixTrie::default();
        assert_eq!(t.insert("a.b", 1), None);
        assert_eq!(t.insert("a.b", 2), Some(1));
        assert_eq!(t.len(), 1);
        assert_eq!(t.get("a.b"), Some(&2));
    }

    #[test]
    fn test_remove_prunes_nodes() {
        let mut t: PrefixTrie<u32> = PrefixTrie::default();
        t.insert("com.example", 1);
        t.insert("com.example.sub", 2);

        assert_eq!(t.remove("com.example.sub"), Some(2));
        assert_eq!(t.remove("com.example"), Some(1));
        assert!(t.is_empty());
        assert_eq!(t.nodes_size(), 0);
        assert_eq!(t.remove("com.example"), None);
    }

    #[test]
    fn test_remove_keeps_shorter_prefix() {
        let mut t: PrefixTrie<u32> = PrefixTrie::default();
        t.insert("com.example", 1);
        t.insert("com.example.sub", 2);

        t.remove("com.example.sub");
        assert_eq!(t.lookup_prefixes("com.example.sub.leaf"), vec![&1]);
    }
}
