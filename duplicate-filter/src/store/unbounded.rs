use std::collections::HashMap;

use super::CountStore;

/// Count table that never evicts. The default policy, at the cost
/// of memory proportional to the number of distinct values ever seen.
#[derive(Debug, Default)]
pub struct UnboundedStore {
    counts: HashMap<String, u64, ahash::RandomState>,
}

impl UnboundedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CountStore for UnboundedStore {
    fn increment(&mut self, value: &str) -> u64 {
        // Avoid allocating a key on the (common) duplicate path
        if let Some(count) = self.counts.get_mut(value) {
            *count = count.saturating_add(1);
            return *count;
        }
        self.counts.insert(value.to_owned(), 1);
        1
    }

    fn count(&self, value: &str) -> u64 {
        self.counts.get(value).copied().unwrap_or(0)
    }

    fn forget(&mut self, value: &str) -> Option<u64> {
        self.counts.remove(value)
    }

    fn len(&self) -> usize {
        self.counts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_are_exact_per_value() {
        let mut store = UnboundedStore::new();
        for value in ["a", "b", "a", "c", "b", "a"] {
            store.increment(value);
        }

        assert_eq!(store.count("a"), 3);
        assert_eq!(store.count("b"), 2);
        assert_eq!(store.count("c"), 1);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_values_compare_by_exact_bytes() {
        let mut store = UnboundedStore::new();
        assert_eq!(store.increment("Article"), 1);
        assert_eq!(store.increment("article"), 1);
        assert_eq!(store.increment("article "), 1);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_forget_makes_value_unseen() {
        let mut store = UnboundedStore::new();
        store.increment("x");

        assert_eq!(store.forget("x"), Some(1));
        assert_eq!(store.forget("x"), None);
        assert_eq!(store.count("x"), 0);
        assert_eq!(store.increment("x"), 1);
    }

    #[test]
    fn test_never_evicts() {
        let mut store = UnboundedStore::new();
        for i in 0..10_000 {
            store.increment(&i.to_string());
        }
        assert_eq!(store.len(), 10_000);
        assert_eq!(store.count("0"), 1);
    }
}
