use quick_cache::sync::Cache;

use super::CountStore;

/// Count table holding at most a fixed number of values.
///
/// Eviction is delegated to `quick_cache`, which keeps frequently hit values
/// (the duplicates we want to keep dropping) over one-off values. An evicted
/// value is unseen again, so its next occurrence is emitted again.
pub struct CapacityBoundedStore {
    counts: Cache<String, u64>,
    max_values: usize,
}

impl CapacityBoundedStore {
    pub fn new(max_values: usize) -> Self {
        let max_values = max_values.max(1);
        Self {
            counts: Cache::new(max_values),
            max_values,
        }
    }

    pub fn max_values(&self) -> usize {
        self.max_values
    }
}

impl CountStore for CapacityBoundedStore {
    fn increment(&mut self, value: &str) -> u64 {
        let count = self
            .counts
            .get(value)
            .map(|c| c.saturating_add(1))
            .unwrap_or(1);
        self.counts.insert(value.to_owned(), count);
        count
    }

    fn count(&self, value: &str) -> u64 {
        self.counts.get(value).unwrap_or(0)
    }

    fn forget(&mut self, value: &str) -> Option<u64> {
        self.counts.remove(value).map(|(_, count)| count)
    }

    fn len(&self) -> usize {
        self.counts.len()
    }
}
