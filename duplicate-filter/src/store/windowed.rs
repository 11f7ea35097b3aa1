use std::time::Duration;

use moka::sync::Cache;

use super::CountStore;

/// Count table that forgets a value once it has not been observed for `idle`.
pub struct WindowedStore {
    counts: Cache<String, u64>,
    idle: Duration,
}

impl WindowedStore {
    pub fn new(idle: Duration) -> Self {
        let counts = Cache::builder().time_to_idle(idle).build();
        Self { counts, idle }
    }

    pub fn idle(&self) -> Duration {
        self.idle
    }
}

impl CountStore for WindowedStore {
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
        self.counts.remove(value)
    }

    fn len(&self) -> usize {
        // moka applies expirations lazily, flush them so the size is accurate
        self.counts.run_pending_tasks();
        self.counts.entry_count() as usize
    }
}
