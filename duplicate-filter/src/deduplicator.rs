//! First-seen-wins decision over a single count table.
//!
//! Per value the state only ever moves forward:
//! `UNSEEN -> SEEN(1, emitted) -> SEEN(n > 1, dropped)`.
//! The read, increment and emit decision happen in one `&mut self` call, so a
//! count is never read without being written back.

use crate::record::Record;
use crate::store::{CountStore, RetentionPolicy};

/// Outcome of observing one value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The value was unseen; the record must be emitted
    FirstSeen { count: u64 },
    /// The value was seen before; the record is dropped
    Duplicate { count: u64 },
}

impl Decision {
    pub fn count(&self) -> u64 {
        match *self {
            Decision::FirstSeen { count } | Decision::Duplicate { count } => count,
        }
    }

    pub fn is_first_seen(&self) -> bool {
        matches!(self, Decision::FirstSeen { .. })
    }
}

/// A record that must be forwarded downstream, tagged with its new count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstSeen {
    pub record: Record,
    pub count: u64,
}

pub struct Deduplicator {
    table: Box<dyn CountStore>,
}

impl Deduplicator {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self::with_store(policy.build_store())
    }

    pub fn with_store(table: Box<dyn CountStore>) -> Self {
        Self { table }
    }

    pub fn observe(&mut self, value: &str) -> Decision {
        let count = self.table.increment(value);
        if count == 1 {
            Decision::FirstSeen { count }
        } else {
            Decision::Duplicate { count }
        }
    }

    /// Observe a record and return it if it has to be emitted
    pub fn process(&mut self, record: Record) -> Option<FirstSeen> {
        match self.observe(record.value()) {
            Decision::FirstSeen { count } => Some(FirstSeen { record, count }),
            Decision::Duplicate { .. } => None,
        }
    }

    /// Undo the first observation of `value` after its emission failed, so a
    /// redelivery of the same value is emitted instead of dropped.
    ///
    /// Only valid while the value's count is still 1; later counts are left alone.
    pub fn rollback(&mut self, value: &str) -> bool {
        if self.table.count(value) == 1 {
            self.table.forget(value);
            true
        } else {
            false
        }
    }

    pub fn count(&self, value: &str) -> u64 {
        self.table.count(value)
    }

    pub fn distinct_values(&self) -> usize {
        self.table.len()
    }
}
