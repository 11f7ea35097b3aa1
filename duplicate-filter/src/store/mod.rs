//! Count tables keyed by record value.
//!
//! A [`CountStore`] is owned by exactly one shard worker, so implementations
//! take `&mut self` and never need to coordinate concurrent writers.
//! Which store backs a shard is decided by the configured [`RetentionPolicy`].

pub mod bounded;
pub mod unbounded;
pub mod windowed;

use std::str::FromStr;
use std::time::Duration;

pub use bounded::CapacityBoundedStore;
pub use unbounded::UnboundedStore;
pub use windowed::WindowedStore;

pub trait CountStore: Send {
    /// Record one more occurrence of `value` and return its updated count.
    fn increment(&mut self, value: &str) -> u64;

    /// Current count for `value`, 0 when it was never seen or has been evicted.
    fn count(&self, value: &str) -> u64;

    /// Drop the entry for `value`, returning the count it had.
    fn forget(&mut self, value: &str) -> Option<u64>;

    /// Number of values currently retained.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How long the count table remembers values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Values are never evicted. Memory grows with the number of distinct values.
    Unbounded,
    /// At most `max_values` values are retained; the cache evicts the rest.
    Capacity { max_values: usize },
    /// A value is forgotten once `idle` has passed without it being observed.
    Window { idle: Duration },
}

impl RetentionPolicy {
    /// Build an empty store implementing this policy.
    pub fn build_store(&self) -> Box<dyn CountStore> {
        match *self {
            RetentionPolicy::Unbounded => Box::new(UnboundedStore::new()),
            RetentionPolicy::Capacity { max_values } => {
                Box::new(CapacityBoundedStore::new(max_values))
            }
            RetentionPolicy::Window { idle } => Box::new(WindowedStore::new(idle)),
        }
    }

    /// The policy each of `shard_count` shards should use so the whole stage
    /// honours this policy. Capacity is split evenly, rounding up.
    pub fn per_shard(&self, shard_count: usize) -> Self {
        match *self {
            RetentionPolicy::Capacity { max_values } => RetentionPolicy::Capacity {
                max_values: max_values.div_ceil(shard_count.max(1)).max(1),
            },
            other => other,
        }
    }
}

/// Retention mode as read from configuration, before its parameters are attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionMode {
    Unbounded,
    Capacity,
    Window,
}

impl FromStr for RetentionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "unbounded" => Ok(RetentionMode::Unbounded),
            "capacity" => Ok(RetentionMode::Capacity),
            "window" => Ok(RetentionMode::Window),
            _ => Err(format!(
                "Unknown count retention: {s}, must be one of unbounded, capacity, window"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("unbounded", RetentionMode::Unbounded ; "unbounded")]
    #[test_case("CAPACITY", RetentionMode::Capacity ; "uppercase capacity")]
    #[test_case(" window ", RetentionMode::Window ; "padded window")]
    fn test_retention_mode_parses(input: &str, expected: RetentionMode) {
        assert_eq!(input.parse::<RetentionMode>().unwrap(), expected);
    }

    #[test]
    fn test_retention_mode_rejects_unknown() {
        let err = "forever".parse::<RetentionMode>().unwrap_err();
        assert!(err.contains("forever"));
    }

    #[test]
    fn test_per_shard_splits_capacity_rounding_up() {
        let policy = RetentionPolicy::Capacity { max_values: 10 };
        assert_eq!(
            policy.per_shard(4),
            RetentionPolicy::Capacity { max_values: 3 }
        );
        assert_eq!(
            policy.per_shard(0),
            RetentionPolicy::Capacity { max_values: 10 }
        );
        assert_eq!(
            RetentionPolicy::Capacity { max_values: 1 }.per_shard(8),
            RetentionPolicy::Capacity { max_values: 1 }
        );
    }

    #[test]
    fn test_per_shard_keeps_other_policies() {
        let window = RetentionPolicy::Window {
            idle: Duration::from_secs(60),
        };
        assert_eq!(window.per_shard(8), window);
        assert_eq!(
            RetentionPolicy::Unbounded.per_shard(8),
            RetentionPolicy::Unbounded
        );
    }

    #[test]
    fn test_every_policy_builds_a_counting_store() {
        let policies = [
            RetentionPolicy::Unbounded,
            RetentionPolicy::Capacity { max_values: 100 },
            RetentionPolicy::Window {
                idle: Duration::from_secs(60),
            },
        ];

        for policy in policies {
            let mut store = policy.build_store();
            assert!(store.is_empty());
            assert_eq!(store.increment("a"), 1);
            assert_eq!(store.increment("a"), 2);
            assert_eq!(store.increment("b"), 1);
            assert_eq!(store.count("a"), 2, "policy {policy:?}");
            assert_eq!(store.count("missing"), 0, "policy {policy:?}");
        }
    }
}
