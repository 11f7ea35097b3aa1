//! Duplicate filter service.
//!
//! Forwards the first record carrying each distinct value from the input topic
//! to the output topic and drops every later record with the same value.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types with a cause chain, use formats that
//! include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}`, full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e`, full chain with `Caused by:` sections (Debug).
//!
//! When constructing errors, use `.context()` / `.with_context()` so the original error remains
//! the source.

pub mod config;
pub mod deduplicator;
pub mod health;
pub mod kafka;
pub mod listener;
pub mod metrics_consts;
pub mod record;
pub mod server;
pub mod service;
pub mod signals;
pub mod sink;
pub mod stage;
pub mod store;

pub use deduplicator::{Decision, Deduplicator, FirstSeen};
pub use record::Record;
pub use sink::{OutputFormat, RecordSink};
pub use stage::{process_stream, DeduplicationStage, StageConfig, StageStats};
pub use store::{CountStore, RetentionPolicy};
