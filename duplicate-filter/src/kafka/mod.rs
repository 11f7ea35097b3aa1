pub mod config;
pub mod consumer;
pub mod context;
pub mod message;
pub mod offset_tracker;
pub mod producer;
pub mod repartitioner;
pub mod types;

pub use config::ConsumerConfigBuilder;
pub use consumer::DeduplicationConsumer;
pub use message::{AckHandle, AckableRecord};
pub use offset_tracker::OffsetTracker;
pub use repartitioner::ValueRepartitioner;
pub use types::Partition;
