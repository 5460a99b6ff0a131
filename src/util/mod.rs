//! Generic concurrency utilities shared across the bridge.

pub mod queue;
pub mod queue_pool;

pub use queue::{Queue, QueueError};
pub use queue_pool::QueuePool;
