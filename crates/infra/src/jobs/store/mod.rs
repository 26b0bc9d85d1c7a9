//! Durable queue store boundary.
//!
//! The trait makes no storage assumptions; the in-memory store serves tests and
//! single-process deployments, the Redis store (feature `redis`) serves workers spread
//! over several processes.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod r#trait;

pub use in_memory::InMemoryQueueStore;
#[cfg(feature = "redis")]
pub use self::redis::{RedisQueueStore, DEFAULT_PREFIX};
pub use r#trait::{LeaseSettings, QueueStore, StoreError};
