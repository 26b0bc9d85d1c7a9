//! Durable background jobs: queues, retries with backoff, stall recovery, and history.
//!
//! ## Flow
//!
//! - `JobProducer` validates a payload against the `JobCatalog`, opens a history record
//!   and enqueues the job
//! - `Dispatcher` leases jobs from a `QueueStore`, routes them through the
//!   `HandlerRegistry` and settles them (ack, retry after backoff, or fail)
//! - a stall checker returns jobs with expired leases to the queue
//! - `QueueAdmin` pauses, resumes, clears and inspects queues
//!
//! Delivery is at-least-once; handlers must be idempotent.

pub mod admin;
pub mod catalog;
pub mod dispatcher;
pub mod history;
pub mod producer;
pub mod registry;
pub mod store;
pub mod types;

pub use admin::{AdminError, QueueAdmin};
pub use catalog::{JobCatalog, JobDefinition, JobPayload, PayloadValidator};
pub use dispatcher::{
    ConfigError, Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats, ProcessOutcome,
};
pub use history::{
    HistoryError, HistoryFilter, HistoryPage, HistoryStats, HistoryStatus, HistoryStore,
    InMemoryHistoryStore, JobHistoryRecord, JobHistoryUpdate, NewJobHistory, Pagination,
    PostgresHistoryStore,
};
pub use producer::{JobProducer, SubmitError};
pub use registry::{handler_fn, FnHandler, HandlerRegistry, JobHandler, ProcessError};
pub use store::{InMemoryQueueStore, LeaseSettings, QueueStore, StoreError};
#[cfg(feature = "redis")]
pub use store::{RedisQueueStore, DEFAULT_PREFIX};
pub use types::{
    BackoffKind, BackoffPolicy, Job, JobOptions, JobState, LeaseToken, NackOutcome, QueueStats,
    StallOutcome, StalledReport, HISTORY_ID_FIELD, STALLED_REASON,
};
