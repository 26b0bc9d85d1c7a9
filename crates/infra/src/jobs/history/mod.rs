//! Job history: an audit trail of submitted jobs that outlives queue-internal state.
//!
//! The producer creates a Pending record before enqueueing and threads its id through the
//! payload as `historyId`; the dispatcher updates it at every transition.

mod in_memory;
mod postgres;
mod query;
mod r#trait;

pub use in_memory::InMemoryHistoryStore;
pub use postgres::PostgresHistoryStore;
pub use query::{HistoryFilter, HistoryPage, Pagination, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use r#trait::{
    HistoryError, HistoryStats, HistoryStatus, HistoryStore, JobHistoryRecord, JobHistoryUpdate,
    NewJobHistory,
};
