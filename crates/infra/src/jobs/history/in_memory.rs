use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use courier_core::{HistoryId, SharedClock, SystemClock};

use super::query::{HistoryFilter, HistoryPage, Pagination};
use super::r#trait::{
    HistoryError, HistoryStats, HistoryStatus, HistoryStore, JobHistoryRecord, JobHistoryUpdate,
    NewJobHistory,
};

/// In-memory history store for tests and deployments without Postgres.
#[derive(Debug)]
pub struct InMemoryHistoryStore {
    records: Mutex<HashMap<HistoryId, JobHistoryRecord>>,
    clock: SharedClock,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<HistoryId, JobHistoryRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create(&self, new: NewJobHistory) -> Result<JobHistoryRecord, HistoryError> {
        let now = self.clock.now();
        let record = JobHistoryRecord {
            id: HistoryId::new(),
            queue_name: new.queue_name,
            job_type: new.job_type,
            job_data: new.job_data,
            status: HistoryStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts,
            error: None,
            result: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        self.lock().insert(record.id, record.clone());
        Ok(record)
    }

    async fn update(&self, id: HistoryId, update: JobHistoryUpdate) -> Result<(), HistoryError> {
        let now = self.clock.now();
        let mut records = self.lock();
        let record = records.get_mut(&id).ok_or(HistoryError::NotFound(id))?;
        update.apply(record, now);
        Ok(())
    }

    async fn get(&self, id: HistoryId) -> Result<Option<JobHistoryRecord>, HistoryError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn query(
        &self,
        filter: HistoryFilter,
        pagination: Pagination,
    ) -> Result<HistoryPage, HistoryError> {
        let mut matching: Vec<JobHistoryRecord> = self
            .lock()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        // UUIDv7 ids break ties between records created in the same instant.
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let records = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();

        Ok(HistoryPage::new(records, total, pagination))
    }

    async fn stats(&self, queue_name: Option<&str>) -> Result<HistoryStats, HistoryError> {
        let records = self.lock();
        let counts = records
            .values()
            .filter(|r| queue_name.is_none_or(|q| r.queue_name == q))
            .map(|r| (r.status, 1));
        Ok(HistoryStats::from_counts(counts))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_core::{Clock, ManualClock};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn create_then_update() {
        let clock = ManualClock::starting_now();
        let store = InMemoryHistoryStore::with_clock(clock.shared());

        let record = store
            .create(NewJobHistory::new("email-queue", "welcome-email", json!({"email": "a@b.c"})))
            .await
            .unwrap();
        assert_eq!(record.status, HistoryStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.max_attempts, 3);

        clock.advance(Duration::from_secs(1));
        let started = clock.now();
        store
            .update(
                record.id,
                JobHistoryUpdate::status(HistoryStatus::Active).attempts(1).started_at(started),
            )
            .await
            .unwrap();
        store
            .update(record.id, JobHistoryUpdate::status(HistoryStatus::Completed))
            .await
            .unwrap();

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, HistoryStatus::Completed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.started_at, Some(started));
        assert!(stored.updated_at > stored.created_at);
    }

    #[tokio::test]
    async fn update_of_unknown_record_fails() {
        let store = InMemoryHistoryStore::new();
        let id = HistoryId::new();
        assert!(matches!(
            store.update(id, JobHistoryUpdate::default()).await,
            Err(HistoryError::NotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn query_filters_and_pages_newest_first() {
        let clock = ManualClock::starting_now();
        let store = InMemoryHistoryStore::with_clock(clock.shared());

        let mut ids = Vec::new();
        for i in 0..5 {
            let queue = if i % 2 == 0 { "email-queue" } else { "user-sync-queue" };
            let record = store
                .create(NewJobHistory::new(queue, "t", json!({ "i": i })))
                .await
                .unwrap();
            ids.push(record.id);
            clock.advance(Duration::from_millis(10));
        }

        let page = store
            .query(HistoryFilter::queue("email-queue"), Pagination::new(Some(2), None))
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert!(page.has_more);
        assert_eq!(
            page.records.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![ids[4], ids[2]]
        );

        let rest = store
            .query(HistoryFilter::queue("email-queue"), Pagination::new(Some(2), Some(2)))
            .await
            .unwrap();
        assert_eq!(rest.records.len(), 1);
        assert!(!rest.has_more);
    }

    #[tokio::test]
    async fn stats_by_queue() {
        let store = InMemoryHistoryStore::new();
        let a = store.create(NewJobHistory::new("a", "t", json!({}))).await.unwrap();
        store.create(NewJobHistory::new("a", "t", json!({}))).await.unwrap();
        store.create(NewJobHistory::new("b", "t", json!({}))).await.unwrap();
        store
            .update(a.id, JobHistoryUpdate::status(HistoryStatus::Failed))
            .await
            .unwrap();

        let stats = store.stats(Some("a")).await.unwrap();
        assert_eq!(stats.get(HistoryStatus::Pending), 1);
        assert_eq!(stats.get(HistoryStatus::Failed), 1);
        assert_eq!(stats.get(HistoryStatus::Active), 0);

        assert_eq!(store.stats(None).await.unwrap().total(), 3);
    }
}
