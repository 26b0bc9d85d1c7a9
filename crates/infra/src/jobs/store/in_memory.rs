use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::debug;

use courier_core::{JobId, SharedClock, SystemClock};

use super::r#trait::{
    ensure_held, ensure_purgeable, validate_max_attempts, LeaseSettings, QueueStore, StoreError,
};
use crate::jobs::types::{
    saturating_after, Job, JobOptions, JobState, LeaseToken, NackOutcome, QueueStats,
    StallOutcome, StalledReport,
};

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    /// Visible jobs; the front is leased next.
    waiting: VecDeque<JobId>,
    paused: bool,
}

impl QueueState {
    /// Move due Delayed jobs to the back of Waiting, earliest visibility first.
    fn promote_due(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<_> = self
            .jobs
            .values()
            .filter(|j| j.state == JobState::Delayed && j.is_due(now))
            .map(|j| (j.delay_until, j.created_at, j.id))
            .collect();
        due.sort();

        for (_, _, id) in due {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
                job.delay_until = None;
                self.waiting.push_back(id);
            }
        }
    }

    fn count(&self, state: JobState) -> u64 {
        self.jobs.values().filter(|j| j.state == state).count() as u64
    }

    fn remove_where(&mut self, pred: impl Fn(&Job) -> bool) -> u64 {
        let doomed: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| pred(j))
            .map(|j| j.id)
            .collect();
        for id in &doomed {
            self.jobs.remove(id);
        }
        self.waiting.retain(|id| self.jobs.contains_key(id));
        doomed.len() as u64
    }
}

/// In-memory queue store for tests, dev and single-process workers.
///
/// One mutex guards every queue; holding it is what makes `dequeue` an atomic lease.
#[derive(Debug)]
pub struct InMemoryQueueStore {
    queues: Mutex<HashMap<String, QueueState>>,
    clock: SharedClock,
    lease: LeaseSettings,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared(), LeaseSettings::default())
    }

    pub fn with_clock(clock: SharedClock, lease: LeaseSettings) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            clock,
            lease,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&mut QueueState) -> T) -> T {
        let mut queues = self.lock();
        let state = queues.entry(queue.to_string()).or_default();
        f(state)
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        payload: JsonValue,
        options: JobOptions,
    ) -> Result<JobId, StoreError> {
        let max_attempts = validate_max_attempts(&options)?;
        let now = self.clock.now();
        let job = Job::new(JobId::new(), queue, job_type, payload, max_attempts, &options, now)?;
        let id = job.id;

        self.with_queue(queue, |q| {
            if job.state == JobState::Waiting {
                q.waiting.push_back(id);
            }
            q.jobs.insert(id, job);
        });

        debug!(queue, job_type, job_id = %id, "job enqueued");
        Ok(id)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Job>, StoreError> {
        let now = self.clock.now();
        let lease = self.lease.stalled_interval;

        Ok(self.with_queue(queue, |q| {
            if q.paused {
                return None;
            }
            q.promote_due(now);

            while let Some(id) = q.waiting.pop_front() {
                if let Some(job) = q.jobs.get_mut(&id) {
                    if job.state != JobState::Waiting {
                        continue;
                    }
                    job.mark_active(now, lease);
                    return Some(job.clone());
                }
            }
            None
        }))
    }

    async fn extend_lease(&self, queue: &str, lease: LeaseToken) -> Result<(), StoreError> {
        let expires = saturating_after(self.clock.now(), self.lease.stalled_interval);

        self.with_queue(queue, |q| {
            let job = q
                .jobs
                .get_mut(&lease.job_id)
                .ok_or(StoreError::NotFound(lease.job_id))?;
            ensure_held(job, lease)?;
            job.lease_expires_at = Some(expires);
            Ok(())
        })
    }

    async fn ack(
        &self,
        queue: &str,
        lease: LeaseToken,
        result: Option<JsonValue>,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();

        self.with_queue(queue, |q| {
            let job = q
                .jobs
                .get_mut(&lease.job_id)
                .ok_or(StoreError::NotFound(lease.job_id))?;
            if job.state == JobState::Completed && job.attempts_made == lease.attempt {
                return Ok(());
            }
            ensure_held(job, lease)?;
            job.mark_completed(now, result);
            Ok(())
        })
    }

    async fn nack(
        &self,
        queue: &str,
        lease: LeaseToken,
        error: &str,
    ) -> Result<NackOutcome, StoreError> {
        let now = self.clock.now();

        self.with_queue(queue, |q| {
            let job = q
                .jobs
                .get_mut(&lease.job_id)
                .ok_or(StoreError::NotFound(lease.job_id))?;
            ensure_held(job, lease)?;
            Ok(job.mark_failed_attempt(now, error))
        })
    }

    async fn recover_stalled(&self, queue: &str) -> Result<StalledReport, StoreError> {
        let now = self.clock.now();
        let max_stalled = self.lease.max_stalled_count;

        Ok(self.with_queue(queue, |q| {
            let mut expired: Vec<_> = q
                .jobs
                .values()
                .filter(|j| j.lease_expired(now))
                .map(|j| (j.processed_at, j.id))
                .collect();
            // Oldest lease ends up at the very front.
            expired.sort();
            expired.reverse();

            let mut report = StalledReport::default();
            for (_, id) in expired {
                let Some(job) = q.jobs.get_mut(&id) else { continue };
                match job.mark_stalled(now, max_stalled) {
                    StallOutcome::Requeued => {
                        report.requeued.push(job.clone());
                        q.waiting.push_front(id);
                    }
                    StallOutcome::Failed => report.failed.push(job.clone()),
                }
            }
            report
        }))
    }

    async fn pause(&self, queue: &str) -> Result<(), StoreError> {
        self.with_queue(queue, |q| q.paused = true);
        Ok(())
    }

    async fn resume(&self, queue: &str) -> Result<(), StoreError> {
        self.with_queue(queue, |q| q.paused = false);
        Ok(())
    }

    async fn drain(&self, queue: &str) -> Result<u64, StoreError> {
        Ok(self.with_queue(queue, |q| {
            q.remove_where(|j| matches!(j.state, JobState::Waiting | JobState::Delayed))
        }))
    }

    async fn purge(&self, queue: &str, state: JobState) -> Result<u64, StoreError> {
        ensure_purgeable(state)?;
        Ok(self.with_queue(queue, |q| q.remove_where(|j| j.state == state)))
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        let now = self.clock.now();

        Ok(self.with_queue(queue, |q| {
            q.promote_due(now);
            QueueStats {
                waiting: q.count(JobState::Waiting),
                active: q.count(JobState::Active),
                completed: q.count(JobState::Completed),
                failed: q.count(JobState::Failed),
                delayed: q.count(JobState::Delayed),
                paused: q.paused,
            }
        }))
    }

    async fn get(&self, queue: &str, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.with_queue(queue, |q| q.jobs.get(&job_id).cloned()))
    }

    fn lease_settings(&self) -> LeaseSettings {
        self.lease
    }
}
