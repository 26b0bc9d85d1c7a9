use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

use courier_core::JobId;

use crate::jobs::types::{
    Job, JobOptions, JobState, LeaseToken, NackOutcome, QueueStats, StalledReport,
};

/// Queue store operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Transient infrastructure failure; the caller decides whether to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid job spec: {0}")]
    InvalidJobSpec(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// The caller's lease expired and the job was recovered, re-leased or settled since.
    #[error("lease {0} is no longer held")]
    LeaseLost(LeaseToken),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    pub fn is_lease_lost(&self) -> bool {
        matches!(self, StoreError::LeaseLost(_))
    }
}

/// Lease and stall-detection settings shared by every queue of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseSettings {
    /// Lease length; an unacknowledged job is stalled once it runs out
    pub stalled_interval: Duration,
    /// Stalls tolerated before a job is failed
    pub max_stalled_count: u32,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
        }
    }
}

/// Durable, at-least-once job channel keyed by queue name.
///
/// ## Lease guarantee
///
/// `dequeue` must move a job to Active and take its lease in one atomic store-level step:
/// two callers (possibly in different processes) never receive the same job while it is
/// Active. An Active job whose lease expires is only handed out again after
/// `recover_stalled` returns it to Waiting.
///
/// `extend_lease`, `ack` and `nack` take the [`LeaseToken`] of the leased job and fail with
/// `LeaseLost` unless that exact lease is still live, so a worker whose lease expired can
/// never settle a job that another worker now holds.
///
/// ## State machine
///
/// Waiting → Active → Completed | Delayed → Waiting | Failed. Delayed is also the initial
/// state of jobs enqueued with a delay.
#[async_trait::async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a job. Visible immediately, or Delayed when `options.delay > 0`.
    ///
    /// Rejects `max_attempts <= 0` with `InvalidJobSpec`.
    async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        payload: JsonValue,
        options: JobOptions,
    ) -> Result<JobId, StoreError>;

    /// Lease the oldest visible job, if the queue is not paused.
    ///
    /// Due Delayed jobs are promoted first. `attempts_made` is incremented.
    async fn dequeue(&self, queue: &str) -> Result<Option<Job>, StoreError>;

    /// Push the lease deadline forward while the holder is still working.
    async fn extend_lease(&self, queue: &str, lease: LeaseToken) -> Result<(), StoreError>;

    /// Active → Completed. A no-op when the same lease already completed the job.
    async fn ack(
        &self,
        queue: &str,
        lease: LeaseToken,
        result: Option<JsonValue>,
    ) -> Result<(), StoreError>;

    /// Active → Delayed (retry after backoff) or Active → Failed (attempts exhausted).
    async fn nack(
        &self,
        queue: &str,
        lease: LeaseToken,
        error: &str,
    ) -> Result<NackOutcome, StoreError>;

    /// Return expired leases to Waiting, or fail them past the stall limit.
    async fn recover_stalled(&self, queue: &str) -> Result<StalledReport, StoreError>;

    async fn pause(&self, queue: &str) -> Result<(), StoreError>;

    async fn resume(&self, queue: &str) -> Result<(), StoreError>;

    /// Remove every Waiting and Delayed job. Active jobs are left alone.
    async fn drain(&self, queue: &str) -> Result<u64, StoreError>;

    /// Remove every job in `state`, which must be Completed or Failed.
    async fn purge(&self, queue: &str, state: JobState) -> Result<u64, StoreError>;

    async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError>;

    async fn get(&self, queue: &str, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Lease length and stall limit this store applies.
    fn lease_settings(&self) -> LeaseSettings;
}

pub(crate) fn validate_max_attempts(options: &JobOptions) -> Result<u32, StoreError> {
    if options.max_attempts <= 0 {
        return Err(StoreError::InvalidJobSpec(format!(
            "max_attempts must be positive, got {}",
            options.max_attempts
        )));
    }
    Ok(options.max_attempts as u32)
}

/// Settle-time ownership check shared by the stores.
pub(crate) fn ensure_held(job: &Job, lease: LeaseToken) -> Result<(), StoreError> {
    if job.is_held_by(lease) {
        Ok(())
    } else {
        Err(StoreError::LeaseLost(lease))
    }
}

pub(crate) fn ensure_purgeable(state: JobState) -> Result<(), StoreError> {
    if !state.is_terminal() {
        return Err(StoreError::InvalidJobSpec(format!(
            "only completed or failed jobs can be purged, got {state}"
        )));
    }
    Ok(())
}

#[async_trait::async_trait]
impl<S> QueueStore for Arc<S>
where
    S: QueueStore + ?Sized,
{
    async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        payload: JsonValue,
        options: JobOptions,
    ) -> Result<JobId, StoreError> {
        (**self).enqueue(queue, job_type, payload, options).await
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Job>, StoreError> {
        (**self).dequeue(queue).await
    }

    async fn extend_lease(&self, queue: &str, lease: LeaseToken) -> Result<(), StoreError> {
        (**self).extend_lease(queue, lease).await
    }

    async fn ack(
        &self,
        queue: &str,
        lease: LeaseToken,
        result: Option<JsonValue>,
    ) -> Result<(), StoreError> {
        (**self).ack(queue, lease, result).await
    }

    async fn nack(
        &self,
        queue: &str,
        lease: LeaseToken,
        error: &str,
    ) -> Result<NackOutcome, StoreError> {
        (**self).nack(queue, lease, error).await
    }

    async fn recover_stalled(&self, queue: &str) -> Result<StalledReport, StoreError> {
        (**self).recover_stalled(queue).await
    }

    async fn pause(&self, queue: &str) -> Result<(), StoreError> {
        (**self).pause(queue).await
    }

    async fn resume(&self, queue: &str) -> Result<(), StoreError> {
        (**self).resume(queue).await
    }

    async fn drain(&self, queue: &str) -> Result<u64, StoreError> {
        (**self).drain(queue).await
    }

    async fn purge(&self, queue: &str, state: JobState) -> Result<u64, StoreError> {
        (**self).purge(queue, state).await
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        (**self).stats(queue).await
    }

    async fn get(&self, queue: &str, job_id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(queue, job_id).await
    }

    fn lease_settings(&self) -> LeaseSettings {
        (**self).lease_settings()
    }
}
