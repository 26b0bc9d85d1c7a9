//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::{HistoryId, JobId};

use super::store::StoreError;

/// Payload key carrying the history correlation id.
pub const HISTORY_ID_FIELD: &str = "historyId";

/// Default ceiling on processing attempts.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Default base delay for the retry backoff.
pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_millis(2000);

/// Queue-internal job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Visible, waiting to be leased
    Waiting,
    /// Not visible before `delay_until`
    Delayed,
    /// Leased by exactly one dispatcher
    Active,
    /// Acknowledged
    Completed,
    /// Exhausted attempts (or stalled too often)
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay before every retry
    Fixed,
    /// base * 2^(attempts_made - 1)
    #[default]
    Exponential,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffKind::Fixed => "fixed",
            BackoffKind::Exponential => "exponential",
        }
    }
}

impl std::str::FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            other => Err(format!("unknown backoff kind: {other}")),
        }
    }
}

/// Delay applied before a failed job becomes visible again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_BACKOFF_DELAY)
    }
}

impl BackoffPolicy {
    pub fn fixed(base_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay,
        }
    }

    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay,
        }
    }

    /// Delay before the next attempt, given how many attempts were already made (1-indexed).
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let exp = attempts_made.saturating_sub(1).min(31);
                self.base_delay.saturating_mul(1u32 << exp)
            }
        }
    }
}

/// Per-job enqueue options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Visibility delay; zero means visible immediately
    pub delay: Duration,
    /// Must be positive; checked at enqueue time
    pub max_attempts: i32,
    pub backoff: BackoffPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl JobOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Identity of one lease: the job and the attempt it was handed out for.
///
/// Every lease bumps `attempts_made`, so once a stalled job is recovered and leased again
/// the previous holder's token no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken {
    pub job_id: JobId,
    pub attempt: u32,
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.job_id, self.attempt)
    }
}

/// A job as stored in a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    /// Selects the processor within the queue
    pub job_type: String,
    /// Immutable once enqueued
    pub payload: JsonValue,
    pub state: JobState,
    /// Incremented on every lease
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Not visible before this instant
    pub delay_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Start of the most recent lease
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub return_value: Option<JsonValue>,
    pub stalled_count: u32,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a freshly enqueued job. `max_attempts` must already be validated.
    ///
    /// Fails with `InvalidJobSpec` when the delay reaches past the representable time range.
    pub(crate) fn new(
        id: JobId,
        queue_name: &str,
        job_type: &str,
        payload: JsonValue,
        max_attempts: u32,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let (state, delay_until) = if options.delay.is_zero() {
            (JobState::Waiting, None)
        } else {
            let at = checked_after(now, options.delay).ok_or_else(|| {
                StoreError::InvalidJobSpec(format!(
                    "delay of {}ms is out of range",
                    options.delay.as_millis()
                ))
            })?;
            (JobState::Delayed, Some(at))
        };

        Ok(Self {
            id,
            queue_name: queue_name.to_string(),
            job_type: job_type.to_string(),
            payload,
            state,
            attempts_made: 0,
            max_attempts,
            backoff: options.backoff,
            delay_until,
            created_at: now,
            processed_at: None,
            finished_at: None,
            failed_reason: None,
            return_value: None,
            stalled_count: 0,
            lease_expires_at: None,
        })
    }

    /// Token for the lease taken by the most recent dequeue.
    pub fn lease(&self) -> LeaseToken {
        LeaseToken {
            job_id: self.id,
            attempt: self.attempts_made,
        }
    }

    /// Whether `lease` is the live lease on this job.
    pub fn is_held_by(&self, lease: LeaseToken) -> bool {
        self.state == JobState::Active && self.id == lease.job_id && self.attempts_made == lease.attempt
    }

    /// History correlation id embedded by the producer, if the job is tracked.
    pub fn history_id(&self) -> Option<HistoryId> {
        self.payload
            .get(HISTORY_ID_FIELD)
            .and_then(JsonValue::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// Whether a Delayed job may be promoted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.delay_until.is_none_or(|at| at <= now)
    }

    /// Whether an Active job's lease has run out at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// What a failure of the current attempt leads to.
    pub fn failure_outcome(&self, now: DateTime<Utc>) -> NackOutcome {
        if self.attempts_made < self.max_attempts {
            let delay = self.backoff.delay_after(self.attempts_made);
            NackOutcome::Retry {
                attempts_made: self.attempts_made,
                next_visible_at: saturating_after(now, delay),
            }
        } else {
            NackOutcome::Failed {
                attempts_made: self.attempts_made,
            }
        }
    }

    /// What an expired lease leads to.
    pub fn stall_outcome(&self, max_stalled_count: u32) -> StallOutcome {
        let stalled_count = self.stalled_count + 1;
        if stalled_count > max_stalled_count || self.attempts_made >= self.max_attempts {
            StallOutcome::Failed
        } else {
            StallOutcome::Requeued
        }
    }

    pub(crate) fn mark_active(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.state = JobState::Active;
        self.attempts_made += 1;
        self.delay_until = None;
        self.processed_at = Some(now);
        self.lease_expires_at = Some(saturating_after(now, lease));
    }

    pub(crate) fn mark_completed(&mut self, now: DateTime<Utc>, result: Option<JsonValue>) {
        self.state = JobState::Completed;
        self.finished_at = Some(now);
        self.return_value = result;
        self.lease_expires_at = None;
    }

    pub(crate) fn mark_failed_attempt(&mut self, now: DateTime<Utc>, error: &str) -> NackOutcome {
        let outcome = self.failure_outcome(now);
        self.failed_reason = Some(error.to_string());
        self.lease_expires_at = None;
        match outcome {
            NackOutcome::Retry {
                next_visible_at, ..
            } => {
                self.state = JobState::Delayed;
                self.delay_until = Some(next_visible_at);
            }
            NackOutcome::Failed { .. } => {
                self.state = JobState::Failed;
                self.finished_at = Some(now);
            }
        }
        outcome
    }

    pub(crate) fn mark_stalled(&mut self, now: DateTime<Utc>, max_stalled_count: u32) -> StallOutcome {
        let outcome = self.stall_outcome(max_stalled_count);
        self.stalled_count += 1;
        self.lease_expires_at = None;
        match outcome {
            StallOutcome::Requeued => self.state = JobState::Waiting,
            StallOutcome::Failed => {
                self.state = JobState::Failed;
                self.finished_at = Some(now);
                self.failed_reason = Some(STALLED_REASON.to_string());
            }
        }
        outcome
    }
}

/// Reason recorded on jobs failed by stall recovery.
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// Result of a negative acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum NackOutcome {
    /// Job re-enters Delayed until `next_visible_at`
    Retry {
        attempts_made: u32,
        next_visible_at: DateTime<Utc>,
    },
    /// Attempts exhausted; terminal
    Failed { attempts_made: u32 },
}

impl NackOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NackOutcome::Failed { .. })
    }
}

/// Result of recovering a single stalled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallOutcome {
    Requeued,
    Failed,
}

/// Jobs touched by one stall-recovery pass (snapshots after the transition).
#[derive(Debug, Clone, Default)]
pub struct StalledReport {
    pub requeued: Vec<Job>,
    pub failed: Vec<Job>,
}

impl StalledReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Per-queue counts, derived on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: bool,
}

/// `at + d`, or `None` past the representable range.
pub(crate) fn checked_after(at: DateTime<Utc>, d: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
}

/// `at + d`, clamped to the latest representable instant.
pub(crate) fn saturating_after(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    checked_after(at, d).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
