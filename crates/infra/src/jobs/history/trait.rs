use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use courier_core::HistoryId;

use super::query::{HistoryFilter, HistoryPage, Pagination};
use crate::jobs::types::DEFAULT_MAX_ATTEMPTS;

/// Lifecycle status recorded for a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Delayed,
    Stalled,
}

impl HistoryStatus {
    pub const ALL: [HistoryStatus; 6] = [
        HistoryStatus::Pending,
        HistoryStatus::Active,
        HistoryStatus::Completed,
        HistoryStatus::Failed,
        HistoryStatus::Delayed,
        HistoryStatus::Stalled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Pending => "PENDING",
            HistoryStatus::Active => "ACTIVE",
            HistoryStatus::Completed => "COMPLETED",
            HistoryStatus::Failed => "FAILED",
            HistoryStatus::Delayed => "DELAYED",
            HistoryStatus::Stalled => "STALLED",
        }
    }
}

impl std::fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HistoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HistoryStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown history status: {s}"))
    }
}

/// Audit entry for one submitted job, independent of queue-internal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHistoryRecord {
    pub id: HistoryId,
    pub queue_name: String,
    pub job_type: String,
    /// Payload snapshot taken at submission
    pub job_data: JsonValue,
    pub status: HistoryStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error: Option<String>,
    pub result: Option<JsonValue>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`HistoryStore::create`]. Records start out Pending.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJobHistory {
    pub queue_name: String,
    pub job_type: String,
    pub job_data: JsonValue,
    pub max_attempts: u32,
}

impl NewJobHistory {
    pub fn new(queue_name: impl Into<String>, job_type: impl Into<String>, job_data: JsonValue) -> Self {
        Self {
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            job_data,
            max_attempts: DEFAULT_MAX_ATTEMPTS as u32,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobHistoryUpdate {
    pub status: Option<HistoryStatus>,
    pub attempts: Option<u32>,
    pub error: Option<String>,
    pub result: Option<JsonValue>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobHistoryUpdate {
    pub fn status(status: HistoryStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn result(mut self, result: Option<JsonValue>) -> Self {
        self.result = result;
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub(crate) fn apply(self, record: &mut JobHistoryRecord, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(attempts) = self.attempts {
            record.attempts = attempts;
        }
        if self.error.is_some() {
            record.error = self.error;
        }
        if self.result.is_some() {
            record.result = self.result;
        }
        if self.started_at.is_some() {
            record.started_at = self.started_at;
        }
        if self.completed_at.is_some() {
            record.completed_at = self.completed_at;
        }
        record.updated_at = now;
    }
}

/// Record counts per status. Every status is present, zero when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryStats {
    counts: BTreeMap<HistoryStatus, u64>,
}

impl Default for HistoryStats {
    fn default() -> Self {
        Self {
            counts: HistoryStatus::ALL.into_iter().map(|s| (s, 0)).collect(),
        }
    }
}

impl HistoryStats {
    pub fn from_counts(counts: impl IntoIterator<Item = (HistoryStatus, u64)>) -> Self {
        let mut stats = Self::default();
        for (status, count) in counts {
            *stats.counts.entry(status).or_default() += count;
        }
        stats
    }

    pub fn get(&self, status: HistoryStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HistoryStatus, u64)> + '_ {
        self.counts.iter().map(|(s, c)| (*s, *c))
    }
}

/// History store operation error. Callers on the job path log these and carry on.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HistoryError {
    #[error("history store unavailable: {0}")]
    Unavailable(String),
    #[error("history record not found: {0}")]
    NotFound(HistoryId),
    #[error("history serialization error: {0}")]
    Serialization(String),
}

/// Durable audit trail of submitted jobs.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Insert a Pending record with zero attempts.
    async fn create(&self, new: NewJobHistory) -> Result<JobHistoryRecord, HistoryError>;

    async fn update(&self, id: HistoryId, update: JobHistoryUpdate) -> Result<(), HistoryError>;

    async fn get(&self, id: HistoryId) -> Result<Option<JobHistoryRecord>, HistoryError>;

    /// Matching records, newest first.
    async fn query(
        &self,
        filter: HistoryFilter,
        pagination: Pagination,
    ) -> Result<HistoryPage, HistoryError>;

    async fn stats(&self, queue_name: Option<&str>) -> Result<HistoryStats, HistoryError>;
}

#[async_trait::async_trait]
impl<S> HistoryStore for Arc<S>
where
    S: HistoryStore + ?Sized,
{
    async fn create(&self, new: NewJobHistory) -> Result<JobHistoryRecord, HistoryError> {
        (**self).create(new).await
    }

    async fn update(&self, id: HistoryId, update: JobHistoryUpdate) -> Result<(), HistoryError> {
        (**self).update(id, update).await
    }

    async fn get(&self, id: HistoryId) -> Result<Option<JobHistoryRecord>, HistoryError> {
        (**self).get(id).await
    }

    async fn query(
        &self,
        filter: HistoryFilter,
        pagination: Pagination,
    ) -> Result<HistoryPage, HistoryError> {
        (**self).query(filter, pagination).await
    }

    async fn stats(&self, queue_name: Option<&str>) -> Result<HistoryStats, HistoryError> {
        (**self).stats(queue_name).await
    }
}
