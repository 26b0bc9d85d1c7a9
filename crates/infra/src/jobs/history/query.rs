//! Filters and paging for history inspection.

use serde::{Deserialize, Serialize};

use super::r#trait::{HistoryStatus, JobHistoryRecord};

/// Default page size.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Pagination parameters for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    /// 0-based
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Optional filters, combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub queue_name: Option<String>,
    pub job_type: Option<String>,
    pub status: Option<HistoryStatus>,
}

impl HistoryFilter {
    pub fn queue(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: Some(queue_name.into()),
            ..Default::default()
        }
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_status(mut self, status: HistoryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, record: &JobHistoryRecord) -> bool {
        self.queue_name.as_deref().is_none_or(|q| record.queue_name == q)
            && self.job_type.as_deref().is_none_or(|t| record.job_type == t)
            && self.status.is_none_or(|s| record.status == s)
    }
}

/// One page of history, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub records: Vec<JobHistoryRecord>,
    /// Matching records across all pages
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl HistoryPage {
    pub(crate) fn new(records: Vec<JobHistoryRecord>, total: u64, pagination: Pagination) -> Self {
        let has_more = total > u64::from(pagination.offset) + u64::from(pagination.limit);
        Self {
            records,
            total,
            pagination,
            has_more,
        }
    }
}
