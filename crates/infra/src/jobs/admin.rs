//! Operator actions over the declared queues.

use std::collections::BTreeMap;

use futures::future::join_all;
use tracing::{info, instrument, warn};

use super::catalog::JobCatalog;
use super::store::{QueueStore, StoreError};
use super::types::{JobState, QueueStats};

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Some queues of a multi-queue action failed; the others went through.
    #[error("{} queue(s) failed: {}", failures.len(), describe(failures))]
    Partial { failures: Vec<(String, StoreError)> },
}

fn describe(failures: &[(String, StoreError)]) -> String {
    failures
        .iter()
        .map(|(queue, e)| format!("{queue}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Pause, resume, clear, and inspect queues. Only queues known to the catalog are accepted.
pub struct QueueAdmin<Q> {
    store: Q,
    queues: Vec<String>,
}

impl<Q: QueueStore> QueueAdmin<Q> {
    pub fn new(store: Q, catalog: &JobCatalog) -> Self {
        Self {
            store,
            queues: catalog.queues().into_iter().map(str::to_string).collect(),
        }
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    fn known(&self, queue: &str) -> Result<(), AdminError> {
        if self.queues.iter().any(|q| q == queue) {
            Ok(())
        } else {
            Err(AdminError::UnknownQueue(queue.to_string()))
        }
    }

    /// Remove every Waiting and Delayed job.
    #[instrument(skip(self), err)]
    pub async fn clear(&self, queue: &str) -> Result<u64, AdminError> {
        self.known(queue)?;
        let removed = self.store.drain(queue).await?;
        info!(queue, removed, "queue cleared");
        Ok(removed)
    }

    #[instrument(skip(self), err)]
    pub async fn clear_completed(&self, queue: &str) -> Result<u64, AdminError> {
        self.known(queue)?;
        let removed = self.store.purge(queue, JobState::Completed).await?;
        info!(queue, removed, "completed jobs cleared");
        Ok(removed)
    }

    #[instrument(skip(self), err)]
    pub async fn clear_failed(&self, queue: &str) -> Result<u64, AdminError> {
        self.known(queue)?;
        let removed = self.store.purge(queue, JobState::Failed).await?;
        info!(queue, removed, "failed jobs cleared");
        Ok(removed)
    }

    /// Stop handing out jobs. Jobs already Active run to completion.
    #[instrument(skip(self), err)]
    pub async fn pause(&self, queue: &str) -> Result<(), AdminError> {
        self.known(queue)?;
        self.store.pause(queue).await?;
        info!(queue, "queue paused");
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn resume(&self, queue: &str) -> Result<(), AdminError> {
        self.known(queue)?;
        self.store.resume(queue).await?;
        info!(queue, "queue resumed");
        Ok(())
    }

    pub async fn stats(&self, queue: &str) -> Result<QueueStats, AdminError> {
        self.known(queue)?;
        Ok(self.store.stats(queue).await?)
    }

    /// Stats for every declared queue, keyed by name.
    pub async fn stats_summary(&self) -> Result<BTreeMap<String, QueueStats>, AdminError> {
        let results = join_all(self.queues.iter().map(|q| self.store.stats(q))).await;
        let mut summary = BTreeMap::new();
        for (queue, result) in self.queues.iter().zip(results) {
            summary.insert(queue.clone(), result?);
        }
        Ok(summary)
    }

    /// Drain every declared queue concurrently.
    ///
    /// All queues are attempted; failures are collected into `AdminError::Partial`.
    #[instrument(skip(self), err)]
    pub async fn clear_all(&self) -> Result<BTreeMap<String, u64>, AdminError> {
        let results = join_all(self.queues.iter().map(|q| self.store.drain(q))).await;

        let mut cleared = BTreeMap::new();
        let mut failures = Vec::new();
        for (queue, result) in self.queues.iter().zip(results) {
            match result {
                Ok(removed) => {
                    cleared.insert(queue.clone(), removed);
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "failed to clear queue");
                    failures.push((queue.clone(), e));
                }
            }
        }

        if failures.is_empty() {
            info!(queues = cleared.len(), "all queues cleared");
            Ok(cleared)
        } else {
            Err(AdminError::Partial { failures })
        }
    }
}
