//! Job handlers, resolved by `(queue, job type)`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use super::catalog::JobCatalog;
use super::types::Job;

/// A job attempt failed. Every variant drives the retry state machine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProcessError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("{0}")]
    Failed(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
    #[error("no handler registered for {queue}/{job_type}")]
    UnknownJobType { queue: String, job_type: String },
}

impl ProcessError {
    pub fn failed(err: impl std::fmt::Display) -> Self {
        ProcessError::Failed(err.to_string())
    }
}

impl From<serde_json::Error> for ProcessError {
    fn from(err: serde_json::Error) -> Self {
        ProcessError::InvalidPayload(err.to_string())
    }
}

/// Processes one job type. `Ok` acknowledges the job with an optional result.
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Option<JsonValue>, ProcessError>;
}

/// Adapts an async closure taking an owned [`Job`].
pub struct FnHandler<F>(F);

/// Wrap a closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<JsonValue>, ProcessError>> + Send,
{
    FnHandler(f)
}

#[async_trait::async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<JsonValue>, ProcessError>> + Send,
{
    async fn handle(&self, job: &Job) -> Result<Option<JsonValue>, ProcessError> {
        (self.0)(job.clone()).await
    }
}

#[async_trait::async_trait]
impl<H> JobHandler for Arc<H>
where
    H: JobHandler + ?Sized,
{
    async fn handle(&self, job: &Job) -> Result<Option<JsonValue>, ProcessError> {
        (**self).handle(job).await
    }
}

/// Explicit job type → handler wiring, built at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &keys).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, queue: impl Into<String>, job_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers
            .insert((queue.into(), job_type.into()), Arc::new(handler));
        self
    }

    /// Register one handler under several job types of the same queue.
    pub fn register_shared(
        &mut self,
        queue: &str,
        job_types: &[&str],
        handler: Arc<dyn JobHandler>,
    ) -> &mut Self {
        for job_type in job_types {
            self.handlers
                .insert((queue.to_string(), job_type.to_string()), handler.clone());
        }
        self
    }

    pub fn get(&self, queue: &str, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .get(&(queue.to_string(), job_type.to_string()))
            .cloned()
    }

    /// Catalog entries with no handler, as `(queue, job type)`.
    pub fn missing_for(&self, catalog: &JobCatalog) -> Vec<(String, String)> {
        catalog
            .definitions()
            .filter(|d| !self.handlers.contains_key(&(d.queue.clone(), d.job_type.clone())))
            .map(|d| (d.queue.clone(), d.job_type.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
