//! Job submission: validate, open a history record, enqueue.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use courier_core::{JobId, ValidationError};

use super::catalog::{JobCatalog, JobPayload};
use super::history::{HistoryStatus, HistoryStore, JobHistoryUpdate, NewJobHistory};
use super::store::{QueueStore, StoreError};
use super::types::HISTORY_ID_FIELD;

/// Submission error.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown job type {job_type} on queue {queue}")]
    UnknownJobType { queue: String, job_type: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("payload serialization error: {0}")]
    Serialization(String),
}

/// Validates and enqueues jobs declared in a [`JobCatalog`].
pub struct JobProducer<Q, H> {
    store: Q,
    history: H,
    catalog: Arc<JobCatalog>,
}

impl<Q, H> JobProducer<Q, H>
where
    Q: QueueStore,
    H: HistoryStore,
{
    pub fn new(store: Q, history: H, catalog: Arc<JobCatalog>) -> Self {
        Self {
            store,
            history,
            catalog,
        }
    }

    pub fn catalog(&self) -> &JobCatalog {
        &self.catalog
    }

    /// Submit an untyped payload.
    ///
    /// Nothing is persisted when validation fails. A history write failure is logged and the
    /// job is enqueued untracked. Store errors are returned as is; a history record opened
    /// for a job the store then refused is marked Failed.
    #[instrument(skip(self, payload), err)]
    pub async fn submit(
        &self,
        queue: &str,
        job_type: &str,
        mut payload: JsonValue,
        delay: Option<Duration>,
    ) -> Result<JobId, SubmitError> {
        let definition =
            self.catalog
                .definition(queue, job_type)
                .ok_or_else(|| SubmitError::UnknownJobType {
                    queue: queue.to_string(),
                    job_type: job_type.to_string(),
                })?;

        definition.validate(&payload)?;

        let mut options = definition.options;
        if let Some(delay) = delay {
            options = options.with_delay(delay);
        }

        let mut history_id = None;
        if definition.track_history {
            let new = NewJobHistory::new(queue, job_type, payload.clone())
                .with_max_attempts(options.max_attempts.max(1) as u32);
            match self.history.create(new).await {
                Ok(record) => match payload.as_object_mut() {
                    Some(fields) => {
                        fields.insert(HISTORY_ID_FIELD.to_string(), JsonValue::String(record.id.to_string()));
                        history_id = Some(record.id);
                    }
                    None => warn!(history_id = %record.id, "payload is not an object, history id not attached"),
                },
                Err(e) => warn!(error = %e, "failed to create job history record, enqueueing untracked"),
            }
        }

        let job_id = match self.store.enqueue(queue, job_type, payload, options).await {
            Ok(job_id) => job_id,
            Err(e) => {
                if let Some(id) = history_id {
                    let update = JobHistoryUpdate::status(HistoryStatus::Failed).error(e.to_string());
                    if let Err(history_err) = self.history.update(id, update).await {
                        warn!(history_id = %id, error = %history_err, "failed to update job history");
                    }
                }
                return Err(e.into());
            }
        };
        info!(%job_id, delay_ms = options.delay.as_millis() as u64, "job submitted");
        Ok(job_id)
    }

    /// Submit a typed payload to the queue and job type it is bound to.
    pub async fn submit_typed<P: JobPayload>(
        &self,
        payload: &P,
        delay: Option<Duration>,
    ) -> Result<JobId, SubmitError> {
        let value =
            serde_json::to_value(payload).map_err(|e| SubmitError::Serialization(e.to_string()))?;
        debug!(queue = P::QUEUE, job_type = P::JOB_TYPE, "submitting typed payload");
        self.submit(P::QUEUE, P::JOB_TYPE, value, delay).await
    }
}

#[cfg(test)]
mod tests {
    use serde::Serialize;
    use serde_json::json;

    use super::*;
    use crate::jobs::catalog::JobDefinition;
    use crate::jobs::history::{HistoryStatus, InMemoryHistoryStore};
    use crate::jobs::store::InMemoryQueueStore;
    use crate::jobs::types::JobState;

    #[derive(Serialize)]
    struct Ping {
        email: String,
    }

    impl JobPayload for Ping {
        const QUEUE: &'static str = "q";
        const JOB_TYPE: &'static str = "ping";
    }

    fn producer() -> (
        JobProducer<Arc<InMemoryQueueStore>, Arc<InMemoryHistoryStore>>,
        Arc<InMemoryQueueStore>,
        Arc<InMemoryHistoryStore>,
    ) {
        let catalog = JobCatalog::new()
            .with(JobDefinition::new("q", "ping").with_validator(|payload| {
                match payload.get("email").and_then(JsonValue::as_str) {
                    Some(email) if email.contains('@') => Ok(()),
                    _ => Err(ValidationError::field("email", "Invalid email address")),
                }
            }))
            .with(JobDefinition::new("q", "quiet").untracked());

        let store = InMemoryQueueStore::arc();
        let history = InMemoryHistoryStore::arc();
        let producer = JobProducer::new(store.clone(), history.clone(), Arc::new(catalog));
        (producer, store, history)
    }

    #[tokio::test]
    async fn tracked_submit_embeds_history_id() {
        let (producer, store, history) = producer();

        let id = producer
            .submit_typed(&Ping { email: "a@example.com".into() }, None)
            .await
            .unwrap();

        let job = store.get("q", id).await.unwrap().unwrap();
        let history_id = job.history_id().expect("history id attached");
        let record = history.get(history_id).await.unwrap().unwrap();

        assert_eq!(record.status, HistoryStatus::Pending);
        assert_eq!(record.job_data, json!({"email": "a@example.com"}));
        assert_eq!(record.max_attempts, 3);
    }

    #[tokio::test]
    async fn invalid_payload_persists_nothing() {
        let (producer, store, history) = producer();

        let err = producer
            .submit("q", "ping", json!({"email": "nope"}), None)
            .await
            .unwrap_err();
        match err {
            SubmitError::Validation(v) => {
                assert_eq!(v.messages_for("email"), vec!["Invalid email address"])
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(store.stats("q").await.unwrap().waiting, 0);
        assert_eq!(history.stats(None).await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn out_of_range_delay_fails_the_history_record() {
        let (producer, store, history) = producer();

        let err = producer
            .submit(
                "q",
                "ping",
                json!({"email": "a@example.com"}),
                Some(Duration::from_millis(u64::MAX)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Store(StoreError::InvalidJobSpec(_))));

        assert_eq!(store.stats("q").await.unwrap(), Default::default());
        let stats = history.stats(None).await.unwrap();
        assert_eq!(stats.total(), 1);
        assert_eq!(stats.get(HistoryStatus::Failed), 1);
    }

    #[tokio::test]
    async fn unknown_job_type_is_rejected() {
        let (producer, _, _) = producer();
        assert!(matches!(
            producer.submit("q", "nope", json!({}), None).await,
            Err(SubmitError::UnknownJobType { .. })
        ));
    }

    #[tokio::test]
    async fn delay_and_untracked_types() {
        let (producer, store, history) = producer();

        let id = producer
            .submit("q", "quiet", json!({"x": 1}), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        let job = store.get("q", id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert!(job.history_id().is_none());
        assert_eq!(history.stats(None).await.unwrap().total(), 0);
    }
}
