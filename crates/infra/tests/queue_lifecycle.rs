//! End-to-end queue scenarios against the in-memory stores.
//!
//! Time is driven by a `ManualClock` shared by the queue store, the history store and the
//! dispatcher, so backoff, delay and lease expiry are exercised without sleeping.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use courier_core::{Clock, ManualClock};
use courier_infra::jobs::{
    handler_fn, BackoffPolicy, Dispatcher, HandlerRegistry, HistoryStatus, HistoryStore,
    InMemoryHistoryStore, InMemoryQueueStore, JobCatalog, JobDefinition, JobOptions, JobProducer,
    JobState, LeaseSettings, ProcessError, ProcessOutcome, QueueAdmin, QueueStats, QueueStore,
    STALLED_REASON,
};

const EMAIL_QUEUE: &str = "email-queue";
const WELCOME: &str = "welcome-email";

struct Harness {
    clock: ManualClock,
    store: Arc<InMemoryQueueStore>,
    history: Arc<InMemoryHistoryStore>,
    catalog: Arc<JobCatalog>,
}

impl Harness {
    fn new() -> Self {
        let clock = ManualClock::starting_now();
        let catalog = JobCatalog::new().with(
            JobDefinition::new(EMAIL_QUEUE, WELCOME).with_options(
                JobOptions::default()
                    .with_max_attempts(3)
                    .with_backoff(BackoffPolicy::exponential(Duration::from_millis(2000))),
            ),
        );

        Self {
            store: Arc::new(InMemoryQueueStore::with_clock(
                clock.shared(),
                LeaseSettings::default(),
            )),
            history: Arc::new(InMemoryHistoryStore::with_clock(clock.shared())),
            catalog: Arc::new(catalog),
            clock,
        }
    }

    fn producer(&self) -> JobProducer<Arc<InMemoryQueueStore>, Arc<InMemoryHistoryStore>> {
        JobProducer::new(self.store.clone(), self.history.clone(), self.catalog.clone())
    }

    fn dispatcher(
        &self,
        registry: HandlerRegistry,
    ) -> Dispatcher<Arc<InMemoryQueueStore>, Arc<InMemoryHistoryStore>> {
        Dispatcher::new(
            self.store.clone(),
            self.history.clone(),
            self.catalog.clone(),
            registry,
        )
        .unwrap()
        .with_clock(self.clock.shared())
    }
}

fn failing_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(
        EMAIL_QUEUE,
        WELCOME,
        handler_fn(|_job| async { Err(ProcessError::failed("provider rejected")) }),
    );
    registry
}

fn succeeding_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(
        EMAIL_QUEUE,
        WELCOME,
        handler_fn(|_job| async { Ok(Some(json!({"sent": true}))) }),
    );
    registry
}

#[tokio::test]
async fn always_failing_job_exhausts_attempts_with_backoff() {
    let h = Harness::new();
    let dispatcher = h.dispatcher(failing_registry());

    let job_id = h
        .producer()
        .submit(EMAIL_QUEUE, WELCOME, json!({"email": "a@example.com", "name": "A"}), None)
        .await
        .unwrap();

    let first = dispatcher.process_next(EMAIL_QUEUE).await.unwrap().unwrap();
    match first {
        ProcessOutcome::Retrying {
            attempts_made,
            next_visible_at,
            ..
        } => {
            assert_eq!(attempts_made, 1);
            assert!(next_visible_at >= h.clock.now() + chrono::Duration::milliseconds(2000));
        }
        other => panic!("expected retry, got {other:?}"),
    }

    // not visible before the backoff elapses
    h.clock.advance(Duration::from_millis(1999));
    assert!(dispatcher.process_next(EMAIL_QUEUE).await.unwrap().is_none());
    h.clock.advance(Duration::from_millis(1));

    let second = dispatcher.process_next(EMAIL_QUEUE).await.unwrap().unwrap();
    assert!(matches!(second, ProcessOutcome::Retrying { attempts_made: 2, .. }));

    h.clock.advance(Duration::from_millis(4000));
    let third = dispatcher.process_next(EMAIL_QUEUE).await.unwrap().unwrap();
    assert!(matches!(third, ProcessOutcome::Failed { attempts_made: 3, .. }));

    // terminal: never handed out again
    h.clock.advance(Duration::from_secs(3600));
    assert!(dispatcher.process_next(EMAIL_QUEUE).await.unwrap().is_none());

    let job = h.store.get(EMAIL_QUEUE, job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 3);
    assert_eq!(job.failed_reason.as_deref(), Some("provider rejected"));

    let record = h
        .history
        .get(job.history_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, HistoryStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.error.as_deref(), Some("provider rejected"));
    assert!(record.completed_at.is_some());
}

#[tokio::test]
async fn delayed_job_becomes_visible_after_delay() {
    let h = Harness::new();

    let job_id = h
        .producer()
        .submit(
            EMAIL_QUEUE,
            WELCOME,
            json!({"email": "b@example.com"}),
            Some(Duration::from_millis(5000)),
        )
        .await
        .unwrap();

    assert!(h.store.dequeue(EMAIL_QUEUE).await.unwrap().is_none());
    assert_eq!(h.store.stats(EMAIL_QUEUE).await.unwrap().delayed, 1);

    h.clock.advance(Duration::from_millis(5000));
    let job = h.store.dequeue(EMAIL_QUEUE).await.unwrap().unwrap();
    assert_eq!(job.id, job_id);
    assert_eq!(job.attempts_made, 1);
}

#[tokio::test]
async fn paused_queue_holds_jobs_until_resumed() {
    let h = Harness::new();
    let admin = QueueAdmin::new(h.store.clone(), &h.catalog);

    admin.pause(EMAIL_QUEUE).await.unwrap();
    let job_id = h
        .producer()
        .submit(EMAIL_QUEUE, WELCOME, json!({"email": "c@example.com"}), None)
        .await
        .unwrap();

    assert!(h.store.dequeue(EMAIL_QUEUE).await.unwrap().is_none());

    admin.resume(EMAIL_QUEUE).await.unwrap();
    let job = h.store.dequeue(EMAIL_QUEUE).await.unwrap().unwrap();
    assert_eq!(job.id, job_id);
}

#[tokio::test]
async fn stats_reflect_completed_and_waiting_jobs() {
    let h = Harness::new();
    let dispatcher = h.dispatcher(succeeding_registry());
    let producer = h.producer();

    producer
        .submit(EMAIL_QUEUE, WELCOME, json!({"email": "d1@example.com"}), None)
        .await
        .unwrap();
    producer
        .submit(EMAIL_QUEUE, WELCOME, json!({"email": "d2@example.com"}), None)
        .await
        .unwrap();

    let outcome = dispatcher.process_next(EMAIL_QUEUE).await.unwrap().unwrap();
    assert!(matches!(outcome, ProcessOutcome::Completed { .. }));

    assert_eq!(
        h.store.stats(EMAIL_QUEUE).await.unwrap(),
        QueueStats {
            waiting: 1,
            active: 0,
            completed: 1,
            failed: 0,
            delayed: 0,
            paused: false,
        }
    );

    let stats = h.history.stats(Some(EMAIL_QUEUE)).await.unwrap();
    assert_eq!(stats.get(HistoryStatus::Completed), 1);
    assert_eq!(stats.get(HistoryStatus::Pending), 1);
}

#[tokio::test]
async fn parallel_workers_never_share_a_job() {
    let h = Harness::new();
    for i in 0..50 {
        h.store
            .enqueue(EMAIL_QUEUE, WELCOME, json!({"n": i}), JobOptions::default())
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = h.store.clone();
        tasks.push(tokio::spawn(async move {
            let mut leased = Vec::new();
            while let Some(job) = store.dequeue(EMAIL_QUEUE).await.unwrap() {
                leased.push(job.id);
                tokio::task::yield_now().await;
            }
            leased
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(seen.insert(id), "job {id} leased twice");
        }
    }
    assert_eq!(seen.len(), 50);
    assert_eq!(h.store.stats(EMAIL_QUEUE).await.unwrap().active, 50);
}

#[tokio::test]
async fn ack_is_idempotent() {
    let h = Harness::new();
    h.store
        .enqueue(EMAIL_QUEUE, WELCOME, json!({}), JobOptions::default())
        .await
        .unwrap();
    let job = h.store.dequeue(EMAIL_QUEUE).await.unwrap().unwrap();

    h.store
        .ack(EMAIL_QUEUE, job.lease(), Some(json!({"ok": true})))
        .await
        .unwrap();
    h.store.ack(EMAIL_QUEUE, job.lease(), None).await.unwrap();

    let stored = h.store.get(EMAIL_QUEUE, job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
    assert_eq!(stored.return_value, Some(json!({"ok": true})));
    assert_eq!(h.store.stats(EMAIL_QUEUE).await.unwrap().completed, 1);
}

#[tokio::test]
async fn stalled_job_is_requeued_once_then_failed() {
    let h = Harness::new();
    let dispatcher = h.dispatcher(succeeding_registry());
    let job_id = h
        .producer()
        .submit(EMAIL_QUEUE, WELCOME, json!({"email": "e@example.com"}), None)
        .await
        .unwrap();

    // a worker leases the job and disappears
    h.store.dequeue(EMAIL_QUEUE).await.unwrap().unwrap();
    h.clock.advance(Duration::from_secs(31));

    let report = dispatcher.recover_stalled(EMAIL_QUEUE).await.unwrap();
    assert_eq!(report.requeued.len(), 1);
    let history_id = report.requeued[0].history_id().unwrap();
    assert_eq!(
        h.history.get(history_id).await.unwrap().unwrap().status,
        HistoryStatus::Stalled
    );

    // and again
    h.store.dequeue(EMAIL_QUEUE).await.unwrap().unwrap();
    h.clock.advance(Duration::from_secs(31));

    let report = dispatcher.recover_stalled(EMAIL_QUEUE).await.unwrap();
    assert_eq!(report.failed.len(), 1);

    let job = h.store.get(EMAIL_QUEUE, job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failed_reason.as_deref(), Some(STALLED_REASON));

    let record = h.history.get(history_id).await.unwrap().unwrap();
    assert_eq!(record.status, HistoryStatus::Failed);
    assert_eq!(record.error.as_deref(), Some(STALLED_REASON));
}
