//! Worker dispatcher: leases jobs from a queue store and runs their handlers.
//!
//! Per queue the dispatcher runs N poll loops plus one stall checker, all tokio tasks.
//! The only synchronization between loops (and between processes) is the store's
//! atomic lease. History writes are best-effort: failures are logged, never propagated.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use courier_core::{HistoryId, JobId, SharedClock, SystemClock};

use super::catalog::JobCatalog;
use super::history::{HistoryStatus, HistoryStore, JobHistoryUpdate};
use super::registry::{HandlerRegistry, ProcessError};
use super::store::{QueueStore, StoreError};
use super::types::{Job, LeaseToken, NackOutcome, StalledReport, STALLED_REASON};

/// Floor for timer periods derived from the lease length.
const MIN_TICK: Duration = Duration::from_millis(10);

/// Fatal startup misconfiguration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no handler registered for {queue}/{job_type}")]
    MissingHandler { queue: String, job_type: String },
    #[error("queue {0} is not declared in the job catalog")]
    UnknownQueue(String),
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Sleep between polls of an empty (or paused) queue
    pub poll_interval: Duration,
    /// Poll loops per queue unless overridden
    pub default_concurrency: usize,
    /// Per-queue overrides
    pub concurrency: HashMap<String, usize>,
    /// Queues to serve; every catalog queue when `None`
    pub queues: Option<Vec<String>>,
    /// Name for logging
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            default_concurrency: 1,
            concurrency: HashMap::new(),
            queues: None,
            name: "dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_default_concurrency(mut self, concurrency: usize) -> Self {
        self.default_concurrency = concurrency;
        self
    }

    pub fn with_concurrency(mut self, queue: impl Into<String>, concurrency: usize) -> Self {
        self.concurrency.insert(queue.into(), concurrency);
        self
    }

    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = Some(queues.into_iter().map(Into::into).collect());
        self
    }

    /// `(queue, poll loops)` for every served queue.
    fn plan(&self, catalog: &JobCatalog) -> Result<Vec<(String, usize)>, ConfigError> {
        if let Some(unknown) = self.concurrency.keys().find(|q| !catalog.has_queue(q)) {
            return Err(ConfigError::UnknownQueue(unknown.clone()));
        }

        let queues: Vec<String> = match &self.queues {
            Some(queues) => {
                if let Some(unknown) = queues.iter().find(|q| !catalog.has_queue(q)) {
                    return Err(ConfigError::UnknownQueue(unknown.clone()));
                }
                queues.clone()
            }
            None => catalog.queues().into_iter().map(str::to_string).collect(),
        };

        Ok(queues
            .into_iter()
            .map(|queue| {
                let n = self
                    .concurrency
                    .get(&queue)
                    .copied()
                    .unwrap_or(self.default_concurrency)
                    .max(1);
                (queue, n)
            })
            .collect())
    }
}

/// What happened to a processed job.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Completed {
        job_id: JobId,
        result: Option<JsonValue>,
    },
    Retrying {
        job_id: JobId,
        attempts_made: u32,
        next_visible_at: DateTime<Utc>,
    },
    Failed {
        job_id: JobId,
        attempts_made: u32,
        error: String,
    },
    /// The lease ran out while the handler worked; the job now belongs to stall recovery
    /// or another worker, so the handler's result was discarded.
    LeaseLost { lease: LeaseToken },
}

impl ProcessOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            ProcessOutcome::Completed { job_id, .. }
            | ProcessOutcome::Retrying { job_id, .. }
            | ProcessOutcome::Failed { job_id, .. } => *job_id,
            ProcessOutcome::LeaseLost { lease } => lease.job_id,
        }
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub stalled: u64,
    pub running: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    stalled: AtomicU64,
    running: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self, uptime: Duration) -> DispatcherStats {
        DispatcherStats {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            stalled: self.stalled.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            uptime_secs: uptime.as_secs(),
        }
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Handle to a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    counters: Arc<StatsCounters>,
    started: Instant,
}

impl DispatcherHandle {
    /// Stop polling, let in-flight handlers finish, and join every task.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(dispatcher = %self.name, error = %e, "dispatcher task aborted");
            }
        }
        info!(dispatcher = %self.name, "dispatcher stopped");
    }

    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot(self.started.elapsed())
    }
}

/// Runs registered handlers against jobs leased from a [`QueueStore`].
pub struct Dispatcher<Q, H> {
    store: Q,
    history: H,
    catalog: Arc<JobCatalog>,
    registry: HandlerRegistry,
    clock: SharedClock,
    counters: Arc<StatsCounters>,
}

impl<Q, H> Dispatcher<Q, H>
where
    Q: QueueStore + 'static,
    H: HistoryStore + 'static,
{
    /// Fails with `MissingHandler` unless every catalog job type has a handler.
    pub fn new(
        store: Q,
        history: H,
        catalog: Arc<JobCatalog>,
        registry: HandlerRegistry,
    ) -> Result<Self, ConfigError> {
        let missing = registry.missing_for(&catalog);
        if let Some((queue, job_type)) = missing.into_iter().next() {
            return Err(ConfigError::MissingHandler { queue, job_type });
        }

        Ok(Self {
            store,
            history,
            catalog,
            registry,
            clock: SystemClock::shared(),
            counters: Arc::new(StatsCounters::default()),
        })
    }

    /// Clock used for history timestamps.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot(Duration::ZERO)
    }

    /// Lease and process at most one job from `queue`. `None` when nothing is visible.
    pub async fn process_next(&self, queue: &str) -> Result<Option<ProcessOutcome>, StoreError> {
        let Some(job) = self.store.dequeue(queue).await? else {
            return Ok(None);
        };
        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts_made,
            max_attempts = job.max_attempts,
            "job leased"
        );
        self.run(job).await.map(Some)
    }

    /// Recover expired leases on `queue` and mirror the result into history.
    pub async fn recover_stalled(&self, queue: &str) -> Result<StalledReport, StoreError> {
        let report = self.store.recover_stalled(queue).await?;
        let now = self.clock.now();

        for job in &report.requeued {
            warn!(job_id = %job.id, job_type = %job.job_type, stalled_count = job.stalled_count, "job stalled, requeued");
            if let Some(id) = job.history_id() {
                self.record(id, JobHistoryUpdate::status(HistoryStatus::Stalled).attempts(job.attempts_made))
                    .await;
            }
        }
        for job in &report.failed {
            error!(job_id = %job.id, job_type = %job.job_type, stalled_count = job.stalled_count, "job stalled too often, failed");
            if let Some(id) = job.history_id() {
                let update = JobHistoryUpdate::status(HistoryStatus::Failed)
                    .attempts(job.attempts_made)
                    .error(STALLED_REASON)
                    .completed_at(now);
                self.record(id, update).await;
            }
        }

        bump(&self.counters.stalled, (report.requeued.len() + report.failed.len()) as u64);
        bump(&self.counters.failed, report.failed.len() as u64);
        Ok(report)
    }

    /// Spawn poll loops and stall checkers on the current tokio runtime.
    pub fn start(self, config: DispatcherConfig) -> Result<DispatcherHandle, ConfigError> {
        let plan = config.plan(&self.catalog)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let this = Arc::new(self);
        let mut tasks = Vec::new();

        for (queue, concurrency) in &plan {
            for worker in 0..*concurrency {
                let span = info_span!("worker", queue = %queue, worker);
                let task = worker_loop(
                    this.clone(),
                    queue.clone(),
                    config.poll_interval,
                    shutdown_rx.clone(),
                );
                tasks.push(tokio::spawn(task.instrument(span)));
            }

            let span = info_span!("stall_checker", queue = %queue);
            let task = stall_loop(this.clone(), queue.clone(), shutdown_rx.clone());
            tasks.push(tokio::spawn(task.instrument(span)));
        }

        info!(dispatcher = %config.name, queues = ?plan, "dispatcher started");

        Ok(DispatcherHandle {
            name: config.name,
            shutdown: shutdown_tx,
            tasks,
            counters: this.counters.clone(),
            started: Instant::now(),
        })
    }

    async fn run(&self, job: Job) -> Result<ProcessOutcome, StoreError> {
        let queue = job.queue_name.as_str();
        let history_id = job.history_id();

        if let Some(id) = history_id {
            let update = JobHistoryUpdate::status(HistoryStatus::Active)
                .attempts(job.attempts_made)
                .started_at(self.clock.now());
            self.record(id, update).await;
        }

        bump(&self.counters.running, 1);
        let result = self.invoke(&job).await;
        self.counters.running.fetch_sub(1, Ordering::Relaxed);
        bump(&self.counters.processed, 1);

        let lease = job.lease();
        match result {
            Ok(value) => {
                if let Err(e) = self.store.ack(queue, lease, value.clone()).await {
                    return self.settle_rejected(&job, e);
                }
                bump(&self.counters.succeeded, 1);
                info!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts_made, "job completed");

                if let Some(id) = history_id {
                    let update = JobHistoryUpdate::status(HistoryStatus::Completed)
                        .result(value.clone())
                        .completed_at(self.clock.now());
                    self.record(id, update).await;
                }
                Ok(ProcessOutcome::Completed {
                    job_id: job.id,
                    result: value,
                })
            }
            Err(err) => {
                let message = err.to_string();
                let outcome = match self.store.nack(queue, lease, &message).await {
                    Ok(outcome) => outcome,
                    Err(e) => return self.settle_rejected(&job, e),
                };

                match outcome {
                    NackOutcome::Retry {
                        attempts_made,
                        next_visible_at,
                    } => {
                        bump(&self.counters.retried, 1);
                        warn!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            attempt = attempts_made,
                            max_attempts = job.max_attempts,
                            %next_visible_at,
                            error = %message,
                            "job failed, retry scheduled"
                        );
                        if let Some(id) = history_id {
                            let update = JobHistoryUpdate::status(HistoryStatus::Delayed)
                                .attempts(attempts_made)
                                .error(message);
                            self.record(id, update).await;
                        }
                        Ok(ProcessOutcome::Retrying {
                            job_id: job.id,
                            attempts_made,
                            next_visible_at,
                        })
                    }
                    NackOutcome::Failed { attempts_made } => {
                        bump(&self.counters.failed, 1);
                        error!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            attempts = attempts_made,
                            error = %message,
                            "job failed permanently"
                        );
                        if let Some(id) = history_id {
                            let update = JobHistoryUpdate::status(HistoryStatus::Failed)
                                .attempts(attempts_made)
                                .error(message.clone())
                                .completed_at(self.clock.now());
                            self.record(id, update).await;
                        }
                        Ok(ProcessOutcome::Failed {
                            job_id: job.id,
                            attempts_made,
                            error: message,
                        })
                    }
                }
            }
        }
    }

    /// A settle call was rejected. A lost lease is reported as an outcome and leaves history
    /// to whoever holds the job now; anything else is a store failure.
    fn settle_rejected(&self, job: &Job, err: StoreError) -> Result<ProcessOutcome, StoreError> {
        match err {
            StoreError::LeaseLost(lease) => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = lease.attempt,
                    "lease lost before the job was settled, result discarded"
                );
                Ok(ProcessOutcome::LeaseLost { lease })
            }
            other => Err(other),
        }
    }

    /// Run the handler, renewing the lease while it works. Panics become failures.
    async fn invoke(&self, job: &Job) -> Result<Option<JsonValue>, ProcessError> {
        let handler = self
            .registry
            .get(&job.queue_name, &job.job_type)
            .ok_or_else(|| ProcessError::UnknownJobType {
                queue: job.queue_name.clone(),
                job_type: job.job_type.clone(),
            })?;

        let work = AssertUnwindSafe(handler.handle(job)).catch_unwind();
        tokio::pin!(work);

        let renew_every = (self.store.lease_settings().stalled_interval / 2).max(MIN_TICK);
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);

        loop {
            tokio::select! {
                outcome = &mut work => {
                    return outcome.unwrap_or_else(|panic| Err(ProcessError::Panicked(panic_message(panic.as_ref()))));
                }
                _ = renew.tick() => self.renew_lease(job).await,
            }
        }
    }

    async fn renew_lease(&self, job: &Job) {
        match self.store.extend_lease(&job.queue_name, job.lease()).await {
            Ok(()) => debug!(job_id = %job.id, "lease extended"),
            Err(StoreError::LeaseLost(_)) => {
                warn!(job_id = %job.id, "lease lost while handler still running")
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "failed to extend lease"),
        }
    }

    async fn record(&self, id: HistoryId, update: JobHistoryUpdate) {
        if let Err(e) = self.history.update(id, update).await {
            warn!(history_id = %id, error = %e, "failed to update job history");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn worker_loop<Q, H>(
    dispatcher: Arc<Dispatcher<Q, H>>,
    queue: String,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    Q: QueueStore + 'static,
    H: HistoryStore + 'static,
{
    debug!("worker started");

    while !*shutdown.borrow() {
        let idle = match dispatcher.process_next(&queue).await {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                error!(error = %e, "failed to process job");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    debug!("worker stopped");
}

async fn stall_loop<Q, H>(
    dispatcher: Arc<Dispatcher<Q, H>>,
    queue: String,
    mut shutdown: watch::Receiver<bool>,
) where
    Q: QueueStore + 'static,
    H: HistoryStore + 'static,
{
    let every = dispatcher.store.lease_settings().stalled_interval.max(MIN_TICK);
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = dispatcher.recover_stalled(&queue).await {
                    error!(error = %e, "stall check failed");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32};

    use courier_core::ManualClock;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::jobs::catalog::JobDefinition;
    use crate::jobs::history::{HistoryStore, InMemoryHistoryStore, NewJobHistory};
    use crate::jobs::registry::handler_fn;
    use crate::jobs::store::{InMemoryQueueStore, LeaseSettings};
    use crate::jobs::types::{JobOptions, JobState, HISTORY_ID_FIELD};

    fn catalog() -> Arc<JobCatalog> {
        Arc::new(JobCatalog::new().with(JobDefinition::new("q", "t")))
    }

    fn dispatcher_with(
        registry: HandlerRegistry,
    ) -> (
        Dispatcher<Arc<InMemoryQueueStore>, Arc<InMemoryHistoryStore>>,
        Arc<InMemoryQueueStore>,
        Arc<InMemoryHistoryStore>,
    ) {
        let store = InMemoryQueueStore::arc();
        let history = InMemoryHistoryStore::arc();
        let dispatcher = Dispatcher::new(store.clone(), history.clone(), catalog(), registry).unwrap();
        (dispatcher, store, history)
    }

    #[test]
    fn missing_handler_is_a_config_error() {
        let err = Dispatcher::new(
            InMemoryQueueStore::arc(),
            InMemoryHistoryStore::arc(),
            catalog(),
            HandlerRegistry::new(),
        )
        .err()
        .unwrap();

        assert_eq!(
            err,
            ConfigError::MissingHandler {
                queue: "q".to_string(),
                job_type: "t".to_string()
            }
        );
    }

    #[test]
    fn config_rejects_unknown_queue() {
        let config = DispatcherConfig::default().with_concurrency("nope", 2);
        assert_eq!(
            config.plan(&catalog()),
            Err(ConfigError::UnknownQueue("nope".to_string()))
        );

        let plan = DispatcherConfig::default()
            .with_concurrency("q", 3)
            .plan(&catalog())
            .unwrap();
        assert_eq!(plan, vec![("q".to_string(), 3)]);
    }

    #[tokio::test]
    async fn success_acks_and_records_history() {
        let mut registry = HandlerRegistry::new();
        registry.register("q", "t", handler_fn(|_job| async { Ok(Some(json!({"sent": true}))) }));
        let (dispatcher, store, history) = dispatcher_with(registry);

        let record = history.create(NewJobHistory::new("q", "t", json!({}))).await.unwrap();
        let id = store
            .enqueue("q", "t", json!({ HISTORY_ID_FIELD: record.id }), JobOptions::default())
            .await
            .unwrap();

        let outcome = dispatcher.process_next("q").await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Completed {
                job_id: id,
                result: Some(json!({"sent": true}))
            }
        );

        let stored = history.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, HistoryStatus::Completed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.result, Some(json!({"sent": true})));
        assert!(stored.started_at.is_some() && stored.completed_at.is_some());
        assert_eq!(dispatcher.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn failure_is_retried_then_recorded_as_delayed() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "q",
            "t",
            handler_fn(|_job| async { Err(ProcessError::failed("smtp down")) }),
        );
        let (dispatcher, store, history) = dispatcher_with(registry);

        let record = history.create(NewJobHistory::new("q", "t", json!({}))).await.unwrap();
        store
            .enqueue("q", "t", json!({ HISTORY_ID_FIELD: record.id }), JobOptions::default())
            .await
            .unwrap();

        let outcome = dispatcher.process_next("q").await.unwrap().unwrap();
        assert!(matches!(outcome, ProcessOutcome::Retrying { attempts_made: 1, .. }));

        let stored = history.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, HistoryStatus::Delayed);
        assert_eq!(stored.error.as_deref(), Some("smtp down"));
        assert_eq!(dispatcher.stats().retried, 1);
    }

    #[tokio::test]
    async fn panicking_handler_counts_as_failure() {
        let mut registry = HandlerRegistry::new();
        registry.register(
            "q",
            "t",
            handler_fn(|job: Job| async move {
                if job.attempts_made > 0 {
                    panic!("handler blew up");
                }
                Ok(None)
            }),
        );
        let (dispatcher, store, _) = dispatcher_with(registry);

        let id = store
            .enqueue("q", "t", json!({}), JobOptions::default().with_max_attempts(1))
            .await
            .unwrap();

        let outcome = dispatcher.process_next("q").await.unwrap().unwrap();
        match outcome {
            ProcessOutcome::Failed { error, .. } => assert!(error.contains("handler blew up")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(store.get("q", id).await.unwrap().unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn unknown_job_type_is_nacked() {
        let mut registry = HandlerRegistry::new();
        registry.register("q", "t", handler_fn(|_job| async { Ok(None) }));
        let (dispatcher, store, _) = dispatcher_with(registry);

        store
            .enqueue("q", "mystery", json!({}), JobOptions::default().with_max_attempts(1))
            .await
            .unwrap();

        let outcome = dispatcher.process_next("q").await.unwrap().unwrap();
        match outcome {
            ProcessOutcome::Failed { error, .. } => assert!(error.contains("q/mystery")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn started_dispatcher_drains_queue_and_shuts_down() {
        let handled = Arc::new(AtomicU32::new(0));
        let counter = handled.clone();

        let mut registry = HandlerRegistry::new();
        registry.register(
            "q",
            "t",
            handler_fn(move |_job| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            }),
        );
        let (dispatcher, store, _) = dispatcher_with(registry);

        for _ in 0..5 {
            store.enqueue("q", "t", json!({}), JobOptions::default()).await.unwrap();
        }

        let handle = dispatcher
            .start(
                DispatcherConfig::default()
                    .with_poll_interval(Duration::from_millis(10))
                    .with_concurrency("q", 2),
            )
            .unwrap();

        for _ in 0..200 {
            if handle.stats().succeeded == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = handle.stats();
        handle.shutdown().await;

        assert_eq!(handled.load(Ordering::SeqCst), 5);
        assert_eq!(stats.succeeded, 5);
        assert_eq!(store.stats("q").await.unwrap().completed, 5);
    }

    #[tokio::test]
    async fn stale_result_is_discarded_once_the_job_is_re_leased() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryQueueStore::with_clock(clock.shared(), LeaseSettings::default()));
        let history = InMemoryHistoryStore::arc();
        let rival = Arc::new(std::sync::Mutex::new(None));

        let mut registry = HandlerRegistry::new();
        let (slow_store, slow_clock, taken) = (store.clone(), clock.clone(), rival.clone());
        registry.register(
            "q",
            "t",
            handler_fn(move |_job| {
                let (store, clock, taken) = (slow_store.clone(), slow_clock.clone(), taken.clone());
                async move {
                    // The lease runs out mid-handler and another worker picks the job up.
                    clock.advance(Duration::from_secs(31));
                    store.recover_stalled("q").await.map_err(ProcessError::failed)?;
                    let job = store.dequeue("q").await.map_err(ProcessError::failed)?;
                    *taken.lock().unwrap() = job.map(|j| j.lease());
                    Err(ProcessError::failed("gave up late"))
                }
            }),
        );
        let dispatcher = Dispatcher::new(store.clone(), history.clone(), catalog(), registry).unwrap();

        let record = history.create(NewJobHistory::new("q", "t", json!({}))).await.unwrap();
        let id = store
            .enqueue("q", "t", json!({ HISTORY_ID_FIELD: record.id }), JobOptions::default())
            .await
            .unwrap();

        let outcome = dispatcher.process_next("q").await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::LeaseLost {
                lease: LeaseToken {
                    job_id: id,
                    attempt: 1
                }
            }
        );

        let current = rival.lock().unwrap().expect("job re-leased");
        let job = store.get("q", id).await.unwrap().unwrap();
        assert!(job.is_held_by(current));
        assert_eq!(job.failed_reason, None);

        let stored = history.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, HistoryStatus::Active);
        assert_eq!(stored.error, None);
        assert_eq!(dispatcher.stats().retried, 0);
    }

    #[tokio::test]
    async fn long_handler_keeps_its_lease_and_shutdown_waits_for_it() {
        let lease = LeaseSettings {
            stalled_interval: Duration::from_millis(400),
            max_stalled_count: 1,
        };
        let store = Arc::new(InMemoryQueueStore::with_clock(SystemClock::shared(), lease));
        let started = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));

        let mut registry = HandlerRegistry::new();
        let (on_start, on_finish) = (started.clone(), finished.clone());
        registry.register(
            "q",
            "t",
            handler_fn(move |_job| {
                let (on_start, on_finish) = (on_start.clone(), on_finish.clone());
                async move {
                    on_start.notify_one();
                    tokio::time::sleep(Duration::from_millis(1200)).await;
                    on_finish.store(true, Ordering::SeqCst);
                    Ok(None)
                }
            }),
        );
        let dispatcher =
            Dispatcher::new(store.clone(), InMemoryHistoryStore::arc(), catalog(), registry).unwrap();
        let id = store.enqueue("q", "t", json!({}), JobOptions::default()).await.unwrap();

        let handle = dispatcher
            .start(DispatcherConfig::default().with_poll_interval(Duration::from_millis(10)))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), started.notified())
            .await
            .unwrap();

        // Past the original lease: only renewal keeps the job from stalling.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(store.recover_stalled("q").await.unwrap().is_empty());
        let job = store.get("q", id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.stalled_count, 0);
        assert!(!finished.load(Ordering::SeqCst));

        handle.shutdown().await;

        assert!(finished.load(Ordering::SeqCst));
        let job = store.get("q", id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.stalled_count, 0);
    }
}
