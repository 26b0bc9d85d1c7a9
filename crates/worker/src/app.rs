//! Wiring of stores, catalog, processors and dispatcher.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use courier_infra::jobs::{
    Dispatcher, DispatcherConfig, HandlerRegistry, HistoryStore, InMemoryHistoryStore,
    InMemoryQueueStore, JobCatalog, JobProducer, PostgresHistoryStore, QueueAdmin, QueueStore,
    RedisQueueStore,
};

use crate::config::WorkerConfig;
use crate::payloads::{build_catalog, EMAIL_QUEUE, USER_SYNC_QUEUE};
use crate::processors::build_registry;
use crate::services::{BrevoEmailSender, EmailSender, HttpUserSyncTarget, LogEmailSender};

pub type SharedQueueStore = Arc<dyn QueueStore>;
pub type SharedHistoryStore = Arc<dyn HistoryStore>;

/// Everything the worker and the admin commands share.
pub struct App {
    pub config: WorkerConfig,
    pub catalog: Arc<JobCatalog>,
    pub store: SharedQueueStore,
    pub history: SharedHistoryStore,
}

impl App {
    /// Connect to Redis and, when configured, Postgres.
    pub async fn connect(config: WorkerConfig) -> anyhow::Result<Self> {
        let store = RedisQueueStore::connect(&config.redis_url, &config.queue_prefix, config.lease)
            .await
            .context("failed to connect to redis")?;
        info!(prefix = %store.prefix(), "connected to redis");

        let history: SharedHistoryStore = match &config.database_url {
            Some(url) => {
                let history = PostgresHistoryStore::connect(url)
                    .await
                    .context("failed to connect to postgres")?;
                history
                    .ensure_schema()
                    .await
                    .context("failed to create job_history schema")?;
                Arc::new(history)
            }
            None => {
                warn!("DATABASE_URL not set; job history is kept in memory");
                InMemoryHistoryStore::arc()
            }
        };

        Ok(Self::with_stores(config, Arc::new(store), history))
    }

    /// Single-process setup: queue and history in memory.
    pub fn in_memory(config: WorkerConfig) -> Self {
        let store = InMemoryQueueStore::with_clock(courier_core::SystemClock::shared(), config.lease);
        Self::with_stores(config, Arc::new(store), InMemoryHistoryStore::arc())
    }

    pub fn with_stores(config: WorkerConfig, store: SharedQueueStore, history: SharedHistoryStore) -> Self {
        Self {
            config,
            catalog: Arc::new(build_catalog()),
            store,
            history,
        }
    }

    pub fn producer(&self) -> JobProducer<SharedQueueStore, SharedHistoryStore> {
        JobProducer::new(self.store.clone(), self.history.clone(), self.catalog.clone())
    }

    pub fn admin(&self) -> QueueAdmin<SharedQueueStore> {
        QueueAdmin::new(self.store.clone(), &self.catalog)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_name("courier-worker")
            .with_poll_interval(self.config.poll_interval)
            .with_concurrency(EMAIL_QUEUE, self.config.email_concurrency)
            .with_concurrency(USER_SYNC_QUEUE, self.config.user_sync_concurrency)
    }

    /// Brevo when a key is configured, otherwise log-only delivery.
    pub fn email_sender(&self) -> anyhow::Result<Arc<dyn EmailSender>> {
        match &self.config.brevo {
            Some(brevo) => {
                info!(sender = %brevo.sender_email, "email delivery via Brevo");
                Ok(Arc::new(BrevoEmailSender::new(brevo.clone())?))
            }
            None => {
                warn!("BREVO_API_KEY not configured; emails will be logged, not sent");
                Ok(Arc::new(LogEmailSender))
            }
        }
    }

    pub fn registry(&self) -> anyhow::Result<HandlerRegistry> {
        let sender = self.email_sender()?;
        let target = HttpUserSyncTarget::new(&self.config.backend_url)?;
        Ok(build_registry(
            sender,
            target,
            self.config.soft_fail_unauthorized(),
        ))
    }

    /// Serve every queue until `shutdown` resolves, then drain in-flight jobs.
    pub async fn run<F>(&self, registry: HandlerRegistry, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let dispatcher = Dispatcher::new(
            self.store.clone(),
            self.history.clone(),
            self.catalog.clone(),
            registry,
        )?;
        let handle = dispatcher.start(self.dispatcher_config())?;

        shutdown.await;
        info!("shutdown requested, waiting for in-flight jobs");

        let stats = handle.stats();
        handle.shutdown().await;
        info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            stalled = stats.stalled,
            uptime_secs = stats.uptime_secs,
            "worker stopped"
        );
        Ok(())
    }
}
