//! The queue manager: one handle over every named queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::worker::WorkerConfig;
use super::{
    BackendKind, InMemoryQueueBackend, Job, JobHandler, JobId, JobOptions, JobStatus,
    QueueBackend, QueueCounts, QueueEventListener, QueueEvents, RedisQueueBackend,
    TracingEventListener,
};
use crate::config::{QueueSettings, RedisConfig};
use crate::error::{CourierError, ErrorCode, ErrorContext, Result};
use crate::telemetry::{QueueMetrics, SensitiveFieldRedactor};

/// Backend selection, fixed for the lifetime of the manager.
#[derive(Clone)]
enum QueueDriver {
    Memory,
    Redis {
        conn: redis::aio::ConnectionManager,
        key_prefix: String,
        workers: WorkerConfig,
    },
}

/// Owns the named queues and routes producer and consumer calls to them.
///
/// Queues are created lazily on first use and cached for the manager's lifetime.
pub struct QueueManager {
    driver: QueueDriver,
    defaults: JobOptions,
    events: QueueEvents,
    queues: RwLock<HashMap<String, Arc<dyn QueueBackend>>>,
    shut_down: AtomicBool,
}

impl QueueManager {
    /// Manager backed by process-local queues.
    pub fn in_memory() -> Self {
        Self::with_driver(QueueDriver::Memory)
    }

    /// Manager backed by Redis. Fails if the server does not answer `PING`.
    pub async fn redis(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .with_error_code(ErrorCode::InvalidConfiguration)?;
        let mut conn = redis::aio::ConnectionManager::new(client).await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::info!(
            url = %SensitiveFieldRedactor::global().redact_value(&config.url),
            response = %pong,
            "Connected to Redis"
        );

        Ok(Self::with_driver(QueueDriver::Redis {
            conn,
            key_prefix: config.key_prefix.clone(),
            workers: WorkerConfig {
                concurrency: config.concurrency,
                poll_interval_ms: config.poll_interval_ms,
            },
        }))
    }

    /// Pick the backend from configuration: Redis when configured, memory otherwise.
    pub async fn from_config(redis: Option<&RedisConfig>, queue: &QueueSettings) -> Result<Self> {
        let manager = match redis {
            Some(config) => Self::redis(config).await?,
            None => Self::in_memory(),
        };
        Ok(manager.with_defaults(
            JobOptions::default()
                .with_max_attempts(queue.default_max_attempts)
                .with_backoff(queue.default_backoff.clone()),
        ))
    }

    fn with_driver(driver: QueueDriver) -> Self {
        Self {
            driver,
            defaults: JobOptions::default(),
            events: QueueEvents::new(),
            queues: RwLock::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Options applied by [`add_job`](Self::add_job) when none are given.
    pub fn with_defaults(mut self, defaults: JobOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn backend_kind(&self) -> BackendKind {
        match self.driver {
            QueueDriver::Memory => BackendKind::Memory,
            QueueDriver::Redis { .. } => BackendKind::Redis,
        }
    }

    pub fn events(&self) -> &QueueEvents {
        &self.events
    }

    /// Register a listener for job lifecycle events.
    pub async fn add_listener(&self, listener: Arc<dyn QueueEventListener>) {
        self.events.subscribe(listener).await;
    }

    /// Register the default logging and metrics listener.
    pub async fn with_tracing_listener(self) -> Self {
        self.events.subscribe(Arc::new(TracingEventListener)).await;
        self
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(CourierError::queue_shut_down(name));
        }
        if name.is_empty() {
            return Err(CourierError::validation("Queue name must not be empty"));
        }
        Ok(())
    }

    /// The queue for `name`, created and cached on first use. Only producers
    /// and consumers create queues.
    async fn queue(&self, name: &str) -> Result<Arc<dyn QueueBackend>> {
        self.check_name(name)?;

        if let Some(queue) = self.queues.read().await.get(name) {
            return Ok(queue.clone());
        }

        let mut queues = self.queues.write().await;
        let queue = queues
            .entry(name.to_string())
            .or_insert_with(|| self.create_backend(name))
            .clone();
        Ok(queue)
    }

    /// The queue for `name` for a read or housekeeping call; never cached.
    ///
    /// An unknown in-process queue holds nothing, so there is nothing to
    /// return. A Redis queue may have been filled by another process, so an
    /// uncached handle over its keys is returned instead.
    async fn lookup(&self, name: &str) -> Result<Option<Arc<dyn QueueBackend>>> {
        self.check_name(name)?;

        if let Some(queue) = self.queues.read().await.get(name) {
            return Ok(Some(queue.clone()));
        }
        Ok(match self.driver {
            QueueDriver::Memory => None,
            QueueDriver::Redis { .. } => Some(self.create_backend(name)),
        })
    }

    fn create_backend(&self, name: &str) -> Arc<dyn QueueBackend> {
        tracing::debug!(queue = %name, backend = %self.backend_kind(), "Creating queue");
        match &self.driver {
            QueueDriver::Memory => Arc::new(InMemoryQueueBackend::new(name, self.events.clone())),
            QueueDriver::Redis {
                conn,
                key_prefix,
                workers,
            } => Arc::new(RedisQueueBackend::new(
                conn.clone(),
                name,
                key_prefix,
                workers.clone(),
                self.events.clone(),
            )),
        }
    }

    /// Enqueue a job. Returns once the job is stored; the handler runs later.
    pub async fn add_job(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: Option<JobOptions>,
    ) -> Result<Job> {
        let options = options.unwrap_or_else(|| self.defaults.clone());
        self.queue(queue).await?.enqueue(payload, options).await
    }

    /// Bind the handler for `queue` and start its workers.
    pub async fn process(&self, queue: &str, handler: Arc<dyn JobHandler>) -> Result<()> {
        self.queue(queue).await?.process(handler).await
    }

    pub async fn get_job(&self, queue: &str, id: JobId) -> Result<Option<Job>> {
        match self.lookup(queue).await? {
            Some(backend) => backend.get_job(id).await,
            None => Ok(None),
        }
    }

    /// Purge old jobs; see [`QueueBackend::clean`].
    pub async fn clean(&self, queue: &str, grace: Duration, status: Option<JobStatus>) -> Result<usize> {
        match self.lookup(queue).await? {
            Some(backend) => backend.clean(grace, status).await,
            None => Ok(0),
        }
    }

    /// Job counts for `queue`. Gauges are only exported for queues this
    /// manager has created.
    pub async fn get_status(&self, queue: &str) -> Result<QueueCounts> {
        let Some(backend) = self.lookup(queue).await? else {
            return Ok(QueueCounts::default());
        };
        let counts = backend.counts().await?;
        if self.queues.read().await.contains_key(queue) {
            QueueMetrics::record_counts(
                queue,
                counts.waiting,
                counts.active,
                counts.completed,
                counts.failed,
            );
        }
        Ok(counts)
    }

    /// Names of the queues created so far.
    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.queues.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every queue's workers after their in-flight jobs. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let queues: Vec<_> = self.queues.read().await.values().cloned().collect();
        for queue in queues {
            if let Err(e) = queue.shutdown().await {
                tracing::error!(queue = %queue.name(), error = %e, "Queue shutdown failed");
            }
        }
        tracing::info!("Queue manager shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::handler_fn;
    use serde_json::json;

    #[tokio::test]
    async fn test_queues_are_cached_per_name() {
        let manager = QueueManager::in_memory();
        let job = manager.add_job("a", json!(1), None).await.unwrap();

        assert!(manager.get_job("a", job.id).await.unwrap().is_some());
        assert!(manager.get_job("b", job.id).await.unwrap().is_none());
        assert_eq!(manager.queue_names().await, vec!["a"]);
        assert_eq!(manager.backend_kind(), BackendKind::Memory);
    }

    #[tokio::test]
    async fn test_reads_of_unknown_queues_create_nothing() {
        let manager = QueueManager::in_memory();
        manager.add_job("orders", json!(1), None).await.unwrap();

        for i in 0..100 {
            let name = format!("typo-{}", i);
            assert_eq!(manager.get_status(&name).await.unwrap(), QueueCounts::default());
            assert!(manager.get_job(&name, JobId::new()).await.unwrap().is_none());
            assert_eq!(manager.clean(&name, Duration::ZERO, None).await.unwrap(), 0);
        }

        assert_eq!(manager.queue_names().await, vec!["orders"]);
        assert_eq!(manager.get_status("orders").await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_defaults_apply_when_no_options_given() {
        let manager = QueueManager::in_memory().with_defaults(JobOptions::default().with_max_attempts(7));
        let job = manager.add_job("q", json!(null), None).await.unwrap();
        assert_eq!(job.max_attempts(), 7);

        let job = manager
            .add_job("q", json!(null), Some(JobOptions::default().with_max_attempts(1)))
            .await
            .unwrap();
        assert_eq!(job.max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let manager = QueueManager::in_memory();
        manager.add_job("q", json!(1), None).await.unwrap();
        manager.add_job("q", json!(2), None).await.unwrap();

        let counts = manager.get_status("q").await.unwrap();
        assert_eq!(counts, QueueCounts { waiting: 2, ..Default::default() });
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let manager = QueueManager::in_memory();
        manager.process("q", handler_fn(|_| async { Ok(()) })).await.unwrap();
        manager.shutdown().await.unwrap();
        manager.shutdown().await.unwrap();

        let err = manager.add_job("q", json!(1), None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::QueueShutDown);
    }

    #[tokio::test]
    async fn test_empty_queue_name_is_rejected() {
        let manager = QueueManager::in_memory();
        let err = manager.add_job("", json!(1), None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }
}
