//! Redis-backed durable queue backend.
//!
//! Layout per queue, all under `{prefix}:{queue}`:
//!
//! | key              | type   | contents                                   |
//! |------------------|--------|--------------------------------------------|
//! | `:job:{id}`      | string | JSON job record                            |
//! | `:waiting`       | list   | ids ready to run, head first               |
//! | `:active`        | list   | ids owned by a worker                      |
//! | `:delayed`       | zset   | ids waiting out a backoff, score = due ms  |
//! | `:completed`     | zset   | score = finish time ms                     |
//! | `:failed`        | zset   | score = finish time ms                     |
//!
//! A worker claims a job with `LMOVE waiting active`, so one attempt has
//! exactly one owner even with workers spread across processes.
//!
//! Jobs left in `:active` by a crashed process are not recovered.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::worker::{self, WorkerConfig, WorkerPool};
use super::{
    BackendKind, FailureOutcome, Job, JobHandler, JobId, JobOptions, JobResult, JobStatus,
    QueueBackend, QueueCounts, QueueEvent, QueueEvents,
};
use crate::error::{CourierError, Result};

/// Moves every due id from the delayed set to the tail of the waiting list.
const PROMOTE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('RPUSH', KEYS[2], id)
end
return #ids
"#;

/// Drops each id from `KEYS[1]` and deletes its record only if the id was
/// still there. An id a worker already moved to `:active` is left alone.
///
/// `ARGV[1]` is `list` or `zset`, `ARGV[2]` the job key prefix, the rest ids.
const PURGE_SCRIPT: &str = r#"
local removed = 0
for i = 3, #ARGV do
  local id = ARGV[i]
  local n
  if ARGV[1] == 'list' then
    n = redis.call('LREM', KEYS[1], 0, id)
  else
    n = redis.call('ZREM', KEYS[1], id)
  end
  if n > 0 then
    redis.call('DEL', ARGV[2] .. id)
    removed = removed + 1
  end
end
return removed
"#;

#[derive(Debug, Clone)]
struct QueueKeys {
    base: String,
    waiting: String,
    active: String,
    delayed: String,
    completed: String,
    failed: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: &str) -> Self {
        let base = format!("{}:{}", prefix, queue);
        Self {
            waiting: format!("{}:waiting", base),
            active: format!("{}:active", base),
            delayed: format!("{}:delayed", base),
            completed: format!("{}:completed", base),
            failed: format!("{}:failed", base),
            base,
        }
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.base)
    }

    fn job(&self, id: &str) -> String {
        format!("{}{}", self.job_prefix(), id)
    }
}

struct Shared {
    name: String,
    keys: QueueKeys,
    conn: ConnectionManager,
    promote: redis::Script,
    purge: redis::Script,
    events: QueueEvents,
    config: WorkerConfig,
}

/// Durable queue backend on Redis with concurrent polling workers.
pub struct RedisQueueBackend {
    shared: Arc<Shared>,
    handler_registered: AtomicBool,
    workers: WorkerPool,
}

impl RedisQueueBackend {
    /// Create a backend for `name` on an established connection.
    ///
    /// # Arguments
    /// * `conn` - A connection manager shared across queues
    /// * `key_prefix` - Namespace for every key (e.g. `"courier"`)
    /// * `config` - Worker concurrency and poll interval
    pub fn new(
        conn: ConnectionManager,
        name: impl Into<String>,
        key_prefix: &str,
        config: WorkerConfig,
        events: QueueEvents,
    ) -> Self {
        let name = name.into();
        Self {
            shared: Arc::new(Shared {
                keys: QueueKeys::new(key_prefix, &name),
                name,
                conn,
                promote: redis::Script::new(PROMOTE_SCRIPT),
                purge: redis::Script::new(PURGE_SCRIPT),
                events,
                config,
            }),
            handler_registered: AtomicBool::new(false),
            workers: WorkerPool::new(),
        }
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl Shared {
    async fn load(&self, id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.keys.job(id))
            .query_async(&mut conn)
            .await?;
        raw.map(|s| serde_json::from_str(&s).map_err(CourierError::from))
            .transpose()
    }

    async fn store(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.keys.job(&job.id.to_string()))
            .arg(serde_json::to_string(job)?)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Promote due retries, then claim the head of the waiting list.
    async fn claim(&self) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();

        self.promote
            .key(&self.keys.delayed)
            .key(&self.keys.waiting)
            .arg(now_ms())
            .invoke_async::<_, i64>(&mut conn)
            .await?;

        loop {
            let id: Option<String> = redis::cmd("LMOVE")
                .arg(&self.keys.waiting)
                .arg(&self.keys.active)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            let Some(id) = id else {
                return Ok(None);
            };

            match self.load(&id).await? {
                Some(mut job) => {
                    job.mark_processing();
                    self.store(&job).await?;
                    return Ok(Some(job));
                }
                None => {
                    // cleaned while waiting
                    redis::cmd("LREM")
                        .arg(&self.keys.active)
                        .arg(1)
                        .arg(&id)
                        .query_async::<_, i64>(&mut conn)
                        .await?;
                }
            }
        }
    }

    /// Persist the outcome and move the id out of the active list in one transaction.
    async fn settle(&self, mut job: Job, result: JobResult) -> Result<QueueEvent> {
        let id = job.id.to_string();
        let mut pipe = redis::pipe();
        pipe.atomic();

        let event = match result {
            Ok(()) => {
                let attempt = job.attempts + 1;
                job.mark_completed();
                pipe.cmd("ZADD")
                    .arg(&self.keys.completed)
                    .arg(now_ms())
                    .arg(&id)
                    .ignore();
                QueueEvent::Completed {
                    queue: self.name.clone(),
                    job_id: job.id,
                    attempt,
                }
            }
            Err(error) => match job.record_failure(&error) {
                FailureOutcome::Retry { delay } => {
                    pipe.cmd("ZADD")
                        .arg(&self.keys.delayed)
                        .arg(now_ms() + delay.as_millis() as i64)
                        .arg(&id)
                        .ignore();
                    QueueEvent::Retrying {
                        queue: self.name.clone(),
                        job_id: job.id,
                        attempts: job.attempts,
                        delay,
                        error: error.to_string(),
                    }
                }
                FailureOutcome::Failed => {
                    pipe.cmd("ZADD")
                        .arg(&self.keys.failed)
                        .arg(now_ms())
                        .arg(&id)
                        .ignore();
                    QueueEvent::Failed {
                        queue: self.name.clone(),
                        job_id: job.id,
                        attempts: job.attempts,
                        error: error.to_string(),
                    }
                }
            },
        };

        pipe.cmd("SET")
            .arg(self.keys.job(&id))
            .arg(serde_json::to_string(&job)?)
            .ignore()
            .cmd("LREM")
            .arg(&self.keys.active)
            .arg(1)
            .arg(&id)
            .ignore();

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(event)
    }

    async fn run(
        self: Arc<Self>,
        worker_id: usize,
        handler: Arc<dyn JobHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(queue = %self.name, worker_id, "Redis worker started");
        let poll_interval = self.config.poll_interval();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let job = match self.claim().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    if !worker::idle(&mut shutdown, tokio::time::sleep(poll_interval)).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::error!(queue = %self.name, worker_id, error = %e, "Failed to claim job");
                    if !worker::idle(&mut shutdown, tokio::time::sleep(poll_interval)).await {
                        break;
                    }
                    continue;
                }
            };

            let job_id = job.id;
            self.events
                .emit(QueueEvent::Started {
                    queue: self.name.clone(),
                    job_id,
                    attempt: job.attempts + 1,
                })
                .await;

            let result = worker::execute(&handler, &job).await;
            match self.settle(job, result).await {
                Ok(event) => self.events.emit(event).await,
                Err(e) => tracing::error!(
                    queue = %self.name,
                    job_id = %job_id,
                    error = %e,
                    "Failed to record job outcome"
                ),
            }
        }

        tracing::info!(queue = %self.name, worker_id, "Redis worker stopped");
    }

    async fn ids_in_zset_before(&self, key: &str, cutoff_ms: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff_ms)
            .query_async(&mut conn)
            .await?;
        Ok(ids)
    }

    /// Remove the given ids from `key` and drop their records. Returns how many
    /// were still in `key` when the script ran.
    async fn purge(&self, key: &str, is_list: bool, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut invocation = self.purge.key(key);
        invocation
            .arg(if is_list { "list" } else { "zset" })
            .arg(self.keys.job_prefix());
        for id in ids {
            invocation.arg(id);
        }
        let mut conn = self.conn.clone();
        let removed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(usize::try_from(removed).unwrap_or_default())
    }

    /// Waiting jobs have no finish time, so their records decide eligibility.
    async fn clean_waiting(&self, grace: Duration) -> Result<usize> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let mut removed = 0;

        let listed: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.keys.waiting)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        let delayed: Vec<String> = redis::cmd("ZRANGE")
            .arg(&self.keys.delayed)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        for (key, ids, is_list) in [
            (&self.keys.waiting, listed, true),
            (&self.keys.delayed, delayed, false),
        ] {
            let mut stale = Vec::new();
            let unique: HashSet<String> = ids.into_iter().collect();
            for id in unique {
                match self.load(&id).await? {
                    Some(job) if job.is_cleanable(grace, Some(JobStatus::Waiting), now) => stale.push(id),
                    Some(_) => {}
                    None => stale.push(id),
                }
            }
            removed += self.purge(key, is_list, &stale).await?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn enqueue(&self, payload: serde_json::Value, options: JobOptions) -> Result<Job> {
        if self.workers.is_shut_down() {
            return Err(CourierError::queue_shut_down(&self.shared.name));
        }

        let job = Job::new(self.shared.name.clone(), payload, options);
        let id = job.id.to_string();

        let mut conn = self.shared.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.shared.keys.job(&id))
            .arg(serde_json::to_string(&job)?)
            .ignore()
            .cmd("RPUSH")
            .arg(&self.shared.keys.waiting)
            .arg(&id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        self.shared
            .events
            .emit(QueueEvent::Added {
                queue: self.shared.name.clone(),
                job_id: job.id,
            })
            .await;

        Ok(job)
    }

    async fn process(&self, handler: Arc<dyn JobHandler>) -> Result<()> {
        if self.workers.is_shut_down() {
            return Err(CourierError::queue_shut_down(&self.shared.name));
        }
        if self.handler_registered.swap(true, Ordering::SeqCst) {
            return Err(CourierError::handler_already_registered(&self.shared.name));
        }

        for worker_id in 0..self.shared.config.concurrency.max(1) {
            let task = tokio::spawn(self.shared.clone().run(
                worker_id,
                handler.clone(),
                self.workers.subscribe(),
            ));
            self.workers.push(task).await;
        }
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.shared.load(&id.to_string()).await
    }

    async fn clean(&self, grace: Duration, status: Option<JobStatus>) -> Result<usize> {
        let grace_ms = i64::try_from(grace.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms().saturating_sub(grace_ms);
        let mut removed = 0;

        if matches!(status, None | Some(JobStatus::Completed)) {
            let ids = self.shared.ids_in_zset_before(&self.shared.keys.completed, cutoff).await?;
            removed += self.shared.purge(&self.shared.keys.completed, false, &ids).await?;
        }
        if matches!(status, None | Some(JobStatus::Failed)) {
            let ids = self.shared.ids_in_zset_before(&self.shared.keys.failed, cutoff).await?;
            removed += self.shared.purge(&self.shared.keys.failed, false, &ids).await?;
        }
        if matches!(status, None | Some(JobStatus::Waiting)) {
            removed += self.shared.clean_waiting(grace).await?;
        }

        tracing::debug!(queue = %self.shared.name, removed, "Cleaned jobs");
        Ok(removed)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let keys = &self.shared.keys;
        let mut conn = self.shared.conn.clone();
        let (waiting, active, delayed, completed, failed): (u64, u64, u64, u64, u64) = redis::pipe()
            .cmd("LLEN")
            .arg(&keys.waiting)
            .cmd("LLEN")
            .arg(&keys.active)
            .cmd("ZCARD")
            .arg(&keys.delayed)
            .cmd("ZCARD")
            .arg(&keys.completed)
            .cmd("ZCARD")
            .arg(&keys.failed)
            .query_async(&mut conn)
            .await?;

        Ok(QueueCounts {
            waiting: waiting + delayed,
            active,
            completed,
            failed,
        })
    }

    async fn shutdown(&self) -> Result<()> {
        self.workers.shutdown(&self.shared.name).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{handler_fn, BackoffStrategy, JobError};
    use serde_json::json;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new("courier", "webhooks");
        assert_eq!(keys.waiting, "courier:webhooks:waiting");
        assert_eq!(keys.delayed, "courier:webhooks:delayed");
        assert_eq!(keys.job("abc"), "courier:webhooks:job:abc");
    }

    async fn connect(queue: &str) -> RedisQueueBackend {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let client = redis::Client::open(url).unwrap();
        let conn = ConnectionManager::new(client).await.unwrap();
        let prefix = format!("courier-test-{}", uuid::Uuid::new_v4());
        RedisQueueBackend::new(
            conn,
            queue,
            &prefix,
            WorkerConfig {
                concurrency: 2,
                poll_interval_ms: 10,
            },
            QueueEvents::new(),
        )
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_retry_with_backoff_then_complete() {
        let backend = connect("retry").await;
        let job = backend
            .enqueue(
                json!({"n": 1}),
                JobOptions::default()
                    .with_max_attempts(3)
                    .with_backoff(BackoffStrategy::fixed(Duration::from_millis(50))),
            )
            .await
            .unwrap();

        backend
            .process(handler_fn(|job: Job| async move {
                if job.attempts == 0 {
                    Err(JobError::new("first attempt fails"))
                } else {
                    Ok(())
                }
            }))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stored = backend.get_job(job.id).await.unwrap().unwrap();
            if stored.status == JobStatus::Completed {
                assert_eq!(stored.attempts, 1);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never completed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let counts = backend.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.waiting, 0);

        backend.shutdown().await.unwrap();
        assert_eq!(backend.clean(Duration::ZERO, None).await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_exhausted_job_lands_in_failed_set() {
        let backend = connect("fail").await;
        backend
            .process(handler_fn(|_| async { Err(JobError::new("nope")) }))
            .await
            .unwrap();
        let job = backend
            .enqueue(
                json!(null),
                JobOptions::default()
                    .with_max_attempts(2)
                    .with_backoff(BackoffStrategy::fixed(Duration::from_millis(10))),
            )
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stored = backend.get_job(job.id).await.unwrap().unwrap();
            if stored.status == JobStatus::Failed {
                assert_eq!(stored.attempts, 2);
                assert_eq!(stored.last_error.as_deref(), Some("nope"));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never failed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(backend.counts().await.unwrap().failed, 1);
        backend.shutdown().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_clean_leaves_claimed_job_alone() {
        let backend = connect("claimed").await;
        let job = backend
            .enqueue(json!({"n": 1}), JobOptions::default())
            .await
            .unwrap();
        let id = job.id.to_string();

        // A worker claims the job after clean listed it as waiting.
        let claimed = backend.shared.claim().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        let removed = backend
            .shared
            .purge(&backend.shared.keys.waiting, true, &[id])
            .await
            .unwrap();
        assert_eq!(removed, 0);

        let stored = backend.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Processing);
        assert_eq!(backend.clean(Duration::ZERO, None).await.unwrap(), 0);
        assert_eq!(backend.counts().await.unwrap().active, 1);
    }
}
