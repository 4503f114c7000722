//! The queue backend contract and job handlers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{Job, JobId, JobOptions, JobResult, JobStatus};
use crate::error::Result;

/// Which storage and execution strategy sits behind the queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local list with one serial worker per queue
    Memory,
    /// Redis lists and sorted sets with concurrent polling workers
    Redis,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Redis => f.write_str("redis"),
        }
    }
}

/// Job counts per status. `waiting` includes jobs held back for a retry delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Processes the jobs of one queue.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> JobResult;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> JobResult {
        (self.f)(job.clone()).await
    }
}

/// Wrap an async closure as a handler.
///
/// ```rust,ignore
/// manager.process("emails", handler_fn(|job| async move {
///     send(job.payload).await.map_err(|e| JobError::new(e.to_string()))
/// })).await?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Storage and execution for one named queue.
///
/// Execution errors never surface through `enqueue`; callers observe outcomes
/// through `get_job` and `counts`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// The queue this backend serves.
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Store a new `waiting` job and wake a worker if a handler is registered.
    async fn enqueue(&self, payload: serde_json::Value, options: JobOptions) -> Result<Job>;

    /// Bind the handler and start workers. A second registration is an error.
    async fn process(&self, handler: Arc<dyn JobHandler>) -> Result<()>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>>;

    /// Purge jobs older than `grace` with the given status, or any status if
    /// `None`. Jobs in `processing` are never purged. Returns the number removed.
    async fn clean(&self, grace: Duration, status: Option<JobStatus>) -> Result<usize>;

    async fn counts(&self) -> Result<QueueCounts>;

    /// Stop the workers once their in-flight jobs finish. Later enqueues fail.
    async fn shutdown(&self) -> Result<()>;
}
