//! Worker plumbing shared by the queue backends.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::{Job, JobError, JobHandler, JobResult};

/// Configuration for polling workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent workers per queue
    pub concurrency: usize,
    /// Sleep between polls of an empty queue (milliseconds)
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 500,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// The worker tasks of one queue and the signal that stops them.
///
/// Workers check the signal between jobs only, so shutting down waits for
/// every in-flight handler to return.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Receiver a worker loop watches for the stop signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub async fn push(&self, task: JoinHandle<()>) {
        self.tasks.lock().await.push(task);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Signal every worker and wait for them to exit.
    pub async fn shutdown(&self, queue: &str) {
        self.shutdown.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(queue = %queue, error = %e, "Worker task ended abnormally");
            }
        }
    }
}

/// Wait until the pool is shut down or `wake` resolves, whichever is first.
/// Returns `false` once the worker should exit.
pub async fn idle<F>(shutdown: &mut watch::Receiver<bool>, wake: F) -> bool
where
    F: std::future::Future<Output = ()>,
{
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        _ = wake => true,
    }
}

/// Run the handler for one attempt. A panic is reported as a failed execution.
pub async fn execute(handler: &Arc<dyn JobHandler>, job: &Job) -> JobResult {
    match AssertUnwindSafe(handler.handle(job)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(JobError::new(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))
        .with_code("HANDLER_PANIC")),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
