//! In-process queue backend.
//!
//! One ordered list per queue and one serial worker. A failed job that has
//! attempts left goes back to the tail of the list right away, behind every
//! job that was already waiting. There is no timed backoff here; the Redis
//! backend is the one that honours [`BackoffStrategy`](super::BackoffStrategy).

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::worker::{self, WorkerPool};
use super::{
    BackendKind, FailureOutcome, Job, JobHandler, JobId, JobOptions, JobStatus, QueueBackend,
    QueueCounts, QueueEvent, QueueEvents,
};
use crate::error::{CourierError, Result};

#[derive(Default)]
struct MemoryState {
    /// Waiting jobs in execution order.
    order: VecDeque<JobId>,
    /// Every job not yet cleaned, whatever its status.
    jobs: HashMap<JobId, Job>,
    handler_registered: bool,
}

impl MemoryState {
    /// Pop the head of the list and mark it processing.
    fn take_next(&mut self) -> Option<Job> {
        while let Some(id) = self.order.pop_front() {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.mark_processing();
                return Some(job.clone());
            }
        }
        None
    }
}

struct Shared {
    name: String,
    state: Mutex<MemoryState>,
    wake: Notify,
    events: QueueEvents,
}

/// Process-local queue backend with a single serial worker.
pub struct InMemoryQueueBackend {
    shared: Arc<Shared>,
    workers: WorkerPool,
}

impl InMemoryQueueBackend {
    pub fn new(name: impl Into<String>, events: QueueEvents) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(MemoryState::default()),
                wake: Notify::new(),
                events,
            }),
            workers: WorkerPool::new(),
        }
    }
}

impl Shared {
    async fn run(self: Arc<Self>, handler: Arc<dyn JobHandler>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        tracing::info!(queue = %self.name, "In-memory worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = self.state.lock().await.take_next();
            let Some(job) = next else {
                if !worker::idle(&mut shutdown, self.wake.notified()).await {
                    break;
                }
                continue;
            };

            let attempt = job.attempts + 1;
            self.events
                .emit(QueueEvent::Started {
                    queue: self.name.clone(),
                    job_id: job.id,
                    attempt,
                })
                .await;

            let result = worker::execute(&handler, &job).await;
            let event = self.settle(job.id, result).await;
            if let Some(event) = event {
                self.events.emit(event).await;
            }
        }

        tracing::info!(queue = %self.name, "In-memory worker stopped");
    }

    /// Record the outcome of one execution and pick the event to emit.
    async fn settle(&self, id: JobId, result: super::JobResult) -> Option<QueueEvent> {
        let mut state = self.state.lock().await;
        let MemoryState { order, jobs, .. } = &mut *state;
        let Some(job) = jobs.get_mut(&id) else {
            tracing::warn!(queue = %self.name, job_id = %id, "Job vanished while processing");
            return None;
        };

        match result {
            Ok(()) => {
                job.mark_completed();
                Some(QueueEvent::Completed {
                    queue: self.name.clone(),
                    job_id: id,
                    attempt: job.attempts + 1,
                })
            }
            Err(error) => match job.record_failure(&error) {
                FailureOutcome::Retry { .. } => {
                    let attempts = job.attempts;
                    order.push_back(id);
                    Some(QueueEvent::Retrying {
                        queue: self.name.clone(),
                        job_id: id,
                        attempts,
                        delay: Duration::ZERO,
                        error: error.to_string(),
                    })
                }
                FailureOutcome::Failed => Some(QueueEvent::Failed {
                    queue: self.name.clone(),
                    job_id: id,
                    attempts: job.attempts,
                    error: error.to_string(),
                }),
            },
        }
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn enqueue(&self, payload: serde_json::Value, options: JobOptions) -> Result<Job> {
        if self.workers.is_shut_down() {
            return Err(CourierError::queue_shut_down(&self.shared.name));
        }

        let job = Job::new(self.shared.name.clone(), payload, options);

        // Listeners see the job before the worker can pick it up.
        self.shared
            .events
            .emit(QueueEvent::Added {
                queue: self.shared.name.clone(),
                job_id: job.id,
            })
            .await;

        {
            let mut state = self.shared.state.lock().await;
            state.jobs.insert(job.id, job.clone());
            state.order.push_back(job.id);
        }
        self.shared.wake.notify_one();

        Ok(job)
    }

    async fn process(&self, handler: Arc<dyn JobHandler>) -> Result<()> {
        if self.workers.is_shut_down() {
            return Err(CourierError::queue_shut_down(&self.shared.name));
        }
        {
            let mut state = self.shared.state.lock().await;
            if state.handler_registered {
                return Err(CourierError::handler_already_registered(&self.shared.name));
            }
            state.handler_registered = true;
        }

        let task = tokio::spawn(self.shared.clone().run(handler, self.workers.subscribe()));
        self.workers.push(task).await;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.shared.state.lock().await.jobs.get(&id).cloned())
    }

    async fn clean(&self, grace: Duration, status: Option<JobStatus>) -> Result<usize> {
        let now = Utc::now();
        let mut state = self.shared.state.lock().await;

        let before = state.jobs.len();
        state.jobs.retain(|_, job| !job.is_cleanable(grace, status, now));
        let removed = before - state.jobs.len();

        if removed > 0 {
            let MemoryState { order, jobs, .. } = &mut *state;
            order.retain(|id| jobs.contains_key(id));
            tracing::debug!(queue = %self.shared.name, removed, "Cleaned jobs");
        }
        Ok(removed)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let state = self.shared.state.lock().await;
        let mut counts = QueueCounts::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Processing => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn shutdown(&self) -> Result<()> {
        self.workers.shutdown(&self.shared.name).await;
        Ok(())
    }
}
