//! Queue lifecycle events and their listeners.

use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use async_trait::async_trait;

use super::JobId;
use crate::error::Result;
use crate::telemetry::QueueMetrics;

/// A job state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Added {
        queue: String,
        job_id: JobId,
    },
    Started {
        queue: String,
        job_id: JobId,
        /// 1-based number of this execution
        attempt: u32,
    },
    Completed {
        queue: String,
        job_id: JobId,
        attempt: u32,
    },
    Retrying {
        queue: String,
        job_id: JobId,
        attempts: u32,
        #[serde(with = "duration_ms")]
        delay: Duration,
        error: String,
    },
    Failed {
        queue: String,
        job_id: JobId,
        attempts: u32,
        error: String,
    },
}

impl QueueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Started { .. } => "started",
            Self::Completed { .. } => "completed",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn queue(&self) -> &str {
        match self {
            Self::Added { queue, .. }
            | Self::Started { queue, .. }
            | Self::Completed { queue, .. }
            | Self::Retrying { queue, .. }
            | Self::Failed { queue, .. } => queue,
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            Self::Added { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Failed { job_id, .. } => *job_id,
        }
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Receives queue events. Errors and panics are logged and dropped.
#[async_trait]
pub trait QueueEventListener: Send + Sync {
    async fn on_event(&self, event: &QueueEvent) -> Result<()>;
}

/// Fan-out of queue events to the registered listeners.
#[derive(Clone, Default)]
pub struct QueueEvents {
    listeners: Arc<RwLock<Vec<Arc<dyn QueueEventListener>>>>,
}

impl QueueEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, listener: Arc<dyn QueueEventListener>) {
        self.listeners.write().await.push(listener);
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Deliver `event` to every listener in registration order.
    pub async fn emit(&self, event: QueueEvent) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            match AssertUnwindSafe(listener.on_event(&event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    queue = %event.queue(),
                    job_id = %event.job_id(),
                    event = event.name(),
                    error = %e,
                    "Queue event listener failed"
                ),
                Err(_) => tracing::warn!(
                    queue = %event.queue(),
                    job_id = %event.job_id(),
                    event = event.name(),
                    "Queue event listener panicked"
                ),
            }
        }
    }
}

impl std::fmt::Debug for QueueEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEvents").finish_non_exhaustive()
    }
}

/// Logs every event and counts it in `courier_jobs_total`.
#[derive(Debug, Default)]
pub struct TracingEventListener;

#[async_trait]
impl QueueEventListener for TracingEventListener {
    async fn on_event(&self, event: &QueueEvent) -> Result<()> {
        QueueMetrics::record_event(event.queue(), event.name());

        match event {
            QueueEvent::Added { queue, job_id } => {
                tracing::debug!(queue = %queue, job_id = %job_id, "Job added");
            }
            QueueEvent::Started { queue, job_id, attempt } => {
                tracing::debug!(queue = %queue, job_id = %job_id, attempt, "Job started");
            }
            QueueEvent::Completed { queue, job_id, attempt } => {
                tracing::info!(queue = %queue, job_id = %job_id, attempt, "Job completed");
            }
            QueueEvent::Retrying {
                queue,
                job_id,
                attempts,
                delay,
                error,
            } => {
                tracing::warn!(
                    queue = %queue,
                    job_id = %job_id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job failed, retrying"
                );
            }
            QueueEvent::Failed {
                queue,
                job_id,
                attempts,
                error,
            } => {
                tracing::error!(
                    queue = %queue,
                    job_id = %job_id,
                    attempts,
                    error = %error,
                    "Job failed permanently"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CourierError;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<&'static str>>);

    #[async_trait]
    impl QueueEventListener for Recorder {
        async fn on_event(&self, event: &QueueEvent) -> Result<()> {
            self.0.lock().unwrap().push(event.name());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl QueueEventListener for Failing {
        async fn on_event(&self, _event: &QueueEvent) -> Result<()> {
            Err(CourierError::internal("listener down"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl QueueEventListener for Panicking {
        async fn on_event(&self, _event: &QueueEvent) -> Result<()> {
            panic!("listener bug");
        }
    }

    #[tokio::test]
    async fn test_listener_failures_are_swallowed() {
        let events = QueueEvents::new();
        let recorder = Arc::new(Recorder::default());
        events.subscribe(Arc::new(Failing)).await;
        events.subscribe(Arc::new(Panicking)).await;
        events.subscribe(recorder.clone()).await;

        events
            .emit(QueueEvent::Added {
                queue: "q".into(),
                job_id: JobId::new(),
            })
            .await;

        assert_eq!(*recorder.0.lock().unwrap(), vec!["added"]);
        assert_eq!(events.listener_count().await, 3);
    }

    #[test]
    fn test_event_serialization() {
        let event = QueueEvent::Retrying {
            queue: "webhooks".into(),
            job_id: JobId::new(),
            attempts: 1,
            delay: Duration::from_millis(1500),
            error: "HTTP 503".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "retrying");
        assert_eq!(json["delay"], 1500);
        assert_eq!(event.queue(), "webhooks");
    }
}
