//! Named job queues with interchangeable backends.
//!
//! - **Job**: payload plus attempt bookkeeping and a status lifecycle
//! - **QueueBackend**: enqueue / process / get / clean / counts / shutdown
//! - **InMemoryQueueBackend**: one serial worker, retries go to the tail
//! - **RedisQueueBackend**: durable lists, timed backoff, concurrent workers
//! - **QueueManager**: picks the backend once and owns every named queue
//!
//! # Architecture
//!
//! ```text
//!  producer ──add_job──▶ ┌──────────────┐      ┌──────────────────────┐
//!                        │ QueueManager │─────▶│ QueueBackend (name)  │
//!  consumer ──process──▶ └──────┬───────┘      │  memory  │  redis    │
//!                               │              └────┬─────────────────┘
//!                               ▼                   │ worker loop(s)
//!                        QueueEvents ◀──────────────┘ added/started/completed/
//!                        (listeners)                  retrying/failed
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use courier_core::jobs::{handler_fn, JobError, QueueManager};
//!
//! let manager = QueueManager::in_memory().with_tracing_listener().await;
//! manager.process("emails", handler_fn(|job| async move {
//!     println!("sending {}", job.payload);
//!     Ok::<(), JobError>(())
//! })).await?;
//! manager.add_job("emails", serde_json::json!({"to": "a@example.com"}), None).await?;
//! ```

pub mod events;
pub mod job;
pub mod manager;
pub mod memory;
pub mod queue;
pub mod redis_queue;
pub mod worker;

pub use events::{QueueEvent, QueueEventListener, QueueEvents, TracingEventListener};
pub use job::{
    BackoffStrategy, FailureOutcome, Job, JobError, JobId, JobOptions, JobResult, JobStatus,
};
pub use manager::QueueManager;
pub use memory::InMemoryQueueBackend;
pub use queue::{handler_fn, BackendKind, FnHandler, JobHandler, QueueBackend, QueueCounts};
pub use redis_queue::RedisQueueBackend;
pub use worker::WorkerConfig;
