#![allow(clippy::result_large_err)]
//! # Courier Core
//!
//! Named job queues and signed webhook delivery.
//!
//! ## Architecture
//!
//! - **Jobs**: queues with an in-process backend or a durable Redis backend,
//!   retries with backoff, lifecycle events
//! - **Webhooks**: subscription registry, event fan-out through the job queue,
//!   HMAC-SHA256 signed delivery with a per-attempt delivery log
//! - **API**: REST surface over both
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;
pub mod webhooks;

pub use error::{CourierError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{CourierError, ErrorCode, ErrorContext, Result};
    pub use crate::jobs::{
        handler_fn, BackoffStrategy, Job, JobError, JobHandler, JobId, JobOptions, JobResult,
        JobStatus, QueueCounts, QueueManager,
    };
    pub use crate::webhooks::{
        compute_signature, verify_signature, NewSubscription, SubscriptionUpdate,
        WebhookDelivery, WebhookDispatcher, WebhookSubscription,
    };
}
