//! Job records and the retry bookkeeping shared by every backend.
//!
//! - **Job**: the persisted record a queue hands to its handler
//! - **JobStatus**: `waiting -> processing -> {completed | waiting | failed}`
//! - **JobOptions**: per-job attempt bound and backoff
//! - **JobError**: what a handler returns when an execution fails

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{CourierError, ErrorCode, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CourierError::new(ErrorCode::InvalidFormat, format!("Invalid job id: {}", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, either fresh or awaiting a retry
    Waiting,
    /// Owned by a worker and running its handler
    Processing,
    /// Handler succeeded
    Completed,
    /// Attempts exhausted
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "processing" | "active" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(CourierError::validation(format!("Unknown job status: {}", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error returned by a handler for a failed execution.
///
/// Every handler error counts against the job's attempt budget; the queue
/// cannot tell a transient cause from a permanent one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Optional error code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<CourierError> for JobError {
    fn from(error: CourierError) -> Self {
        let message = match error.internal_message() {
            Some(internal) => format!("{}: {}", error.user_message(), internal),
            None => error.user_message().to_string(),
        };
        Self {
            message,
            code: Some(error.code().to_string()),
        }
    }
}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
///
/// Only the Redis backend waits between attempts; the in-process backend
/// re-queues a failed job at the tail immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },
    /// `initial * multiplier^(failures - 1)`, capped at `max_delay_ms`
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay before the next attempt after `failures` failed executions.
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let ms = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
                let delay = (*initial_delay_ms as f64) * multiplier.powi(exponent);
                if delay.is_finite() {
                    delay.min(*max_delay_ms as f64).max(0.0) as u64
                } else {
                    *max_delay_ms
                }
            }
        };

        Duration::from_millis(ms)
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-job execution options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total executions allowed, first attempt included. Values below 1 are treated as 1.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay policy between attempts
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
        }
    }
}

impl JobOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    fn normalized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// What happens to a job after a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `waiting`; durable backends hold it for `delay` first.
    Retry { delay: Duration },
    /// Attempts exhausted, `failed` is terminal.
    Failed,
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    /// Opaque to the queue.
    pub payload: serde_json::Value,
    pub options: JobOptions,
    /// Failed executions so far.
    pub attempts: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Start of the most recent execution.
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Set only when the job becomes `failed`.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Job {
    /// Build a fresh `waiting` job.
    pub fn new(queue_name: impl Into<String>, payload: serde_json::Value, options: JobOptions) -> Self {
        Self {
            id: JobId::new(),
            queue_name: queue_name.into(),
            payload,
            options: options.normalized(),
            attempts: 0,
            status: JobStatus::Waiting,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.options.max_attempts.max(1)
    }

    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(CourierError::from)
    }

    pub fn mark_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.processed_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    /// Count a failed execution and decide between retry and terminal failure.
    pub fn record_failure(&mut self, error: &JobError) -> FailureOutcome {
        self.attempts += 1;
        if self.attempts < self.max_attempts() {
            self.status = JobStatus::Waiting;
            FailureOutcome::Retry {
                delay: self.options.backoff.delay_for_attempt(self.attempts),
            }
        } else {
            self.status = JobStatus::Failed;
            self.finished_at = Some(Utc::now());
            self.last_error = Some(error.to_string());
            FailureOutcome::Failed
        }
    }

    /// Timestamp that `clean` compares against its grace period.
    pub fn age_reference(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.created_at)
    }

    /// Whether `clean(grace, status)` may purge this job at `now`.
    pub fn is_cleanable(&self, grace: Duration, status: Option<JobStatus>, now: DateTime<Utc>) -> bool {
        if self.status == JobStatus::Processing {
            return false;
        }
        if let Some(status) = status {
            if self.status != status {
                return false;
            }
        }
        let Ok(grace) = chrono::Duration::from_std(grace) else {
            return false;
        };
        match now.checked_sub_signed(grace) {
            Some(cutoff) => self.age_reference() <= cutoff,
            None => false,
        }
    }
}
