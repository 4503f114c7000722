//! Error handling for Courier.
//!
//! One crate error type, [`CourierError`], carries:
//! - a machine-readable [`ErrorCode`] that fixes the HTTP status, category,
//!   severity and retryability
//! - a user-facing message, kept apart from internal detail
//! - optional structured [`ErrorDetails`] and a source error
//!
//! Every constructed error is counted in `courier_errors_total`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use courier_core::error::{CourierError, ErrorCode, ErrorContext, Result};
//!
//! fn open(url: &str) -> Result<redis::Client> {
//!     redis::Client::open(url).with_error_code(ErrorCode::InvalidConfiguration)
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// A specialized Result type for Courier operations.
pub type Result<T> = std::result::Result<T, CourierError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes. Stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Queue
    JobNotFound,
    HandlerAlreadyRegistered,
    QueueShutDown,

    // Webhooks
    SubscriptionNotFound,
    DeliveryFailed,
    InvalidSignature,
    MissingSignatureHeaders,

    // Storage
    DatabaseError,
    DatabaseConnectionFailed,
    RecordNotFound,
    DuplicateRecord,
    BrokerError,
    BrokerConnectionFailed,

    // Payloads
    SerializationError,
    InvalidJson,

    // Outbound HTTP
    ExternalTimeout,
    NetworkError,

    // Caller errors
    Unauthorized,
    ValidationError,
    InvalidFormat,

    // Configuration
    ConfigurationError,
    InvalidConfiguration,

    InternalError,
}

/// Static properties of an [`ErrorCode`].
#[derive(Debug, Clone, Copy)]
struct CodeInfo {
    numeric: u32,
    status: StatusCode,
    category: &'static str,
    severity: ErrorSeverity,
    retryable: bool,
}

const fn code_info(
    numeric: u32,
    status: StatusCode,
    category: &'static str,
    severity: ErrorSeverity,
    retryable: bool,
) -> CodeInfo {
    CodeInfo {
        numeric,
        status,
        category,
        severity,
        retryable,
    }
}

impl ErrorCode {
    const fn info(&self) -> CodeInfo {
        use ErrorSeverity::{Critical, High, Low, Medium};

        match self {
            Self::JobNotFound => code_info(1000, StatusCode::NOT_FOUND, "queue", Low, false),
            Self::HandlerAlreadyRegistered => code_info(1001, StatusCode::CONFLICT, "queue", Low, false),
            Self::QueueShutDown => code_info(1002, StatusCode::SERVICE_UNAVAILABLE, "queue", Medium, false),

            Self::SubscriptionNotFound => code_info(1100, StatusCode::NOT_FOUND, "webhook", Low, false),
            Self::DeliveryFailed => code_info(1101, StatusCode::BAD_GATEWAY, "webhook", Medium, true),
            Self::InvalidSignature => code_info(1102, StatusCode::UNAUTHORIZED, "webhook", Low, false),
            Self::MissingSignatureHeaders => code_info(1103, StatusCode::UNAUTHORIZED, "webhook", Low, false),

            Self::DatabaseError => code_info(2000, StatusCode::INTERNAL_SERVER_ERROR, "storage", High, false),
            Self::DatabaseConnectionFailed => code_info(2001, StatusCode::SERVICE_UNAVAILABLE, "storage", Critical, true),
            Self::RecordNotFound => code_info(2002, StatusCode::NOT_FOUND, "storage", Low, false),
            Self::DuplicateRecord => code_info(2003, StatusCode::CONFLICT, "storage", Low, false),
            Self::BrokerError => code_info(2100, StatusCode::INTERNAL_SERVER_ERROR, "storage", High, true),
            Self::BrokerConnectionFailed => code_info(2101, StatusCode::SERVICE_UNAVAILABLE, "storage", Critical, true),

            Self::SerializationError => code_info(2200, StatusCode::INTERNAL_SERVER_ERROR, "payload", High, false),
            Self::InvalidJson => code_info(2201, StatusCode::BAD_REQUEST, "payload", Low, false),

            Self::ExternalTimeout => code_info(3000, StatusCode::GATEWAY_TIMEOUT, "outbound", Medium, true),
            Self::NetworkError => code_info(3001, StatusCode::BAD_GATEWAY, "outbound", Medium, true),

            Self::Unauthorized => code_info(4000, StatusCode::UNAUTHORIZED, "caller", Low, false),
            Self::ValidationError => code_info(4100, StatusCode::UNPROCESSABLE_ENTITY, "caller", Low, false),
            Self::InvalidFormat => code_info(4101, StatusCode::UNPROCESSABLE_ENTITY, "caller", Low, false),

            Self::ConfigurationError => code_info(5000, StatusCode::INTERNAL_SERVER_ERROR, "configuration", High, false),
            Self::InvalidConfiguration => code_info(5001, StatusCode::INTERNAL_SERVER_ERROR, "configuration", High, false),

            Self::InternalError => code_info(9000, StatusCode::INTERNAL_SERVER_ERROR, "internal", Critical, false),
        }
    }

    pub const fn numeric_code(&self) -> u32 {
        self.info().numeric
    }

    pub const fn http_status(&self) -> StatusCode {
        self.info().status
    }

    /// Whether the same call may succeed later without changes.
    pub const fn is_retryable(&self) -> bool {
        self.info().retryable
    }

    pub const fn category(&self) -> &'static str {
        self.info().category
    }

    pub const fn severity(&self) -> ErrorSeverity {
        self.info().severity
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Severity level for errors, drives the log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller mistakes: bad input, unknown ids, bad signatures
    Low,
    /// Operational trouble such as failed deliveries
    Medium,
    /// Storage or serialization faults
    High,
    /// Lost connectivity or bugs
    Critical,
}

impl ErrorSeverity {
    pub const fn from_code(code: &ErrorCode) -> Self {
        code.severity()
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured context attached to an error and returned to API clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty() && self.entity_type.is_none() && self.entity_id.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type for everything in this crate.
#[derive(Error, Debug)]
pub struct CourierError {
    code: ErrorCode,

    /// Safe to expose to clients
    user_message: Cow<'static, str>,

    /// Logged, never returned
    internal_message: Option<String>,

    details: ErrorDetails,

    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for CourierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl CourierError {
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        counter!(
            "courier_errors_total",
            "code" => code.to_string(),
            "category" => code.category(),
            "severity" => code.severity().as_str(),
            "retryable" => if code.is_retryable() { "true" } else { "false" },
        )
        .increment(1);
        error
    }

    /// Error with a user message and a separate internal one.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Internal error (500). The message is logged, not returned.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(entity_type, entity_id))
    }

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        self.details = std::mem::take(&mut self.details).with_context(key, value);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.code.severity()
    }

    /// Log at a level matching the severity. Caller errors go to `debug`.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => tracing::error!(
                error_code = %code,
                category,
                http_status = status,
                user_message = %self.user_message,
                internal_message = ?self.internal_message,
                source = ?self.source,
                "Request failed"
            ),
            ErrorSeverity::Medium => tracing::warn!(
                error_code = %code,
                category,
                http_status = status,
                user_message = %self.user_message,
                internal_message = ?self.internal_message,
                "Request failed"
            ),
            ErrorSeverity::Low => tracing::debug!(
                error_code = %code,
                category,
                http_status = status,
                user_message = %self.user_message,
                "Request rejected"
            ),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Axum Integration
// ═══════════════════════════════════════════════════════════════════════════════

/// JSON body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false
    pub success: bool,
    pub error: ErrorBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&CourierError> for ErrorResponse {
    fn from(error: &CourierError) -> Self {
        Self {
            success: false,
            error: ErrorBody {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: (!error.details.is_empty()).then(|| error.details.clone()),
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

impl IntoResponse for CourierError {
    fn into_response(self) -> Response {
        self.log();
        (self.http_status(), Json(ErrorResponse::from(&self))).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Convert foreign errors and missing values into [`CourierError`].
pub trait ErrorContext<T> {
    /// Wrap as an internal error with `message`.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap with `code`, using the foreign error's text as the message.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| CourierError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| CourierError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| CourierError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| CourierError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for CourierError {
    fn from(error: sqlx::Error) -> Self {
        let (code, message) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::RecordNotFound, "Record not found"),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                (ErrorCode::DuplicateRecord, "A record with this identifier already exists")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                (ErrorCode::DatabaseConnectionFailed, "Unable to reach the database")
            }
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };
        Self::with_internal(code, message, error.to_string()).with_source(error)
    }
}

impl From<redis::RedisError> for CourierError {
    fn from(error: redis::RedisError) -> Self {
        let code = if error.is_connection_refusal() || error.is_connection_dropped() || error.is_io_error() {
            ErrorCode::BrokerConnectionFailed
        } else {
            ErrorCode::BrokerError
        };
        Self::with_internal(code, "Queue storage is unavailable", error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(error: serde_json::Error) -> Self {
        let code = match error.classify() {
            serde_json::error::Category::Io => ErrorCode::SerializationError,
            _ => ErrorCode::InvalidJson,
        };
        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<reqwest::Error> for CourierError {
    fn from(error: reqwest::Error) -> Self {
        let (code, message) = if error.is_timeout() {
            (ErrorCode::ExternalTimeout, "Webhook endpoint timed out")
        } else if error.is_status() {
            (ErrorCode::DeliveryFailed, "Webhook endpoint returned an error status")
        } else {
            (ErrorCode::NetworkError, "Failed to reach webhook endpoint")
        };
        Self::with_internal(code, message, error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for CourierError {
    fn from(error: std::io::Error) -> Self {
        let code = match error.kind() {
            std::io::ErrorKind::TimedOut => ErrorCode::ExternalTimeout,
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset => {
                ErrorCode::NetworkError
            }
            _ => ErrorCode::InternalError,
        };
        Self::with_internal(code, "An I/O error occurred", error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for CourierError {
    fn from(error: anyhow::Error) -> Self {
        error
            .downcast::<CourierError>()
            .unwrap_or_else(|other| Self::internal(format!("{:#}", other)))
    }
}

impl From<config::ConfigError> for CourierError {
    fn from(error: config::ConfigError) -> Self {
        let code = match &error {
            config::ConfigError::FileParse { .. } | config::ConfigError::Type { .. } => {
                ErrorCode::InvalidConfiguration
            }
            _ => ErrorCode::ConfigurationError,
        };
        Self::with_internal(code, "Invalid configuration", error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl CourierError {
    pub fn job_not_found(queue: &str, job_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(
            ErrorCode::JobNotFound,
            format!("Job not found in queue '{}': {}", queue, id),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("job", id)
                .with_context("queue", queue),
        )
    }

    pub fn handler_already_registered(queue: &str) -> Self {
        Self::new(
            ErrorCode::HandlerAlreadyRegistered,
            format!("A handler is already registered for queue '{}'", queue),
        )
        .with_context("queue", queue)
    }

    pub fn queue_shut_down(queue: &str) -> Self {
        Self::new(
            ErrorCode::QueueShutDown,
            format!("Queue '{}' has been shut down", queue),
        )
        .with_context("queue", queue)
    }

    pub fn subscription_not_found(id: uuid::Uuid) -> Self {
        Self::new(
            ErrorCode::SubscriptionNotFound,
            format!("Webhook subscription not found: {}", id),
        )
        .with_details(ErrorDetails::new().with_entity("webhook", id.to_string()))
    }

    /// An outbound attempt got a non-2xx answer or no answer at all.
    pub fn delivery_failed(url: &str, reason: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::DeliveryFailed, "Webhook delivery failed", reason)
            .with_context("url", url)
    }

    pub fn invalid_signature() -> Self {
        Self::new(ErrorCode::InvalidSignature, "Webhook signature verification failed")
    }

    pub fn missing_signature_headers(missing: &str) -> Self {
        Self::new(
            ErrorCode::MissingSignatureHeaders,
            format!("Missing required webhook header: {}", missing),
        )
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_codes_are_unique() {
        use ErrorCode::*;
        let all = [
            JobNotFound, HandlerAlreadyRegistered, QueueShutDown, SubscriptionNotFound,
            DeliveryFailed, InvalidSignature, MissingSignatureHeaders, DatabaseError,
            DatabaseConnectionFailed, RecordNotFound, DuplicateRecord, BrokerError,
            BrokerConnectionFailed, SerializationError, InvalidJson, ExternalTimeout,
            NetworkError, Unauthorized, ValidationError, InvalidFormat, ConfigurationError,
            InvalidConfiguration, InternalError,
        ];
        let mut numbers: Vec<_> = all.iter().map(|c| c.numeric_code()).collect();
        numbers.sort_unstable();
        numbers.dedup();
        assert_eq!(numbers.len(), all.len());
    }

    #[test]
    fn test_code_properties() {
        assert_eq!(ErrorCode::JobNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::ValidationError.http_status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ErrorCode::MissingSignatureHeaders.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::HandlerAlreadyRegistered.http_status(), StatusCode::CONFLICT);

        assert!(ErrorCode::DeliveryFailed.is_retryable());
        assert!(ErrorCode::BrokerConnectionFailed.is_retryable());
        assert!(!ErrorCode::InvalidSignature.is_retryable());

        assert_eq!(ErrorCode::SubscriptionNotFound.category(), "webhook");
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::InvalidSignature), ErrorSeverity::Low);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::BrokerConnectionFailed), ErrorSeverity::Critical);
    }

    #[test]
    fn test_domain_constructors() {
        let error = CourierError::subscription_not_found(uuid::Uuid::new_v4());
        assert_eq!(error.code(), ErrorCode::SubscriptionNotFound);
        assert_eq!(error.details().entity_type.as_deref(), Some("webhook"));

        let error = CourierError::handler_already_registered("webhooks");
        assert!(error.user_message().contains("webhooks"));
        assert!(error.details().context.contains_key("queue"));

        let error = CourierError::delivery_failed("https://example.com", "HTTP 502");
        assert_eq!(error.internal_message(), Some("HTTP 502"));
        assert!(error.is_retryable());
    }

    #[test]
    fn test_error_response_hides_internal_message() {
        let error = CourierError::internal("pool exhausted on shard 3");
        let json = serde_json::to_string(&ErrorResponse::from(&error)).unwrap();
        assert!(json.contains("INTERNAL_ERROR"));
        assert!(!json.contains("shard 3"));
        assert!(!json.contains("\"details\""));
    }

    #[test]
    fn test_result_context() {
        let parsed: std::result::Result<u32, _> = "x".parse::<u32>();
        let error = parsed.with_error_code(ErrorCode::InvalidFormat).unwrap_err();
        assert_eq!(error.code(), ErrorCode::InvalidFormat);

        let missing: Option<u32> = None;
        assert_eq!(missing.context("no such job").unwrap_err().code(), ErrorCode::RecordNotFound);
    }

    #[test]
    fn test_json_errors_map_to_invalid_json() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(CourierError::from(err).code(), ErrorCode::InvalidJson);
    }

    #[test]
    fn test_anyhow_round_trip_keeps_code() {
        let original = CourierError::invalid_signature();
        let wrapped = anyhow::Error::from(original);
        assert_eq!(CourierError::from(wrapped).code(), ErrorCode::InvalidSignature);
    }

    #[test]
    fn test_error_display() {
        let error = CourierError::with_internal(
            ErrorCode::BrokerError,
            "Queue storage is unavailable",
            "WRONGTYPE Operation against a key holding the wrong kind of value",
        );
        let display = error.to_string();
        assert!(display.contains("BrokerError"));
        assert!(display.contains("WRONGTYPE"));
    }
}
