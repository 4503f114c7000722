//! Configuration management.

use serde::Deserialize;

use crate::jobs::{BackoffStrategy, JobStatus};
use crate::telemetry::TelemetryConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration. Subscriptions and delivery records stay in
    /// memory when absent.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Redis configuration. Selects the durable queue backend when present.
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Queue defaults and housekeeping
    #[serde(default)]
    pub queue: QueueSettings,

    /// Webhook delivery settings
    #[serde(default)]
    pub webhooks: WebhookSettings,

    /// Logging and metrics
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Run the embedded migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix for every key the queue writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Concurrent workers per queue
    #[serde(default = "default_redis_concurrency")]
    pub concurrency: usize,

    /// Idle poll interval for workers
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            concurrency: default_redis_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Attempts granted to jobs enqueued without explicit options
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Backoff for jobs enqueued without explicit options
    #[serde(default)]
    pub default_backoff: BackoffStrategy,

    /// Interval of the periodic clean task. Zero disables it.
    #[serde(default = "default_clean_interval_secs")]
    pub clean_interval_secs: u64,

    /// Age after which completed jobs are purged
    #[serde(default = "default_completed_grace_secs")]
    pub completed_grace_secs: u64,

    /// Age after which failed jobs are purged
    #[serde(default = "default_failed_grace_secs")]
    pub failed_grace_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            default_backoff: BackoffStrategy::default(),
            clean_interval_secs: default_clean_interval_secs(),
            completed_grace_secs: default_completed_grace_secs(),
            failed_grace_secs: default_failed_grace_secs(),
        }
    }
}

impl QueueSettings {
    /// Period of the clean task, `None` when it is disabled.
    pub fn clean_interval(&self) -> Option<std::time::Duration> {
        (self.clean_interval_secs > 0).then(|| std::time::Duration::from_secs(self.clean_interval_secs))
    }

    /// Grace periods applied by the periodic clean task, per status.
    pub fn clean_targets(&self) -> [(std::time::Duration, JobStatus); 2] {
        [
            (
                std::time::Duration::from_secs(self.completed_grace_secs),
                JobStatus::Completed,
            ),
            (
                std::time::Duration::from_secs(self.failed_grace_secs),
                JobStatus::Failed,
            ),
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSettings {
    /// Queue carrying delivery jobs
    #[serde(default = "default_webhook_queue")]
    pub queue_name: String,

    /// Delivery attempts per subscription and event
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay for the durable backend
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Upper bound on the retry delay
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Outbound request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// User-Agent sent with every delivery
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Header carrying the event name
    #[serde(default = "default_event_header")]
    pub event_header: String,

    /// Header carrying the hex signature
    #[serde(default = "default_signature_header")]
    pub signature_header: String,

    /// Shared secret for `POST /api/v1/inbound`. The route rejects every
    /// request when unset.
    #[serde(default)]
    pub inbound_secret: Option<String>,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            queue_name: default_webhook_queue(),
            max_attempts: default_max_attempts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
            event_header: default_event_header(),
            signature_header: default_signature_header(),
            inbound_secret: None,
        }
    }
}

impl WebhookSettings {
    /// Exponential backoff applied to delivery jobs.
    pub fn backoff(&self) -> BackoffStrategy {
        BackoffStrategy::Exponential {
            initial_delay_ms: self.backoff_initial_ms,
            max_delay_ms: self.backoff_max_ms,
            multiplier: 2.0,
        }
    }
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_run_migrations() -> bool { true }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "courier".to_string() }
fn default_redis_concurrency() -> usize { 4 }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_max_attempts() -> u32 { 3 }
fn default_clean_interval_secs() -> u64 { 3600 }
fn default_completed_grace_secs() -> u64 { 86_400 }
fn default_failed_grace_secs() -> u64 { 7 * 86_400 }
fn default_webhook_queue() -> String { "webhooks".to_string() }
fn default_backoff_initial_ms() -> u64 { 1_000 }
fn default_backoff_max_ms() -> u64 { 60_000 }
fn default_request_timeout_secs() -> u64 { 10 }
fn default_user_agent() -> String { format!("courier/{}", env!("CARGO_PKG_VERSION")) }
fn default_event_header() -> String { "X-Webhook-Event".to_string() }
fn default_signature_header() -> String { "X-Webhook-Signature".to_string() }

impl Config {
    /// Load configuration from environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("COURIER").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("COURIER").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings that would stall workers or disable retries silently.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(redis) = &self.redis {
            anyhow::ensure!(redis.concurrency > 0, "redis.concurrency must be at least 1");
            anyhow::ensure!(
                redis.poll_interval_ms > 0,
                "redis.poll_interval_ms must be positive"
            );
            anyhow::ensure!(!redis.key_prefix.is_empty(), "redis.key_prefix must not be empty");
        }
        anyhow::ensure!(
            !self.webhooks.queue_name.is_empty(),
            "webhooks.queue_name must not be empty"
        );
        anyhow::ensure!(
            self.webhooks.request_timeout_secs > 0,
            "webhooks.request_timeout_secs must be positive"
        );
        Ok(())
    }

    /// Address the HTTP server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.redis.is_none());
        assert!(config.database.is_none());
        assert_eq!(config.webhooks.queue_name, "webhooks");
        assert_eq!(config.webhooks.max_attempts, 3);
        assert_eq!(config.webhooks.request_timeout_secs, 10);
        assert_eq!(config.webhooks.signature_header, "X-Webhook-Signature");
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_webhook_backoff_is_exponential() {
        let settings = WebhookSettings::default();
        match settings.backoff() {
            BackoffStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                ..
            } => {
                assert_eq!(initial_delay_ms, 1_000);
                assert_eq!(max_delay_ms, 60_000);
            }
            other => panic!("unexpected backoff {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = Config {
            redis: Some(RedisConfig {
                concurrency: 0,
                ..RedisConfig::default()
            }),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_clean_interval_disables_cleaner() {
        let settings = QueueSettings {
            clean_interval_secs: 0,
            ..QueueSettings::default()
        };
        assert_eq!(settings.clean_interval(), None);

        let settings = QueueSettings {
            clean_interval_secs: 30,
            ..QueueSettings::default()
        };
        assert_eq!(settings.clean_interval(), Some(std::time::Duration::from_secs(30)));
    }

    #[test]
    fn test_deserialize_partial_sections() {
        let source = config::Config::builder()
            .set_override("redis.url", "redis://cache:6379")
            .and_then(|b| b.set_override("webhooks.max_attempts", 5))
            .and_then(|b| b.build())
            .unwrap();
        let config: Config = source.try_deserialize().unwrap();

        let redis = config.redis.unwrap();
        assert_eq!(redis.url, "redis://cache:6379");
        assert_eq!(redis.key_prefix, "courier");
        assert_eq!(config.webhooks.max_attempts, 5);
        assert_eq!(config.queue.default_max_attempts, 3);
    }

    #[test]
    fn test_clean_targets() {
        let settings = QueueSettings::default();
        let targets = settings.clean_targets();
        assert_eq!(targets[0].1, JobStatus::Completed);
        assert_eq!(targets[1].0, std::time::Duration::from_secs(7 * 86_400));
    }
}
