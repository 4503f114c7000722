//! Prometheus metrics for queue activity, webhook deliveries and errors.
//!
//! Metrics are recorded through the `metrics` facade; recording without an
//! installed recorder is a no-op, so library code and tests never need to
//! initialize anything.
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_core::telemetry::metrics::{DeliveryMetrics, QueueMetrics};
//!
//! QueueMetrics::record_event("webhooks", "completed");
//! DeliveryMetrics::record("success", std::time::Duration::from_millis(42));
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for delivery durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
}

/// Handle to the installed Prometheus recorder.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder behind it; `render` yields an empty string.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Install the Prometheus recorder and describe Courier's metrics.
///
/// # Errors
///
/// Returns an error if the buckets are invalid or a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!(
        "courier_jobs_total",
        "Queue lifecycle events by queue and event (added, started, completed, retrying, failed)"
    );
    describe_gauge!("courier_queue_jobs", "Jobs per queue and status at last status query");

    describe_counter!(
        "courier_webhook_deliveries_total",
        "Webhook delivery attempts by outcome"
    );
    describe_histogram!(
        "courier_webhook_delivery_duration_seconds",
        "Outbound webhook request duration in seconds"
    );
    describe_counter!(
        "courier_webhook_events_total",
        "Events triggered, by whether any subscription matched"
    );
    describe_counter!(
        "courier_webhook_jobs_enqueued_total",
        "Delivery jobs enqueued by triggered events"
    );

    describe_counter!("courier_errors_total", "Errors by code, category and severity");
}

/// Queue lifecycle counters.
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn record_event(queue: &str, event: &'static str) {
        counter!(
            "courier_jobs_total",
            "queue" => queue.to_string(),
            "event" => event,
        )
        .increment(1);
    }

    /// Publish the counts returned by a status query as gauges.
    pub fn record_counts(queue: &str, waiting: u64, active: u64, completed: u64, failed: u64) {
        for (status, value) in [
            ("waiting", waiting),
            ("active", active),
            ("completed", completed),
            ("failed", failed),
        ] {
            gauge!(
                "courier_queue_jobs",
                "queue" => queue.to_string(),
                "status" => status,
            )
            .set(value as f64);
        }
    }
}

/// Outbound delivery metrics.
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record(status: &'static str, duration: Duration) {
        counter!("courier_webhook_deliveries_total", "status" => status).increment(1);
        histogram!(
            "courier_webhook_delivery_duration_seconds",
            "status" => status,
        )
        .record(duration.as_secs_f64());
    }

    /// Event names come from callers, so they stay out of the label set.
    pub fn record_trigger(enqueued: usize) {
        let matched = if enqueued > 0 { "true" } else { "false" };
        counter!("courier_webhook_events_total", "matched" => matched).increment(1);
        counter!("courier_webhook_jobs_enqueued_total").increment(enqueued as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_config_defaults() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert!(!config.duration_buckets.is_empty());
    }

    #[test]
    fn test_disabled_registry_renders_empty() {
        let registry = MetricsRegistry::disabled();
        assert_eq!(registry.render(), "");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        QueueMetrics::record_event("webhooks", "added");
        QueueMetrics::record_counts("webhooks", 1, 0, 2, 0);
        DeliveryMetrics::record("failed", Duration::from_millis(5));
        DeliveryMetrics::record_trigger(2);
    }

    #[derive(Default)]
    struct LabelRecorder {
        keys: std::sync::Mutex<Vec<metrics::Key>>,
    }

    impl metrics::Recorder for LabelRecorder {
        fn describe_counter(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
        fn describe_gauge(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}
        fn describe_histogram(&self, _: metrics::KeyName, _: Option<metrics::Unit>, _: metrics::SharedString) {}

        fn register_counter(&self, key: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Counter {
            self.keys.lock().unwrap().push(key.clone());
            metrics::Counter::noop()
        }

        fn register_gauge(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Gauge {
            metrics::Gauge::noop()
        }

        fn register_histogram(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Histogram {
            metrics::Histogram::noop()
        }
    }

    #[test]
    fn test_trigger_labels_are_bounded() {
        let recorder = LabelRecorder::default();
        metrics::with_local_recorder(&recorder, || {
            for enqueued in [0, 1, 5, 0, 2] {
                DeliveryMetrics::record_trigger(enqueued);
            }
        });

        let keys = recorder.keys.lock().unwrap();
        let mut series: Vec<String> = keys
            .iter()
            .map(|key| {
                let labels: Vec<String> = key
                    .labels()
                    .map(|l| format!("{}={}", l.key(), l.value()))
                    .collect();
                format!("{}{{{}}}", key.name(), labels.join(","))
            })
            .collect();
        series.sort();
        series.dedup();

        assert_eq!(
            series,
            vec![
                "courier_webhook_events_total{matched=false}",
                "courier_webhook_events_total{matched=true}",
                "courier_webhook_jobs_enqueued_total{}",
            ]
        );
    }
}
