//! Subscription registry, event fan-out and signed HTTP delivery.
//!
//! `trigger_event` only enqueues one job per matching subscription on the
//! webhook queue. The [`DeliveryHandler`] bound by [`WebhookDispatcher::start`]
//! performs the POST and appends a delivery record for every attempt; a
//! non-2xx answer or a transport error fails the job so the queue's retry
//! policy applies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::models::{
    normalize_events, validate_url, DeliveryJob, DeliveryStatus, NewSubscription,
    SubscriptionUpdate, WebhookDelivery, WebhookRequestBody, WebhookSubscription,
};
use super::signature::{compute_signature, generate_secret};
use super::store::{DeliveryLog, InMemoryWebhookStore, SubscriptionStore};
use crate::config::WebhookSettings;
use crate::error::{CourierError, Result};
use crate::jobs::{Job, JobHandler, JobOptions, JobResult, QueueManager};
use crate::telemetry::DeliveryMetrics;

/// Response bodies are stored up to this many characters.
const MAX_RESPONSE_CHARS: usize = 4096;

/// Front door of the webhook subsystem.
#[derive(Clone)]
pub struct WebhookDispatcher {
    subscriptions: Arc<dyn SubscriptionStore>,
    deliveries: Arc<dyn DeliveryLog>,
    queues: Arc<QueueManager>,
    settings: WebhookSettings,
    client: Client,
}

impl WebhookDispatcher {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        deliveries: Arc<dyn DeliveryLog>,
        queues: Arc<QueueManager>,
        settings: WebhookSettings,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
            .user_agent(settings.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| CourierError::configuration(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            subscriptions,
            deliveries,
            queues,
            settings,
            client,
        })
    }

    /// Dispatcher backed by a process-local store.
    pub fn in_memory(queues: Arc<QueueManager>, settings: WebhookSettings) -> Result<Self> {
        let store = Arc::new(InMemoryWebhookStore::new());
        Self::new(store.clone(), store, queues, settings)
    }

    pub fn settings(&self) -> &WebhookSettings {
        &self.settings
    }

    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    /// Bind the delivery handler to the webhook queue.
    pub async fn start(&self) -> Result<()> {
        let handler = Arc::new(DeliveryHandler {
            subscriptions: self.subscriptions.clone(),
            deliveries: self.deliveries.clone(),
            client: self.client.clone(),
            event_header: self.settings.event_header.clone(),
            signature_header: self.settings.signature_header.clone(),
        });
        self.queues.process(&self.settings.queue_name, handler).await?;

        info!(queue = %self.settings.queue_name, "Webhook delivery started");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a subscription with a freshly generated secret.
    pub async fn register(&self, new: NewSubscription) -> Result<WebhookSubscription> {
        validate_url(&new.url)?;
        let events = normalize_events(&new.events)?;

        let now = Utc::now();
        let subscription = WebhookSubscription {
            id: Uuid::new_v4(),
            url: new.url,
            events,
            secret: generate_secret(),
            description: new.description,
            is_active: new.is_active,
            metadata: new.metadata.unwrap_or(serde_json::Value::Null),
            created_at: now,
            updated_at: now,
        };

        let subscription = self.subscriptions.create(subscription).await?;
        info!(
            webhook_id = %subscription.id,
            url = %subscription.url,
            events = subscription.events.len(),
            "Webhook registered"
        );
        Ok(subscription)
    }

    /// Apply a partial update. Takes effect for deliveries that start afterwards.
    pub async fn update(&self, id: Uuid, changes: SubscriptionUpdate) -> Result<WebhookSubscription> {
        let mut subscription = self.get(id).await?;

        if let Some(url) = changes.url {
            validate_url(&url)?;
            subscription.url = url;
        }
        if let Some(events) = changes.events {
            subscription.events = normalize_events(&events)?;
        }
        if let Some(description) = changes.description {
            subscription.description = Some(description);
        }
        if let Some(is_active) = changes.is_active {
            subscription.is_active = is_active;
        }
        if let Some(metadata) = changes.metadata {
            subscription.metadata = metadata;
        }
        if changes.rotate_secret {
            subscription.secret = generate_secret();
            info!(webhook_id = %id, "Webhook secret rotated");
        }
        subscription.updated_at = Utc::now();

        self.subscriptions.update(subscription).await
    }

    /// Remove a subscription. Its delivery history is kept.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        if !self.subscriptions.delete(id).await? {
            return Err(CourierError::subscription_not_found(id));
        }
        info!(webhook_id = %id, "Webhook deleted");
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<WebhookSubscription> {
        self.subscriptions
            .get(id)
            .await?
            .ok_or_else(|| CourierError::subscription_not_found(id))
    }

    pub async fn list(&self) -> Result<Vec<WebhookSubscription>> {
        self.subscriptions.list().await
    }

    /// Delivery records of one subscription, in attempt order.
    pub async fn deliveries(&self, webhook_id: Uuid) -> Result<Vec<WebhookDelivery>> {
        self.deliveries.list_for_webhook(webhook_id).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Fan-out
    // ─────────────────────────────────────────────────────────────────────────

    /// Enqueue one delivery job per active subscription to `event`.
    ///
    /// Returns the number of jobs enqueued. No delivery has happened yet when
    /// this returns.
    pub async fn trigger_event(&self, event: &str, payload: serde_json::Value) -> Result<usize> {
        let event = event.trim();
        if event.is_empty() {
            return Err(CourierError::validation("Event name must not be empty"));
        }

        let subscriptions = self.subscriptions.list_active_for_event(event).await?;
        if subscriptions.is_empty() {
            debug!(event = %event, "No active subscriptions match event");
            DeliveryMetrics::record_trigger(0);
            return Ok(0);
        }

        let options = JobOptions::default()
            .with_max_attempts(self.settings.max_attempts)
            .with_backoff(self.settings.backoff());

        for subscription in &subscriptions {
            let job = DeliveryJob {
                webhook_id: subscription.id,
                event: event.to_string(),
                payload: payload.clone(),
                attempt: 1,
            };
            let job = self
                .queues
                .add_job(
                    &self.settings.queue_name,
                    serde_json::to_value(&job)?,
                    Some(options.clone()),
                )
                .await?;
            debug!(
                event = %event,
                webhook_id = %subscription.id,
                job_id = %job.id,
                "Delivery enqueued"
            );
        }

        info!(event = %event, enqueued = subscriptions.len(), "Event triggered");
        DeliveryMetrics::record_trigger(subscriptions.len());
        Ok(subscriptions.len())
    }
}

/// Executes delivery jobs from the webhook queue.
pub struct DeliveryHandler {
    subscriptions: Arc<dyn SubscriptionStore>,
    deliveries: Arc<dyn DeliveryLog>,
    client: Client,
    event_header: String,
    signature_header: String,
}

#[async_trait]
impl JobHandler for DeliveryHandler {
    async fn handle(&self, job: &Job) -> JobResult {
        let task: DeliveryJob = job.payload_as()?;
        let attempt = job.attempts + 1;

        let Some(subscription) = self.subscriptions.get(task.webhook_id).await? else {
            warn!(
                target: "webhook_delivery",
                webhook_id = %task.webhook_id,
                event = %task.event,
                "Subscription no longer exists, skipping delivery"
            );
            return Ok(());
        };

        if !subscription.is_active {
            warn!(
                target: "webhook_delivery",
                webhook_id = %subscription.id,
                event = %task.event,
                "Subscription is inactive, skipping delivery"
            );
            return Ok(());
        }

        self.deliver(&subscription, &task, attempt).await?;
        Ok(())
    }
}

impl DeliveryHandler {
    /// One signed POST. Appends a delivery record whatever the outcome.
    async fn deliver(
        &self,
        subscription: &WebhookSubscription,
        task: &DeliveryJob,
        attempt: u32,
    ) -> Result<()> {
        let signature = compute_signature(&task.event, &task.payload, &subscription.secret);
        let body = serde_json::to_string(&WebhookRequestBody {
            event: task.event.clone(),
            payload: task.payload.clone(),
            timestamp: Utc::now(),
            signature: signature.clone(),
        })?;

        let start = Instant::now();
        let result = self
            .client
            .post(&subscription.url)
            .header(CONTENT_TYPE, "application/json")
            .header(self.event_header.as_str(), task.event.as_str())
            .header(self.signature_header.as_str(), signature.as_str())
            .body(body.clone())
            .send()
            .await;

        let mut record = WebhookDelivery {
            id: Uuid::new_v4(),
            webhook_id: subscription.id,
            event: task.event.clone(),
            payload: body,
            attempt,
            status: DeliveryStatus::Failed,
            status_code: None,
            response: None,
            error: None,
            duration_ms: None,
            created_at: Utc::now(),
        };

        let outcome = match result {
            Ok(response) => {
                let status = response.status();
                record.status_code = Some(status.as_u16());
                record.response = Some(
                    response
                        .text()
                        .await
                        .unwrap_or_default()
                        .chars()
                        .take(MAX_RESPONSE_CHARS)
                        .collect(),
                );
                if status.is_success() {
                    record.status = DeliveryStatus::Success;
                    Ok(())
                } else {
                    Err(format!("HTTP {}", status.as_u16()))
                }
            }
            Err(e) if e.is_timeout() => Err(format!("Request timeout: {}", e)),
            Err(e) if e.is_connect() => Err(format!("Connection failed: {}", e)),
            Err(e) => Err(format!("Request error: {}", e)),
        };

        let elapsed = start.elapsed();
        record.duration_ms = Some(elapsed.as_millis() as u64);
        if let Err(reason) = &outcome {
            record.error = Some(reason.clone());
        }
        DeliveryMetrics::record(record.status.as_str(), elapsed);

        match &outcome {
            Ok(()) => info!(
                target: "webhook_delivery",
                webhook_id = %subscription.id,
                event = %task.event,
                attempt,
                status_code = record.status_code,
                duration_ms = record.duration_ms,
                "Webhook delivered"
            ),
            Err(reason) => warn!(
                target: "webhook_delivery",
                webhook_id = %subscription.id,
                event = %task.event,
                attempt,
                status_code = record.status_code,
                error = %reason,
                "Webhook delivery attempt failed"
            ),
        }

        if let Err(e) = self.deliveries.record(record).await {
            error!(
                target: "webhook_delivery",
                webhook_id = %subscription.id,
                attempt,
                error = %e,
                "Failed to persist delivery record"
            );
        }

        outcome.map_err(|reason| CourierError::delivery_failed(&subscription.url, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde_json::json;

    fn dispatcher() -> WebhookDispatcher {
        WebhookDispatcher::in_memory(Arc::new(QueueManager::in_memory()), WebhookSettings::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_generates_secret() {
        let dispatcher = dispatcher();
        let a = dispatcher
            .register(NewSubscription::new("https://example.com/a", ["order.created"]))
            .await
            .unwrap();
        let b = dispatcher
            .register(NewSubscription::new("https://example.com/b", ["order.created"]))
            .await
            .unwrap();

        assert_eq!(a.secret.len(), 64);
        assert_ne!(a.secret, b.secret);
        assert!(a.is_active);
        assert_eq!(dispatcher.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_input() {
        let dispatcher = dispatcher();

        let err = dispatcher
            .register(NewSubscription::new("mailto:ops@example.com", ["a"]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);

        let err = dispatcher
            .register(NewSubscription::new("https://example.com", Vec::<String>::new()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_update_rotates_secret_and_keeps_other_fields() {
        let dispatcher = dispatcher();
        let sub = dispatcher
            .register(NewSubscription::new("https://example.com", ["a"]))
            .await
            .unwrap();

        let rotated = dispatcher.update(sub.id, SubscriptionUpdate::rotate()).await.unwrap();
        assert_ne!(rotated.secret, sub.secret);
        assert_eq!(rotated.url, sub.url);
        assert_eq!(rotated.events, sub.events);

        let changed = dispatcher
            .update(
                sub.id,
                SubscriptionUpdate {
                    events: Some(vec!["b".into(), "c".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(changed.secret, rotated.secret);
        assert!(changed.events.contains("b") && !changed.events.contains("a"));
    }

    #[tokio::test]
    async fn test_update_and_delete_unknown_subscription() {
        let dispatcher = dispatcher();
        let id = Uuid::new_v4();

        let err = dispatcher.update(id, SubscriptionUpdate::deactivate()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SubscriptionNotFound);

        let err = dispatcher.delete(id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::SubscriptionNotFound);
    }

    #[tokio::test]
    async fn test_trigger_with_no_matches_enqueues_nothing() {
        let dispatcher = dispatcher();
        dispatcher
            .register(NewSubscription::new("https://example.com", ["order.created"]))
            .await
            .unwrap();

        let enqueued = dispatcher.trigger_event("user.deleted", json!({})).await.unwrap();
        assert_eq!(enqueued, 0);

        let counts = dispatcher.queues().get_status("webhooks").await.unwrap();
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn test_trigger_enqueues_one_job_per_active_match() {
        let dispatcher = dispatcher();
        for url in ["https://a.example.com", "https://b.example.com"] {
            dispatcher
                .register(NewSubscription::new(url, ["order.created"]))
                .await
                .unwrap();
        }
        let inactive = dispatcher
            .register(NewSubscription::new("https://c.example.com", ["order.created"]))
            .await
            .unwrap();
        dispatcher
            .update(inactive.id, SubscriptionUpdate::deactivate())
            .await
            .unwrap();

        let enqueued = dispatcher
            .trigger_event("order.created", json!({"id": 7}))
            .await
            .unwrap();
        assert_eq!(enqueued, 2);

        // No handler bound yet, so the jobs stay waiting.
        let counts = dispatcher.queues().get_status("webhooks").await.unwrap();
        assert_eq!(counts.waiting, 2);
    }

    #[tokio::test]
    async fn test_trigger_rejects_blank_event() {
        let dispatcher = dispatcher();
        assert!(dispatcher.trigger_event("  ", json!({})).await.is_err());
    }
}
