//! Persistence seams for subscriptions and delivery records.

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use super::models::{WebhookDelivery, WebhookSubscription};
use crate::error::{CourierError, Result};

/// CRUD over webhook subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create(&self, subscription: WebhookSubscription) -> Result<WebhookSubscription>;

    async fn get(&self, id: Uuid) -> Result<Option<WebhookSubscription>>;

    /// All subscriptions, oldest first.
    async fn list(&self) -> Result<Vec<WebhookSubscription>>;

    /// Active subscriptions whose event set contains `event`.
    async fn list_active_for_event(&self, event: &str) -> Result<Vec<WebhookSubscription>>;

    /// Replace a stored subscription. Errors if it does not exist.
    async fn update(&self, subscription: WebhookSubscription) -> Result<WebhookSubscription>;

    /// Returns `false` if nothing was deleted.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

/// Append-only log of delivery attempts.
#[async_trait]
pub trait DeliveryLog: Send + Sync {
    async fn record(&self, delivery: WebhookDelivery) -> Result<()>;

    /// Records for one subscription, in attempt order.
    async fn list_for_webhook(&self, webhook_id: Uuid) -> Result<Vec<WebhookDelivery>>;
}

/// Process-local store for both seams.
#[derive(Debug, Default)]
pub struct InMemoryWebhookStore {
    subscriptions: DashMap<Uuid, WebhookSubscription>,
    deliveries: DashMap<Uuid, Vec<WebhookDelivery>>,
}

impl InMemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryWebhookStore {
    async fn create(&self, subscription: WebhookSubscription) -> Result<WebhookSubscription> {
        if self.subscriptions.contains_key(&subscription.id) {
            return Err(CourierError::new(
                crate::error::ErrorCode::DuplicateRecord,
                format!("Webhook subscription already exists: {}", subscription.id),
            ));
        }
        self.subscriptions.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn get(&self, id: Uuid) -> Result<Option<WebhookSubscription>> {
        Ok(self.subscriptions.get(&id).map(|s| s.value().clone()))
    }

    async fn list(&self) -> Result<Vec<WebhookSubscription>> {
        let mut all: Vec<_> = self.subscriptions.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn list_active_for_event(&self, event: &str) -> Result<Vec<WebhookSubscription>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.subscribes_to(event))
            .collect())
    }

    async fn update(&self, subscription: WebhookSubscription) -> Result<WebhookSubscription> {
        match self.subscriptions.get_mut(&subscription.id) {
            Some(mut entry) => {
                *entry = subscription.clone();
                Ok(subscription)
            }
            None => Err(CourierError::subscription_not_found(subscription.id)),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.subscriptions.remove(&id).is_some())
    }
}

#[async_trait]
impl DeliveryLog for InMemoryWebhookStore {
    async fn record(&self, delivery: WebhookDelivery) -> Result<()> {
        self.deliveries
            .entry(delivery.webhook_id)
            .or_default()
            .push(delivery);
        Ok(())
    }

    async fn list_for_webhook(&self, webhook_id: Uuid) -> Result<Vec<WebhookDelivery>> {
        Ok(self
            .deliveries
            .get(&webhook_id)
            .map(|d| d.value().clone())
            .unwrap_or_default())
    }
}
