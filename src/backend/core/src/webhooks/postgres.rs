//! PostgreSQL implementation of the subscription store and delivery log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use super::models::{DeliveryStatus, WebhookDelivery, WebhookSubscription};
use super::store::{DeliveryLog, SubscriptionStore};
use crate::config::DatabaseConfig;
use crate::error::{CourierError, Result};

/// Subscriptions and delivery records in PostgreSQL.
#[derive(Clone)]
pub struct PgWebhookStore {
    pool: PgPool,
}

impl PgWebhookStore {
    /// Create a connection pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CourierError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    url: String,
    events: Vec<String>,
    secret: String,
    description: Option<String>,
    is_active: bool,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for WebhookSubscription {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            id: row.id,
            url: row.url,
            events: row.events.into_iter().collect(),
            secret: row.secret,
            description: row.description,
            is_active: row.is_active,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    webhook_id: Uuid,
    event: String,
    payload: String,
    attempt: i32,
    status: String,
    status_code: Option<i32>,
    response: Option<String>,
    error: Option<String>,
    duration_ms: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for WebhookDelivery {
    type Error = CourierError;

    fn try_from(row: DeliveryRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            webhook_id: row.webhook_id,
            event: row.event,
            payload: row.payload,
            attempt: row.attempt.max(0) as u32,
            status: row.status.parse()?,
            status_code: row.status_code.and_then(|c| u16::try_from(c).ok()),
            response: row.response,
            error: row.error,
            duration_ms: row.duration_ms.map(|d| d.max(0) as u64),
            created_at: row.created_at,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str =
    "id, url, events, secret, description, is_active, metadata, created_at, updated_at";

#[async_trait]
impl SubscriptionStore for PgWebhookStore {
    async fn create(&self, subscription: WebhookSubscription) -> Result<WebhookSubscription> {
        sqlx::query(
            r#"
            INSERT INTO webhook_subscriptions
                (id, url, events, secret, description, is_active, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(subscription.id)
        .bind(&subscription.url)
        .bind(subscription.events.iter().cloned().collect::<Vec<_>>())
        .bind(&subscription.secret)
        .bind(&subscription.description)
        .bind(subscription.is_active)
        .bind(&subscription.metadata)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn get(&self, id: Uuid) -> Result<Option<WebhookSubscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM webhook_subscriptions WHERE id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list(&self) -> Result<Vec<WebhookSubscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM webhook_subscriptions ORDER BY created_at, id",
            SUBSCRIPTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_active_for_event(&self, event: &str) -> Result<Vec<WebhookSubscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM webhook_subscriptions \
             WHERE is_active AND $1 = ANY(events) ORDER BY created_at, id",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(event)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update(&self, subscription: WebhookSubscription) -> Result<WebhookSubscription> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_subscriptions
            SET url = $2, events = $3, secret = $4, description = $5,
                is_active = $6, metadata = $7, updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(&subscription.url)
        .bind(subscription.events.iter().cloned().collect::<Vec<_>>())
        .bind(&subscription.secret)
        .bind(&subscription.description)
        .bind(subscription.is_active)
        .bind(&subscription.metadata)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CourierError::subscription_not_found(subscription.id));
        }
        Ok(subscription)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM webhook_subscriptions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl DeliveryLog for PgWebhookStore {
    async fn record(&self, delivery: WebhookDelivery) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries
                (id, webhook_id, event, payload, attempt, status, status_code,
                 response, error, duration_ms, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.webhook_id)
        .bind(&delivery.event)
        .bind(&delivery.payload)
        .bind(delivery.attempt as i32)
        .bind(delivery.status.as_str())
        .bind(delivery.status_code.map(i32::from))
        .bind(&delivery.response)
        .bind(&delivery.error)
        .bind(delivery.duration_ms.map(|d| d as i64))
        .bind(delivery.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_webhook(&self, webhook_id: Uuid) -> Result<Vec<WebhookDelivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            SELECT id, webhook_id, event, payload, attempt, status, status_code,
                   response, error, duration_ms, created_at
            FROM webhook_deliveries
            WHERE webhook_id = $1
            ORDER BY created_at, attempt
            "#,
        )
        .bind(webhook_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookDelivery::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_row_conversion() {
        let row = DeliveryRow {
            id: Uuid::new_v4(),
            webhook_id: Uuid::new_v4(),
            event: "order.created".into(),
            payload: "{}".into(),
            attempt: 2,
            status: "failed".into(),
            status_code: Some(503),
            response: None,
            error: Some("HTTP 503".into()),
            duration_ms: Some(12),
            created_at: Utc::now(),
        };

        let delivery = WebhookDelivery::try_from(row).unwrap();
        assert_eq!(delivery.attempt, 2);
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert_eq!(delivery.status_code, Some(503));
    }

    #[test]
    fn test_delivery_row_rejects_unknown_status() {
        let row = DeliveryRow {
            id: Uuid::new_v4(),
            webhook_id: Uuid::new_v4(),
            event: "e".into(),
            payload: "{}".into(),
            attempt: 1,
            status: "pending".into(),
            status_code: None,
            response: None,
            error: None,
            duration_ms: None,
            created_at: Utc::now(),
        };
        assert!(WebhookDelivery::try_from(row).is_err());
    }

    #[test]
    fn test_subscription_row_conversion() {
        let now = Utc::now();
        let row = SubscriptionRow {
            id: Uuid::new_v4(),
            url: "https://example.com".into(),
            events: vec!["b".into(), "a".into(), "a".into()],
            secret: "s".into(),
            description: Some("orders".into()),
            is_active: true,
            metadata: serde_json::json!({"team": "billing"}),
            created_at: now,
            updated_at: now,
        };
        let sub = WebhookSubscription::from(row);
        assert_eq!(sub.events.iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
