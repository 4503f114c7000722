//! Webhook subscriptions, delivery records and the wire payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::{CourierError, Result};

/// A registered endpoint and the events it receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub url: String,
    pub events: BTreeSet<String>,
    /// Per-subscription signing key, hex encoded.
    pub secret: String,
    #[serde(default)]
    pub description: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookSubscription {
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.is_active && self.events.contains(event)
    }
}

/// Request to register a subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSubscription {
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn default_active() -> bool {
    true
}

impl NewSubscription {
    pub fn new(url: impl Into<String>, events: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            url: url.into(),
            events: events.into_iter().map(Into::into).collect(),
            description: None,
            is_active: true,
            metadata: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_url(&self.url)?;
        normalize_events(&self.events).map(|_| ())
    }
}

/// Partial update of a subscription. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionUpdate {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub events: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Replace the signing secret with a freshly generated one.
    #[serde(default)]
    pub rotate_secret: bool,
}

impl SubscriptionUpdate {
    pub fn deactivate() -> Self {
        Self {
            is_active: Some(false),
            ..Self::default()
        }
    }

    pub fn rotate() -> Self {
        Self {
            rotate_secret: true,
            ..Self::default()
        }
    }
}

/// Only `http` and `https` URLs with a host are accepted; reachability is not checked.
pub fn validate_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| CourierError::validation(format!("Invalid webhook URL: {}", e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(CourierError::validation("Webhook URL must use http or https"));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(CourierError::validation("Webhook URL must include a host"));
    }
    Ok(())
}

/// Trim event names, drop duplicates and reject an empty set.
pub fn normalize_events(events: &[String]) -> Result<BTreeSet<String>> {
    let mut set = BTreeSet::new();
    for event in events {
        let event = event.trim();
        if event.is_empty() {
            return Err(CourierError::validation("Event names must not be empty"));
        }
        set.insert(event.to_string());
    }
    if set.is_empty() {
        return Err(CourierError::validation("At least one event is required"));
    }
    Ok(set)
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(CourierError::internal(format!("Unknown delivery status: {}", other))),
        }
    }
}

/// Append-only record of one attempted webhook call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event: String,
    /// The request body as sent.
    pub payload: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub status_code: Option<u16>,
    /// Response body, truncated.
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

/// Payload of a job on the webhook queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub webhook_id: Uuid,
    pub event: String,
    pub payload: serde_json::Value,
    /// Attempt the job was enqueued for. Retries derive the live number from the job.
    pub attempt: u32,
}

/// JSON body of an outbound webhook request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookRequestBody {
    pub event: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub signature: String,
}
