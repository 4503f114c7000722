//! API request handlers.
//!
//! All handlers return `Result<impl IntoResponse, CourierError>` so errors map
//! to HTTP status codes through the `IntoResponse` impl on `CourierError`.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::{ApiResponse, AppState};
use crate::error::CourierError;
use crate::jobs::{BackendKind, JobId, JobStatus, QueueCounts};
use crate::webhooks::{verify_inbound, NewSubscription, SubscriptionUpdate, WebhookSubscription};

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.manager.backend_kind(),
        "timestamp": Utc::now().to_rfc3339()
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Webhook Subscriptions
// ═══════════════════════════════════════════════════════════════════════════════

/// A subscription as listed by the API. The secret is never included.
#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookView {
    pub id: Uuid,
    pub url: String,
    pub events: Vec<String>,
    pub description: Option<String>,
    pub is_active: bool,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<WebhookSubscription> for WebhookView {
    fn from(sub: WebhookSubscription) -> Self {
        Self {
            id: sub.id,
            url: sub.url,
            events: sub.events.into_iter().collect(),
            description: sub.description,
            is_active: sub.is_active,
            metadata: sub.metadata,
            created_at: sub.created_at,
            updated_at: sub.updated_at,
        }
    }
}

pub async fn create_webhook(
    State(state): State<AppState>,
    Json(req): Json<NewSubscription>,
) -> Result<impl IntoResponse, CourierError> {
    let subscription = state.dispatcher.register(req).await?;

    // The only response besides rotation that carries the secret.
    Ok((StatusCode::CREATED, Json(ApiResponse::success(subscription))))
}

pub async fn list_webhooks(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, CourierError> {
    let views: Vec<WebhookView> = state
        .dispatcher
        .list()
        .await?
        .into_iter()
        .map(WebhookView::from)
        .collect();

    Ok(Json(ApiResponse::success(views)))
}

pub async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, CourierError> {
    let subscription = state.dispatcher.get(id).await?;
    Ok(Json(ApiResponse::success(WebhookView::from(subscription))))
}

pub async fn update_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SubscriptionUpdate>,
) -> Result<axum::response::Response, CourierError> {
    let rotated = req.rotate_secret;
    let subscription = state.dispatcher.update(id, req).await?;

    let response = if rotated {
        Json(ApiResponse::success(subscription)).into_response()
    } else {
        Json(ApiResponse::success(WebhookView::from(subscription))).into_response()
    };
    Ok(response)
}

pub async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, CourierError> {
    state.dispatcher.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_deliveries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, CourierError> {
    let deliveries = state.dispatcher.deliveries(id).await?;
    Ok(Json(ApiResponse::success(deliveries)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct TriggerEventRequest {
    pub event: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerEventResponse {
    pub event: String,
    pub enqueued: usize,
}

pub async fn trigger_event(
    State(state): State<AppState>,
    Json(req): Json<TriggerEventRequest>,
) -> Result<impl IntoResponse, CourierError> {
    let enqueued = state.dispatcher.trigger_event(&req.event, req.payload).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(TriggerEventResponse {
            event: req.event,
            enqueued,
        })),
    ))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queues
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueStatusResponse {
    pub queue: String,
    pub backend: BackendKind,
    #[serde(flatten)]
    pub counts: QueueCounts,
}

pub async fn queue_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, CourierError> {
    let counts = state.manager.get_status(&name).await?;

    Ok(Json(ApiResponse::success(QueueStatusResponse {
        queue: name,
        backend: state.manager.backend_kind(),
        counts,
    })))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, CourierError> {
    let job_id: JobId = id.parse()?;
    let job = state
        .manager
        .get_job(&name, job_id)
        .await?
        .ok_or_else(|| CourierError::job_not_found(&name, job_id))?;

    Ok(Json(ApiResponse::success(job)))
}

#[derive(Debug, Deserialize)]
pub struct CleanQueueRequest {
    /// Minimum age in milliseconds of the jobs to purge
    pub grace_ms: u64,
    /// Restrict the purge to one status
    #[serde(default)]
    pub status: Option<JobStatus>,
}

pub async fn clean_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<CleanQueueRequest>,
) -> Result<impl IntoResponse, CourierError> {
    let removed = state
        .manager
        .clean(&name, Duration::from_millis(req.grace_ms), req.status)
        .await?;

    Ok(Json(ApiResponse::success(serde_json::json!({
        "queue": name,
        "removed": removed,
    }))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Inbound
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn receive_inbound(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, CourierError> {
    let settings = state.dispatcher.settings();
    let secret = settings
        .inbound_secret
        .as_deref()
        .ok_or_else(|| CourierError::unauthorized("Inbound webhooks are not configured"))?;

    let inbound = verify_inbound(
        &headers,
        &body,
        secret,
        &settings.event_header,
        &settings.signature_header,
    )?;

    tracing::info!(event = %inbound.event, "Inbound webhook accepted");

    Ok(Json(ApiResponse::success(serde_json::json!({
        "received": true,
        "event": inbound.event,
    }))))
}
